//! WorkflowManager — owns the state registry and the per-turn pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::calendar::CalendarService;
use crate::config::FunnelConfig;
use crate::llm::LlmProvider;
use crate::store::{Record, RecordStore, Table, number_field, string_field};

use super::classifier::IntentClassifier;
use super::composer::ResponseComposer;
use super::handlers::StageHandlers;
use super::state::{ChatRole, ConversationState, LeadStatus};

const APOLOGY: &str =
    "I'm sorry, I encountered an error. Please try again or contact support.";

/// Metadata summary for a thread, for the inspection surface command.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ThreadInfo {
    pub lead_id: String,
    pub status: LeadStatus,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Coordinates conversation state, routing, stage execution, and response
/// composition for every chat thread.
///
/// The registry holds one entry per active thread. Lookup-and-create is
/// atomic (the registry lock spans the check and the insert), and each
/// state sits behind its own mutex so turns for one thread are processed
/// strictly in arrival order while distinct threads proceed in parallel.
pub struct WorkflowManager {
    registry: Mutex<HashMap<String, Arc<Mutex<ConversationState>>>>,
    store: Arc<dyn RecordStore>,
    classifier: IntentClassifier,
    handlers: StageHandlers,
    composer: ResponseComposer,
    config: FunnelConfig,
}

impl WorkflowManager {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn RecordStore>,
        calendar: Arc<dyn CalendarService>,
        config: FunnelConfig,
    ) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            classifier: IntentClassifier::new(Arc::clone(&llm), &config),
            handlers: StageHandlers::new(Arc::clone(&store), calendar, Arc::clone(&llm), &config),
            composer: ResponseComposer::new(llm, &config),
            store,
            config,
        }
    }

    /// Process one inbound message and return the reply to send back.
    ///
    /// On an unexpected internal fault the caller gets a generic apology and
    /// the state remains as of the last committed step.
    pub async fn process_message(&self, lead_id: &str, user_id: &str, text: &str) -> String {
        tracing::info!("Lead {}: processing message", lead_id);
        let entry = self.get_or_create(lead_id, user_id).await;
        let mut state = entry.lock().await;

        // Idle time is measured against the previous turn, before this
        // message refreshes the activity timestamp.
        let idle = (Utc::now() - state.last_activity).to_std().unwrap_or(Duration::ZERO);
        state.response.clear();
        state.add_message(ChatRole::User, text);

        let stage = self.classifier.classify(&state, idle).await;
        if let Err(e) = self.handlers.run(stage, &mut state, idle).await {
            tracing::error!("Lead {}: stage {} failed: {}", lead_id, stage, e);
            state.add_message(ChatRole::Assistant, APOLOGY);
            return APOLOGY.to_string();
        }

        let reply = self.composer.compose(&state).await;
        state.add_message(ChatRole::Assistant, reply.clone());

        // Best-effort: keep the persisted status current for rehydration.
        let mut status_fields = Record::new();
        status_fields.insert("status".into(), state.status.as_str().into());
        if !self.store.update(Table::Leads, lead_id, status_fields).await {
            tracing::warn!("Lead {}: failed to persist status", lead_id);
        }

        let finished = state.status.is_terminal();
        drop(state);
        if finished {
            self.evict(lead_id).await;
        }
        reply
    }

    /// Handle a thread-creation event: initialize state before any message.
    pub async fn init_thread(&self, lead_id: &str, user_id: &str) {
        let _ = self.get_or_create(lead_id, user_id).await;
    }

    /// Atomic get-or-create for a thread's state.
    async fn get_or_create(&self, lead_id: &str, user_id: &str) -> Arc<Mutex<ConversationState>> {
        let mut registry = self.registry.lock().await;
        if let Some(entry) = registry.get(lead_id) {
            return Arc::clone(entry);
        }

        let state = match self.store.get(Table::Leads, lead_id).await {
            Some(lead) => self.rehydrate(lead_id, user_id, &lead).await,
            None => {
                tracing::info!("Lead {}: creating new conversation state", lead_id);
                let state = ConversationState::new(lead_id, user_id)
                    .with_history_limit(self.config.history_limit);
                if !self.store.insert(Table::Leads, state.to_lead_record()).await {
                    tracing::warn!("Lead {}: failed to create lead record", lead_id);
                }
                if !self.store.insert(Table::Pets, state.to_pet_record()).await {
                    tracing::warn!("Lead {}: failed to create pet record", lead_id);
                }
                state
            }
        };

        let entry = Arc::new(Mutex::new(state));
        registry.insert(lead_id.to_string(), Arc::clone(&entry));
        entry
    }

    /// Rebuild state from the record store after a restart. Fidelity follows
    /// the persisted status: lead facts from `onboarded` on, pet facts from
    /// `qualified` on, appointment facts once `booked`.
    async fn rehydrate(
        &self,
        lead_id: &str,
        user_id: &str,
        lead: &Record,
    ) -> ConversationState {
        let status = string_field(lead, "status")
            .and_then(|s| LeadStatus::parse(&s))
            .unwrap_or(LeadStatus::Initiated);
        tracing::info!("Lead {}: rehydrating at status {}", lead_id, status);

        let mut state =
            ConversationState::new(lead_id, user_id).with_history_limit(self.config.history_limit);
        state.status = status;
        if let Some(created) = string_field(lead, "created_at_iso")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        {
            state.created_at = created.with_timezone(&Utc);
        }

        if status.restores_lead_facts() {
            state.customer_name = string_field(lead, "name");
            state.phone = string_field(lead, "phone");
            state.city = string_field(lead, "city");
        }

        if status.restores_pet_facts() {
            if let Some(pet) = self.store.get(Table::Pets, lead_id).await {
                state.pet_id = string_field(&pet, "pet_id").or(state.pet_id);
                state.pet_name = string_field(&pet, "pet_name");
                state.species = string_field(&pet, "species");
                state.breed = string_field(&pet, "breed");
                state.weight_kg = number_field(&pet, "weight_kg");
                state.age_years = number_field(&pet, "age_years").map(|a| a as u32);
                state.coat_condition = string_field(&pet, "coat_condition");
                state.pet_notes = string_field(&pet, "notes");
            }
        }

        if status.restores_appointment() {
            if let Some(appointment) = self.store.get(Table::Appointments, lead_id).await {
                if let Some(id) = string_field(&appointment, "appointment_id") {
                    state.restore_appointment_id(id);
                }
                state.service_id = string_field(&appointment, "service_id");
            }
        }

        state
    }

    async fn evict(&self, lead_id: &str) {
        if self.registry.lock().await.remove(lead_id).is_some() {
            tracing::info!("Lead {}: conversation finished, evicting state", lead_id);
        }
    }

    // ── Surface commands (store passthroughs, outside the state machine) ──

    /// Snapshot the in-memory state of a thread, if any.
    pub async fn thread_info(&self, lead_id: &str) -> Option<ThreadInfo> {
        let entry = {
            let registry = self.registry.lock().await;
            registry.get(lead_id).cloned()
        }?;
        let state = entry.lock().await;
        Some(ThreadInfo {
            lead_id: state.lead_id.clone(),
            status: state.status,
            message_count: state.history_len(),
            created_at: state.created_at,
            last_activity: state.last_activity,
        })
    }

    /// Read a raw record.
    pub async fn get_record(&self, table: Table, key: &str) -> Option<Record> {
        self.store.get(table, key).await
    }

    /// Patch fields on a raw record.
    pub async fn set_record_fields(&self, table: Table, key: &str, fields: Record) -> bool {
        self.store.update(table, key, fields).await
    }
}
