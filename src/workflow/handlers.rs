//! Stage handlers — one per stage, dispatched exhaustively.
//!
//! Every handler is idempotent and commits all-or-nothing: it mutates a
//! scratch copy of the state which only replaces the real one on success.
//! Expected "missing data" conditions never error; they keep the lead in a
//! collecting status. Collaborator failures degrade to skip-and-continue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use regex::Regex;

use crate::calendar::CalendarService;
use crate::config::FunnelConfig;
use crate::error::WorkflowError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, retry::complete_with_attempts};
use crate::store::{RecordStore, ServiceRecord, Table};

use super::extractor::FieldExtractor;
use super::stage::Stage;
use super::state::{ConversationState, LeadStatus, generate_id};

const BRAND_FALLBACK: &str =
    "I'm sorry, I couldn't look that up right now. Please try again in a moment.";

/// Executes the stage a turn was routed to.
pub struct StageHandlers {
    store: Arc<dyn RecordStore>,
    calendar: Arc<dyn CalendarService>,
    llm: Arc<dyn LlmProvider>,
    extractor: FieldExtractor,
    stall_threshold: Duration,
    slot_duration: Duration,
    llm_attempts: u32,
}

impl StageHandlers {
    pub fn new(
        store: Arc<dyn RecordStore>,
        calendar: Arc<dyn CalendarService>,
        llm: Arc<dyn LlmProvider>,
        config: &FunnelConfig,
    ) -> Self {
        Self {
            store,
            calendar,
            extractor: FieldExtractor::new(Arc::clone(&llm), config),
            llm,
            stall_threshold: config.stall_threshold,
            slot_duration: config.slot_duration,
            llm_attempts: config.llm_attempts,
        }
    }

    /// Run one handler against the state. On error the state is untouched.
    pub async fn run(
        &self,
        stage: Stage,
        state: &mut ConversationState,
        idle: Duration,
    ) -> Result<(), WorkflowError> {
        tracing::info!("Lead {}: running stage {}", state.lead_id, stage);
        let mut scratch = state.clone();
        match stage {
            Stage::QualifyLead => self.qualify_lead(&mut scratch).await?,
            Stage::CollectDetails => self.collect_details(&mut scratch).await?,
            Stage::ShowServices => self.show_services(&mut scratch).await?,
            Stage::BookAppointment => self.book_appointment(&mut scratch).await?,
            Stage::ProvideBrandInfo => self.provide_brand_info(&mut scratch).await?,
            Stage::FollowUp => self.follow_up(&mut scratch, idle)?,
            Stage::GenerateResponse => {}
        }
        *state = scratch;
        Ok(())
    }

    /// Start the funnel: ensure records exist, then ask for what's missing.
    async fn qualify_lead(&self, state: &mut ConversationState) -> Result<(), WorkflowError> {
        match state.status {
            LeadStatus::Initiated | LeadStatus::Onboarded => {
                self.ensure_lead_record(state).await;
                state.update_status(LeadStatus::Qualifying)?;
            }
            LeadStatus::Qualifying | LeadStatus::CollectingDetails => {}
            LeadStatus::Stalled => {
                state.update_status(LeadStatus::Qualifying)?;
            }
            // Already past qualification — nothing to do.
            _ => return Ok(()),
        }

        if !state.missing_lead_fields().is_empty() || !state.missing_pet_fields().is_empty() {
            state.update_status(LeadStatus::CollectingDetails)?;
        }
        Ok(())
    }

    /// Extract fields from the conversation and qualify when complete.
    async fn collect_details(&self, state: &mut ConversationState) -> Result<(), WorkflowError> {
        match state.status {
            LeadStatus::Initiated | LeadStatus::Onboarded => {
                // First message already carried details; open the funnel first.
                self.ensure_lead_record(state).await;
                state.update_status(LeadStatus::Qualifying)?;
            }
            LeadStatus::Stalled => {
                state.update_status(LeadStatus::CollectingDetails)?;
            }
            LeadStatus::Qualifying | LeadStatus::CollectingDetails | LeadStatus::Qualified => {}
            // Past the collection phase — nothing to collect.
            _ => return Ok(()),
        }

        let extracted = self.extractor.extract(state).await;
        let updated = extracted.apply_to(state);
        if !updated.is_empty() {
            tracing::info!("Lead {}: extracted {}", state.lead_id, updated.join(", "));
        }

        if state.is_qualified() {
            state.update_status(LeadStatus::Qualified)?;
            if !self
                .store
                .update(Table::Leads, &state.lead_id, state.to_lead_record())
                .await
            {
                tracing::warn!("Lead {}: failed to update lead record", state.lead_id);
            }
            self.upsert_pet_record(state).await;
        } else {
            state.update_status(LeadStatus::CollectingDetails)?;
        }
        Ok(())
    }

    /// Snapshot the catalog and present it.
    async fn show_services(&self, state: &mut ConversationState) -> Result<(), WorkflowError> {
        match state.status {
            LeadStatus::ShowingServices => {
                // Already presented; refresh activity only.
                state.update_status(LeadStatus::ShowingServices)?;
                return Ok(());
            }
            LeadStatus::Qualified | LeadStatus::Stalled => {}
            _ => return Ok(()),
        }

        if !state.is_qualified() {
            // Validation failed after the fact — go back to collecting.
            if state.status.can_transition_to(LeadStatus::CollectingDetails) {
                state.update_status(LeadStatus::CollectingDetails)?;
            }
            return Ok(());
        }

        let services: Vec<ServiceRecord> = self
            .store
            .list(Table::Services)
            .await
            .iter()
            .filter_map(ServiceRecord::from_record)
            .collect();

        if services.is_empty() {
            tracing::warn!("Lead {}: service catalog is empty", state.lead_id);
            state.response = "I'm sorry, I'm having trouble accessing our services right \
                              now. Please try again later."
                .to_string();
            return Ok(());
        }

        state.available_services = services;
        state.update_status(LeadStatus::ShowingServices)?;
        Ok(())
    }

    /// Two-step booking: pick a service, then confirm a slot.
    async fn book_appointment(&self, state: &mut ConversationState) -> Result<(), WorkflowError> {
        match state.status {
            LeadStatus::ShowingServices => {
                let Some(service) = select_service(&state.available_services, &state.last_message)
                else {
                    // Composer re-lists the catalog and asks again.
                    return Ok(());
                };
                tracing::info!("Lead {}: selected service {}", state.lead_id, service.service_id);
                state.service_id = Some(service.service_id.clone());
                state.update_status(LeadStatus::BookingAppointment)?;
                Ok(())
            }
            LeadStatus::BookingAppointment => self.confirm_slot(state).await,
            LeadStatus::Booked => {
                state.update_status(LeadStatus::Booked)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn confirm_slot(&self, state: &mut ConversationState) -> Result<(), WorkflowError> {
        let Some(start) = parse_slot(&state.last_message) else {
            // Composer asks for a date and time.
            return Ok(());
        };

        if !self.calendar.check_availability(start, self.slot_duration).await {
            state.response = format!(
                "I'm sorry, the {} slot isn't available. Could you suggest another \
                 day or time?",
                start.format("%B %d at %H:%M")
            );
            return Ok(());
        }

        let pet = state.pet_name.as_deref().unwrap_or("Pet");
        let customer = state.customer_name.as_deref().unwrap_or("Customer");
        let summary = format!("Pet Grooming - {pet}");
        let description = format!(
            "Customer: {customer}\nPet: {pet}\nBreed: {}\nWeight: {}kg",
            state.breed.as_deref().unwrap_or("unknown"),
            state.weight_kg.unwrap_or(0.0)
        );

        let Some(event_id) = self
            .calendar
            .create_event(start, self.slot_duration, &summary, &description)
            .await
        else {
            state.response = "I'm sorry, I couldn't book that slot just now. Could we \
                              try another time?"
                .to_string();
            return Ok(());
        };

        state.set_appointment_id(generate_id("APT"))?;
        tracing::info!(
            "Lead {}: booked appointment {} (event {})",
            state.lead_id,
            state.appointment_id().unwrap_or_default(),
            event_id
        );

        if !self
            .store
            .insert(Table::Appointments, state.to_appointment_record())
            .await
        {
            tracing::warn!("Lead {}: failed to save appointment record", state.lead_id);
        }
        state.update_status(LeadStatus::Booked)?;
        if !self
            .store
            .update(Table::Leads, &state.lead_id, state.to_lead_record())
            .await
        {
            tracing::warn!("Lead {}: failed to update lead record", state.lead_id);
        }
        Ok(())
    }

    /// Answer a question about the business itself, bypassing the funnel.
    async fn provide_brand_info(&self, state: &mut ConversationState) -> Result<(), WorkflowError> {
        let brands = self.store.list(Table::Brands).await;
        let info = if brands.is_empty() {
            "Contact us for hours and location information.".to_string()
        } else {
            serde_json::to_string_pretty(&brands).unwrap_or_default()
        };

        let system = format!(
            "You are an AI assistant for a pet grooming business. Answer the customer's \
             question using only this business information:\n\n{info}"
        );
        let request = CompletionRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(&state.last_message),
        ])
        .with_max_tokens(512);

        state.response = match complete_with_attempts(&self.llm, request, self.llm_attempts).await
        {
            Ok(response) if !response.content.trim().is_empty() => response.content,
            Ok(_) => BRAND_FALLBACK.to_string(),
            Err(e) => {
                tracing::warn!("Lead {}: brand info reply failed: {}", state.lead_id, e);
                BRAND_FALLBACK.to_string()
            }
        };
        // Status is deliberately untouched; this stage is terminal for the turn.
        state.update_status(state.status)?;
        Ok(())
    }

    /// Mark an inactive lead as stalled.
    fn follow_up(
        &self,
        state: &mut ConversationState,
        idle: Duration,
    ) -> Result<(), WorkflowError> {
        if idle > self.stall_threshold && state.status.is_active() {
            state.update_status(LeadStatus::Stalled)?;
        }
        Ok(())
    }

    /// Insert skeleton lead and pet rows on first contact. Failures are
    /// logged and skipped; the store is rewritten on qualification anyway.
    async fn ensure_lead_record(&self, state: &ConversationState) {
        if self.store.get(Table::Leads, &state.lead_id).await.is_some() {
            return;
        }
        if !self.store.insert(Table::Leads, state.to_lead_record()).await {
            tracing::warn!("Lead {}: failed to create lead record", state.lead_id);
        }
        if !self.store.insert(Table::Pets, state.to_pet_record()).await {
            tracing::warn!("Lead {}: failed to create pet record", state.lead_id);
        }
    }

    async fn upsert_pet_record(&self, state: &ConversationState) {
        let ok = if self.store.get(Table::Pets, &state.lead_id).await.is_some() {
            self.store
                .update(Table::Pets, &state.lead_id, state.to_pet_record())
                .await
        } else {
            self.store.insert(Table::Pets, state.to_pet_record()).await
        };
        if !ok {
            tracing::warn!("Lead {}: failed to save pet record", state.lead_id);
        }
    }
}

/// Match the customer's message against the presented catalog, by title or id.
fn select_service<'a>(services: &'a [ServiceRecord], message: &str) -> Option<&'a ServiceRecord> {
    let message = message.to_lowercase();
    services.iter().find(|s| {
        message.contains(&s.title.to_lowercase()) || message.contains(&s.service_id.to_lowercase())
    })
}

/// Pull a `YYYY-MM-DD HH:MM` slot out of free text.
fn parse_slot(message: &str) -> Option<DateTime<Utc>> {
    let re = Regex::new(r"(\d{4})-(\d{2})-(\d{2})(?:[T ]+)(\d{1,2}):(\d{2})").ok()?;
    let caps = re.captures(message)?;
    let date = NaiveDate::from_ymd_opt(
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    )?;
    let time = NaiveTime::from_hms_opt(caps[4].parse().ok()?, caps[5].parse().ok()?, 0)?;
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::MemoryCalendar;
    use crate::store::MemoryStore;
    use crate::workflow::ChatRole;
    use crate::workflow::testing::ScriptedLlm;
    use serde_json::json;

    fn service(id: &str, title: &str) -> ServiceRecord {
        ServiceRecord {
            service_id: id.into(),
            title: title.into(),
            description: String::new(),
            base_price: Some(50.0),
            duration_min: Some(60),
        }
    }

    fn handlers(llm: ScriptedLlm, store: Arc<MemoryStore>) -> StageHandlers {
        StageHandlers::new(
            store,
            Arc::new(MemoryCalendar::new()),
            Arc::new(llm),
            &FunnelConfig::default(),
        )
    }

    #[test]
    fn slot_parsing() {
        let slot = parse_slot("how about 2025-06-02 10:00?").unwrap();
        assert_eq!(slot.format("%Y-%m-%d %H:%M").to_string(), "2025-06-02 10:00");
        assert!(parse_slot("sometime next week").is_none());
        assert!(parse_slot("2025-13-99 10:00").is_none());
    }

    #[test]
    fn service_selection_by_title_or_id() {
        let catalog = vec![service("SVC1", "Full Groom"), service("SVC2", "Bath Only")];
        assert_eq!(
            select_service(&catalog, "I'd like the full groom please").unwrap().service_id,
            "SVC1"
        );
        assert_eq!(select_service(&catalog, "book svc2").unwrap().service_id, "SVC2");
        assert!(select_service(&catalog, "the haircut one").is_none());
    }

    #[tokio::test]
    async fn qualify_lead_creates_records_and_asks_for_details() {
        let store = Arc::new(MemoryStore::new());
        let h = handlers(ScriptedLlm::new([] as [&str; 0]), Arc::clone(&store));
        let mut state = ConversationState::new("L1", "user-1");
        state.add_message(ChatRole::User, "hi!");

        h.run(Stage::QualifyLead, &mut state, Duration::ZERO).await.unwrap();
        assert_eq!(state.status, LeadStatus::CollectingDetails);
        assert!(store.get(Table::Leads, "L1").await.is_some());
        assert!(store.get(Table::Pets, "L1").await.is_some());
    }

    #[tokio::test]
    async fn qualify_lead_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let h = handlers(ScriptedLlm::new([] as [&str; 0]), Arc::clone(&store));
        let mut state = ConversationState::new("L1", "user-1");
        state.add_message(ChatRole::User, "hi!");

        h.run(Stage::QualifyLead, &mut state, Duration::ZERO).await.unwrap();
        let snapshot = state.clone();
        h.run(Stage::QualifyLead, &mut state, Duration::ZERO).await.unwrap();

        assert_eq!(state.status, snapshot.status);
        assert_eq!(store.list(Table::Leads).await.len(), 1, "no duplicate lead rows");
    }

    #[tokio::test]
    async fn collect_details_qualifies_when_complete() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert(Table::Leads, json!({"lead_id": "L1"}).as_object().unwrap().clone())
            .await;
        let h = handlers(
            ScriptedLlm::new([r#"{"age_years": 3}"#]),
            Arc::clone(&store),
        );

        let mut state = ConversationState::new("L1", "user-1");
        state.customer_name = Some("Jane".into());
        state.phone = Some("555-1212".into());
        state.pet_name = Some("Rex".into());
        state.species = Some("Dog".into());
        state.breed = Some("Beagle".into());
        state.weight_kg = Some(12.0);
        state.status = LeadStatus::CollectingDetails;
        state.add_message(ChatRole::User, "he's 3 years old");

        h.run(Stage::CollectDetails, &mut state, Duration::ZERO).await.unwrap();
        assert_eq!(state.age_years, Some(3));
        assert_eq!(state.status, LeadStatus::Qualified);
        // Lead record reflects qualification, pet record was upserted
        let lead = store.get(Table::Leads, "L1").await.unwrap();
        assert_eq!(lead["status"], "qualified");
        assert!(store.get(Table::Pets, "L1").await.is_some());
    }

    #[tokio::test]
    async fn collect_details_survives_extraction_failure() {
        let store = Arc::new(MemoryStore::new());
        let h = handlers(ScriptedLlm::failing(), Arc::clone(&store));
        let mut state = ConversationState::new("L1", "user-1");
        state.status = LeadStatus::CollectingDetails;
        state.add_message(ChatRole::User, "garbled nonsense");

        h.run(Stage::CollectDetails, &mut state, Duration::ZERO).await.unwrap();
        assert_eq!(state.status, LeadStatus::CollectingDetails);
    }

    #[tokio::test]
    async fn show_services_snapshots_catalog() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed(
                Table::Services,
                vec![
                    json!({"service_id": "SVC1", "title": "Full Groom", "base_price": "75"})
                        .as_object()
                        .unwrap()
                        .clone(),
                ],
            )
            .await;
        let h = handlers(ScriptedLlm::new([] as [&str; 0]), Arc::clone(&store));

        let mut state = ConversationState::new("L1", "user-1");
        state.status = LeadStatus::Qualified;
        state.customer_name = Some("Jane".into());
        state.phone = Some("555".into());
        state.pet_name = Some("Rex".into());
        state.species = Some("Dog".into());
        state.breed = Some("Beagle".into());
        state.weight_kg = Some(12.0);
        state.age_years = Some(3);

        h.run(Stage::ShowServices, &mut state, Duration::ZERO).await.unwrap();
        assert_eq!(state.status, LeadStatus::ShowingServices);
        assert_eq!(state.available_services.len(), 1);
    }

    #[tokio::test]
    async fn show_services_with_empty_catalog_stays_qualified() {
        let store = Arc::new(MemoryStore::new());
        let h = handlers(ScriptedLlm::new([] as [&str; 0]), Arc::clone(&store));

        let mut state = ConversationState::new("L1", "user-1");
        state.status = LeadStatus::Qualified;
        state.customer_name = Some("Jane".into());
        state.phone = Some("555".into());
        state.pet_name = Some("Rex".into());
        state.species = Some("Dog".into());
        state.breed = Some("Beagle".into());
        state.weight_kg = Some(12.0);
        state.age_years = Some(3);

        h.run(Stage::ShowServices, &mut state, Duration::ZERO).await.unwrap();
        assert_eq!(state.status, LeadStatus::Qualified);
        assert!(state.response.contains("trouble accessing"));
    }

    #[tokio::test]
    async fn booking_happy_path() {
        let store = Arc::new(MemoryStore::new());
        let h = handlers(ScriptedLlm::new([] as [&str; 0]), Arc::clone(&store));
        store
            .insert(Table::Leads, json!({"lead_id": "L1"}).as_object().unwrap().clone())
            .await;

        let mut state = ConversationState::new("L1", "user-1");
        state.status = LeadStatus::ShowingServices;
        state.pet_name = Some("Rex".into());
        state.customer_name = Some("Jane".into());
        state.available_services = vec![service("SVC1", "Full Groom")];

        // Select a service
        state.add_message(ChatRole::User, "the Full Groom sounds great");
        h.run(Stage::BookAppointment, &mut state, Duration::ZERO).await.unwrap();
        assert_eq!(state.status, LeadStatus::BookingAppointment);
        assert_eq!(state.service_id.as_deref(), Some("SVC1"));

        // Confirm a slot
        state.add_message(ChatRole::User, "2025-06-02 10:00 works for me");
        h.run(Stage::BookAppointment, &mut state, Duration::ZERO).await.unwrap();
        assert_eq!(state.status, LeadStatus::Booked);
        let appointment_id = state.appointment_id().unwrap().to_string();
        assert!(appointment_id.starts_with("APT"));
        let row = store.get(Table::Appointments, "L1").await.unwrap();
        assert_eq!(row["appointment_id"], appointment_id.as_str());
        let lead = store.get(Table::Leads, "L1").await.unwrap();
        assert_eq!(lead["status"], "booked");
    }

    #[tokio::test]
    async fn booking_conflicting_slot_stays_in_booking() {
        let store = Arc::new(MemoryStore::new());
        let calendar = Arc::new(MemoryCalendar::new());
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        calendar.block(start, Duration::from_secs(3600)).await;
        let h = StageHandlers::new(
            store,
            calendar,
            Arc::new(ScriptedLlm::new([] as [&str; 0])),
            &FunnelConfig::default(),
        );

        let mut state = ConversationState::new("L1", "user-1");
        state.status = LeadStatus::BookingAppointment;
        state.add_message(ChatRole::User, "2025-06-02 10:00 please");

        h.run(Stage::BookAppointment, &mut state, Duration::ZERO).await.unwrap();
        assert_eq!(state.status, LeadStatus::BookingAppointment);
        assert!(state.appointment_id().is_none());
        assert!(state.response.contains("isn't available"));
    }

    #[tokio::test]
    async fn brand_info_stages_reply_without_touching_status() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed(
                Table::Brands,
                vec![
                    json!({"brand_id": "B1", "brand_name": "Pawsh", "hours": "9-5 Mon-Sat"})
                        .as_object()
                        .unwrap()
                        .clone(),
                ],
            )
            .await;
        let h = handlers(
            ScriptedLlm::new(["We're open 9-5, Monday through Saturday."]),
            store,
        );

        let mut state = ConversationState::new("L1", "user-1");
        state.status = LeadStatus::CollectingDetails;
        state.add_message(ChatRole::User, "what are your hours?");

        h.run(Stage::ProvideBrandInfo, &mut state, Duration::ZERO).await.unwrap();
        assert_eq!(state.status, LeadStatus::CollectingDetails);
        assert!(state.response.contains("9-5"));
    }

    #[tokio::test]
    async fn follow_up_stalls_idle_leads_only() {
        let store = Arc::new(MemoryStore::new());
        let h = handlers(ScriptedLlm::new([] as [&str; 0]), store);
        let mut state = ConversationState::new("L1", "user-1");
        state.status = LeadStatus::CollectingDetails;

        h.run(Stage::FollowUp, &mut state, Duration::from_secs(60)).await.unwrap();
        assert_eq!(state.status, LeadStatus::CollectingDetails);

        h.run(Stage::FollowUp, &mut state, Duration::from_secs(2 * 3600)).await.unwrap();
        assert_eq!(state.status, LeadStatus::Stalled);
    }
}
