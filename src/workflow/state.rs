//! Per-thread conversation state — the record everything else reads and
//! mutates.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::store::{Record, ServiceRecord};

/// Default bound on the conversation log. Oldest entries are dropped first;
/// the authoritative facts live in the lead/pet records, not the log.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Lead fields that must be known before qualification.
pub const REQUIRED_LEAD_FIELDS: [&str; 2] = ["customer_name", "phone"];

/// Pet fields that must be known before qualification.
pub const REQUIRED_PET_FIELDS: [&str; 5] =
    ["pet_name", "species", "breed", "weight_kg", "age_years"];

/// Where in the intake funnel a lead currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Initiated,
    Onboarded,
    Qualifying,
    CollectingDetails,
    Qualified,
    ShowingServices,
    BookingAppointment,
    Booked,
    Stalled,
    Completed,
    Cancelled,
}

impl LeadStatus {
    /// Check if a transition from `self` to `target` is valid.
    ///
    /// Forward edges follow the funnel; `Qualified` may regress to
    /// `CollectingDetails` when validation fails, any active status may
    /// stall, and a stalled lead may resume where it left off.
    pub fn can_transition_to(&self, target: LeadStatus) -> bool {
        use LeadStatus::*;
        if matches!(self, Completed | Cancelled) {
            return false;
        }
        match (self, target) {
            (Initiated, Qualifying | Onboarded) => true,
            (Onboarded, Qualifying) => true,
            (Qualifying, CollectingDetails | Qualified) => true,
            (CollectingDetails, Qualified) => true,
            (Qualified, ShowingServices | CollectingDetails) => true,
            (ShowingServices, BookingAppointment) => true,
            (BookingAppointment, Booked) => true,
            (Booked, Completed) => true,
            (Stalled, Qualifying | CollectingDetails | Qualified | ShowingServices
                | BookingAppointment) => true,
            (_, Stalled) => self.is_active(),
            (_, Cancelled) => true,
            _ => false,
        }
    }

    /// Whether the conversation is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether the lead is in the funnel and not yet booked or done.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Booked | Self::Stalled | Self::Completed | Self::Cancelled)
    }

    /// Rehydration fidelity: lead facts are persisted from `onboarded` on.
    pub fn restores_lead_facts(&self) -> bool {
        !matches!(self, Self::Initiated)
    }

    /// Rehydration fidelity: the pet record is complete from `qualified` on.
    pub fn restores_pet_facts(&self) -> bool {
        matches!(
            self,
            Self::Qualified
                | Self::ShowingServices
                | Self::BookingAppointment
                | Self::Booked
                | Self::Completed
        )
    }

    /// Rehydration fidelity: the appointment record exists once booked.
    pub fn restores_appointment(&self) -> bool {
        matches!(self, Self::Booked | Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Onboarded => "onboarded",
            Self::Qualifying => "qualifying",
            Self::CollectingDetails => "collecting_details",
            Self::Qualified => "qualified",
            Self::ShowingServices => "showing_services",
            Self::BookingAppointment => "booking_appointment",
            Self::Booked => "booked",
            Self::Stalled => "stalled",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "initiated" => Some(Self::Initiated),
            "onboarded" => Some(Self::Onboarded),
            "qualifying" => Some(Self::Qualifying),
            "collecting_details" => Some(Self::CollectingDetails),
            "qualified" => Some(Self::Qualified),
            "showing_services" => Some(Self::ShowingServices),
            "booking_appointment" => Some(Self::BookingAppointment),
            "booked" => Some(Self::Booked),
            "stalled" => Some(Self::Stalled),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who said a conversation log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One immutable conversation log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEntry {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// State for one chat thread, keyed by `lead_id`.
///
/// Owned exclusively by the `WorkflowManager` for its lifetime; one stage
/// handler mutates it per turn.
#[derive(Debug, Clone)]
pub struct ConversationState {
    // Identity
    pub lead_id: String,
    pub external_user_id: String,
    pub pet_id: Option<String>,
    pub service_id: Option<String>,
    appointment_id: Option<String>,

    pub status: LeadStatus,

    // Lead facts
    pub customer_name: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub created_at: DateTime<Utc>,
    pub source: &'static str,

    // Pet facts
    pub pet_name: Option<String>,
    pub species: Option<String>,
    pub breed: Option<String>,
    pub weight_kg: Option<f64>,
    pub age_years: Option<u32>,
    pub coat_condition: Option<String>,
    pub pet_notes: Option<String>,

    // Conversation tracking
    history: VecDeque<ChatEntry>,
    history_limit: usize,
    pub last_message: String,
    pub last_activity: DateTime<Utc>,

    // Transient per-turn fields
    pub available_services: Vec<ServiceRecord>,
    pub response: String,
}

/// Generate a `PET`/`APT`-style identifier: prefix + 6 uppercase
/// alphanumerics.
pub fn generate_id(prefix: &str) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("{prefix}{suffix}")
}

impl ConversationState {
    /// Fresh state for a previously-unseen thread.
    pub fn new(lead_id: impl Into<String>, external_user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            lead_id: lead_id.into(),
            external_user_id: external_user_id.into(),
            pet_id: Some(generate_id("PET")),
            service_id: None,
            appointment_id: None,
            status: LeadStatus::Initiated,
            customer_name: None,
            phone: None,
            city: None,
            created_at: now,
            source: "chat",
            pet_name: None,
            species: None,
            breed: None,
            weight_kg: None,
            age_years: None,
            coat_condition: None,
            pet_notes: None,
            history: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            last_message: String::new(),
            last_activity: now,
            available_services: Vec::new(),
            response: String::new(),
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Append a message to the conversation log, dropping the oldest entry
    /// once the bound is reached.
    pub fn add_message(&mut self, role: ChatRole, content: impl Into<String>) {
        let content = content.into();
        let now = Utc::now();
        self.history.push_back(ChatEntry {
            role,
            content: content.clone(),
            timestamp: now,
        });
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        self.last_message = content;
        self.last_activity = now;
    }

    /// The most recent `n` log entries, oldest first.
    pub fn recent_history(&self, n: usize) -> Vec<&ChatEntry> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Move to a new status. Same-status updates are a timestamp refresh;
    /// anything outside the transition table is a programming error and
    /// fails the turn.
    pub fn update_status(&mut self, new_status: LeadStatus) -> Result<(), WorkflowError> {
        if new_status != self.status {
            if !self.status.can_transition_to(new_status) {
                return Err(WorkflowError::InvalidTransition {
                    lead_id: self.lead_id.clone(),
                    from: self.status,
                    to: new_status,
                });
            }
            tracing::info!("Lead {}: {} -> {}", self.lead_id, self.status, new_status);
            self.status = new_status;
        }
        self.last_activity = Utc::now();
        Ok(())
    }

    pub fn appointment_id(&self) -> Option<&str> {
        self.appointment_id.as_deref()
    }

    /// Assign the appointment id. Allowed at most once per conversation.
    pub fn set_appointment_id(&mut self, id: impl Into<String>) -> Result<(), WorkflowError> {
        if self.appointment_id.is_some() {
            return Err(WorkflowError::AppointmentAlreadyAssigned {
                lead_id: self.lead_id.clone(),
            });
        }
        self.appointment_id = Some(id.into());
        Ok(())
    }

    /// Used only by rehydration, where the id comes from the store.
    pub(crate) fn restore_appointment_id(&mut self, id: impl Into<String>) {
        self.appointment_id = Some(id.into());
    }

    /// Required lead fields that are still empty.
    pub fn missing_lead_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !present(&self.customer_name) {
            missing.push("customer_name");
        }
        if !present(&self.phone) {
            missing.push("phone");
        }
        missing
    }

    /// Required pet fields that are still empty.
    pub fn missing_pet_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !present(&self.pet_name) {
            missing.push("pet_name");
        }
        if !present(&self.species) {
            missing.push("species");
        }
        if !present(&self.breed) {
            missing.push("breed");
        }
        if !self.weight_kg.is_some_and(|w| w > 0.0) {
            missing.push("weight_kg");
        }
        if self.age_years.is_none() {
            missing.push("age_years");
        }
        missing
    }

    /// A lead qualifies exactly when nothing required is missing.
    pub fn is_qualified(&self) -> bool {
        self.missing_lead_fields().is_empty() && self.missing_pet_fields().is_empty()
    }

    // ── Record conversions ──────────────────────────────────────────

    pub fn to_lead_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("lead_id".into(), self.lead_id.clone().into());
        record.insert("created_at_iso".into(), self.created_at.to_rfc3339().into());
        record.insert("source".into(), self.source.into());
        record.insert("external_user_id".into(), self.external_user_id.clone().into());
        record.insert("name".into(), opt(&self.customer_name));
        record.insert("phone".into(), opt(&self.phone));
        record.insert("city".into(), opt(&self.city));
        record.insert("status".into(), self.status.as_str().into());
        record
    }

    pub fn to_pet_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("lead_id".into(), self.lead_id.clone().into());
        record.insert("pet_id".into(), opt(&self.pet_id));
        record.insert("pet_name".into(), opt(&self.pet_name));
        record.insert("species".into(), opt(&self.species));
        record.insert("breed".into(), opt(&self.breed));
        record.insert(
            "weight_kg".into(),
            self.weight_kg.map(Into::into).unwrap_or(serde_json::Value::Null),
        );
        record.insert(
            "age_years".into(),
            self.age_years.map(Into::into).unwrap_or(serde_json::Value::Null),
        );
        record.insert("coat_condition".into(), opt(&self.coat_condition));
        record.insert("notes".into(), opt(&self.pet_notes));
        record
    }

    pub fn to_appointment_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("lead_id".into(), self.lead_id.clone().into());
        record.insert(
            "appointment_id".into(),
            self.appointment_id
                .as_deref()
                .map(Into::into)
                .unwrap_or(serde_json::Value::Null),
        );
        record.insert(
            "service_id".into(),
            self.service_id
                .as_deref()
                .map(Into::into)
                .unwrap_or(serde_json::Value::Null),
        );
        record
    }
}

fn present(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|s| !s.trim().is_empty())
}

fn opt(field: &Option<String>) -> serde_json::Value {
    field
        .as_deref()
        .map(Into::into)
        .unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ConversationState {
        ConversationState::new("L1", "user-1")
    }

    fn qualified_state() -> ConversationState {
        let mut s = state();
        s.customer_name = Some("Jane Doe".into());
        s.phone = Some("555-1212".into());
        s.pet_name = Some("Rex".into());
        s.species = Some("Dog".into());
        s.breed = Some("Beagle".into());
        s.weight_kg = Some(12.5);
        s.age_years = Some(3);
        s
    }

    #[test]
    fn funnel_walks_forward() {
        use LeadStatus::*;
        let path = [Qualifying, CollectingDetails, Qualified, ShowingServices,
            BookingAppointment, Booked, Completed];
        let mut s = state();
        for status in path {
            s.update_status(status).unwrap();
            assert_eq!(s.status, status);
        }
    }

    #[test]
    fn no_skipping_to_booked() {
        assert!(!LeadStatus::Initiated.can_transition_to(LeadStatus::Booked));
        assert!(!LeadStatus::Qualifying.can_transition_to(LeadStatus::Booked));
        let mut s = state();
        assert!(s.update_status(LeadStatus::Booked).is_err());
        assert_eq!(s.status, LeadStatus::Initiated);
    }

    #[test]
    fn qualified_may_regress_to_collecting() {
        assert!(LeadStatus::Qualified.can_transition_to(LeadStatus::CollectingDetails));
        assert!(!LeadStatus::ShowingServices.can_transition_to(LeadStatus::Qualifying));
    }

    #[test]
    fn terminal_statuses_are_final() {
        use LeadStatus::*;
        for target in [Initiated, Qualifying, Qualified, Booked, Stalled] {
            assert!(!Completed.can_transition_to(target));
            assert!(!Cancelled.can_transition_to(target));
        }
    }

    #[test]
    fn active_statuses_can_stall_and_resume() {
        use LeadStatus::*;
        for from in [Qualifying, CollectingDetails, Qualified, ShowingServices,
            BookingAppointment]
        {
            assert!(from.can_transition_to(Stalled), "{from} should stall");
        }
        assert!(!Booked.can_transition_to(Stalled));
        assert!(Stalled.can_transition_to(CollectingDetails));
        assert!(Stalled.can_transition_to(ShowingServices));
    }

    #[test]
    fn same_status_update_refreshes_timestamp_only() {
        let mut s = state();
        let before = s.last_activity;
        s.update_status(LeadStatus::Initiated).unwrap();
        assert_eq!(s.status, LeadStatus::Initiated);
        assert!(s.last_activity >= before);
    }

    #[test]
    fn qualification_requires_every_field() {
        let full = qualified_state();
        assert!(full.is_qualified());

        // Knock out each required field in turn
        let mut s = full.clone();
        s.customer_name = None;
        assert_eq!(s.missing_lead_fields(), vec!["customer_name"]);
        assert!(!s.is_qualified());

        let mut s = full.clone();
        s.phone = Some("   ".into());
        assert_eq!(s.missing_lead_fields(), vec!["phone"]);

        let mut s = full.clone();
        s.weight_kg = Some(0.0);
        assert_eq!(s.missing_pet_fields(), vec!["weight_kg"]);

        let mut s = full.clone();
        s.age_years = None;
        s.breed = None;
        assert_eq!(s.missing_pet_fields(), vec!["breed", "age_years"]);
        assert!(!s.is_qualified());
    }

    #[test]
    fn history_is_bounded() {
        let mut s = state().with_history_limit(4);
        for i in 0..10 {
            s.add_message(ChatRole::User, format!("message {i}"));
        }
        assert_eq!(s.history_len(), 4);
        let window = s.recent_history(2);
        assert_eq!(window.len(), 2);
        assert_eq!(window[1].content, "message 9");
        assert_eq!(s.last_message, "message 9");
    }

    #[test]
    fn appointment_id_set_once() {
        let mut s = state();
        s.set_appointment_id("APT123456").unwrap();
        assert_eq!(s.appointment_id(), Some("APT123456"));
        assert!(s.set_appointment_id("APT999999").is_err());
        assert_eq!(s.appointment_id(), Some("APT123456"));
    }

    #[test]
    fn generated_ids_have_prefix_and_length() {
        let id = generate_id("PET");
        assert!(id.starts_with("PET"));
        assert_eq!(id.len(), 9);
        assert!(id[3..].chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn lead_record_roundtrips_status() {
        let mut s = qualified_state();
        s.update_status(LeadStatus::Qualifying).unwrap();
        let record = s.to_lead_record();
        assert_eq!(record["lead_id"], "L1");
        assert_eq!(record["status"], "qualifying");
        assert_eq!(record["name"], "Jane Doe");
        assert_eq!(LeadStatus::parse(record["status"].as_str().unwrap()),
            Some(LeadStatus::Qualifying));
    }

    #[test]
    fn status_serde_matches_display() {
        for status in [LeadStatus::Initiated, LeadStatus::CollectingDetails,
            LeadStatus::BookingAppointment, LeadStatus::Cancelled]
        {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }
}
