//! Response composition — one outbound message per turn.
//!
//! Deterministic templates per status; only the generic fallback delegates
//! to free-text generation, and even that degrades to a static line.

use std::sync::Arc;

use crate::config::FunnelConfig;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, retry::complete_with_attempts};

use super::state::{ConversationState, LeadStatus};

const FALLBACK_REPLY: &str =
    "I'm here to help with your pet grooming needs! How can I assist you today?";

/// Renders the outbound message for the turn's final state.
pub struct ResponseComposer {
    llm: Arc<dyn LlmProvider>,
    llm_attempts: u32,
}

impl ResponseComposer {
    pub fn new(llm: Arc<dyn LlmProvider>, config: &FunnelConfig) -> Self {
        Self {
            llm,
            llm_attempts: config.llm_attempts,
        }
    }

    /// Produce the outbound text. Never returns an empty string.
    pub async fn compose(&self, state: &ConversationState) -> String {
        // A handler may have staged the reply already (brand info, catalog
        // warnings, booking confirmations).
        if !state.response.trim().is_empty() {
            return state.response.clone();
        }

        let text = match state.status {
            LeadStatus::Qualifying => self.qualifying_reply(),
            LeadStatus::CollectingDetails => self.collecting_reply(state),
            LeadStatus::Qualified => self.qualified_reply(state),
            LeadStatus::ShowingServices => self.services_reply(state),
            LeadStatus::BookingAppointment => self.booking_reply(),
            LeadStatus::Booked => self.confirmation_reply(state),
            LeadStatus::Stalled => self.stalled_reply(state),
            LeadStatus::Initiated
            | LeadStatus::Onboarded
            | LeadStatus::Completed
            | LeadStatus::Cancelled => self.generic_reply(state).await,
        };

        if text.trim().is_empty() {
            FALLBACK_REPLY.to_string()
        } else {
            text
        }
    }

    fn qualifying_reply(&self) -> String {
        "Hi there! 🐾 Welcome to our pet grooming service! I'd love to help you get your \
         furry friend looking their best. To get started, could you please tell me:\n\n\
         • Your name and phone number\n\
         • Your pet's name, species, breed, and approximate weight\n\
         • Your pet's age and current coat condition"
            .to_string()
    }

    /// Names every still-missing required field in one sentence.
    fn collecting_reply(&self, state: &ConversationState) -> String {
        let mut wanted: Vec<&str> = Vec::new();
        for field in state.missing_lead_fields() {
            wanted.push(match field {
                "customer_name" => "your name",
                "phone" => "your phone number",
                other => other,
            });
        }
        for field in state.missing_pet_fields() {
            wanted.push(match field {
                "pet_name" => "your pet's name",
                "species" => "your pet's species",
                "breed" => "your pet's breed",
                "weight_kg" => "your pet's weight",
                "age_years" => "your pet's age",
                other => other,
            });
        }

        if wanted.is_empty() {
            return "Perfect! I have all the information I need. Let me show you our \
                    available services."
                .to_string();
        }

        let listed = match wanted.len() {
            1 => wanted[0].to_string(),
            _ => format!(
                "{} and {}",
                wanted[..wanted.len() - 1].join(", "),
                wanted[wanted.len() - 1]
            ),
        };
        format!(
            "Thanks for that information! I still need {listed} to help you better. \
             Could you provide that?"
        )
    }

    fn qualified_reply(&self, state: &ConversationState) -> String {
        let name = state.customer_name.as_deref().unwrap_or("there");
        let pet = state.pet_name.as_deref().unwrap_or("Your pet");
        let breed = state.breed.as_deref().unwrap_or("wonderful companion");
        format!(
            "Wonderful! I have all your details, {name}. {pet} sounds like a lovely \
             {breed}! Let me show you our available services and pricing."
        )
    }

    fn services_reply(&self, state: &ConversationState) -> String {
        if state.available_services.is_empty() {
            return "I'm sorry, I'm having trouble accessing our services right now. \
                    Please try again later."
                .to_string();
        }

        let pet = state.pet_name.as_deref().unwrap_or("your pet");
        let mut reply = format!("Here are our grooming services for {pet}:\n\n");
        for service in &state.available_services {
            match service.base_price {
                Some(price) => reply.push_str(&format!("**{}** - ${}\n", service.title, price)),
                None => reply.push_str(&format!("**{}** - contact for pricing\n", service.title)),
            }
            if !service.description.is_empty() {
                reply.push_str(&format!("• {}\n", service.description));
            }
            if let Some(duration) = service.duration_min {
                reply.push_str(&format!("• Duration: {duration} minutes\n"));
            }
            reply.push('\n');
        }
        reply.push_str(
            "Which service would you like to book for your pet? Just let me know and I'll \
             check our available time slots! 📅",
        );
        reply
    }

    fn booking_reply(&self) -> String {
        "Great choice! Let me check our available time slots. Please send me a date and \
         time like 2025-06-02 10:00 — I can check morning (9 AM - 12 PM) or afternoon \
         (1 PM - 5 PM) slots."
            .to_string()
    }

    fn confirmation_reply(&self, state: &ConversationState) -> String {
        let pet = state.pet_name.as_deref().unwrap_or("your pet");
        format!(
            "Perfect! Your appointment has been booked for {pet}. You'll receive a \
             confirmation with all the details. Is there anything else I can help you \
             with today?"
        )
    }

    fn stalled_reply(&self, state: &ConversationState) -> String {
        let name = state.customer_name.as_deref().unwrap_or("there");
        format!(
            "Hi {name}, just checking in! Whenever you're ready to continue setting up \
             your pet's grooming appointment, send me a message and we'll pick up right \
             where we left off. 🐾"
        )
    }

    /// Free-text fallback, seeded with whatever facts are known.
    async fn generic_reply(&self, state: &ConversationState) -> String {
        let customer = state.customer_name.as_deref().unwrap_or("Customer");
        let pet = state.pet_name.as_deref().unwrap_or("their pet");
        let breed = state.breed.as_deref().unwrap_or("unknown breed");
        let system = format!(
            "You are a friendly AI assistant for a pet grooming business.\n\n\
             Current customer: {customer}\nPet: {pet} ({breed})\n\n\
             Respond helpfully and professionally. Keep responses concise but warm. \
             If asked about services, mention that you can show available services. \
             If asked about booking, guide them through the process."
        );
        let request = CompletionRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(&state.last_message),
        ])
        .with_max_tokens(512);

        match complete_with_attempts(&self.llm, request, self.llm_attempts).await {
            Ok(response) => response.content,
            Err(e) => {
                tracing::warn!("Lead {}: generic reply failed: {}", state.lead_id, e);
                FALLBACK_REPLY.to_string()
            }
        }
    }
}
