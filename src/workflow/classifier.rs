//! Intent classification — routes each turn to one stage.
//!
//! Routing is layered: a deterministic stall check, then a binary "is this
//! about the business itself" model call that short-circuits past the
//! funnel, then a categorical decision over the funnel stages. Any model
//! failure or unrecognized label fails safe to `generate_response` so a
//! turn is never left unrouted.

use std::sync::Arc;
use std::time::Duration;

use crate::config::FunnelConfig;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, retry::complete_with_attempts};

use super::stage::Stage;
use super::state::ConversationState;

const BRAND_PROMPT: &str = "\
You are an AI assistant for a pet grooming business. Classify whether the \
user is asking about the business itself (hours, location, website, brand).

Return exactly one word:
- \"brand_information\" if the user is asking about the business itself
- \"other\" for anything else";

const FUNNEL_PROMPT: &str = "\
You are an AI assistant for a pet grooming business routing a customer \
message to the next step of the intake funnel.

Return exactly one of these labels and nothing else:
- qualify_lead: a new conversation, greeting, or first contact
- collect_details: the message offers customer or pet details, or we are \
still gathering them
- show_services: the customer is qualified and asks what we offer
- book_appointment: the customer picks a service or proposes a time
- generate_response: anything else";

/// Maps current state + latest message to a stage. Pure decision; the model
/// call is the only collaborator.
pub struct IntentClassifier {
    llm: Arc<dyn LlmProvider>,
    stall_threshold: Duration,
    llm_attempts: u32,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, config: &FunnelConfig) -> Self {
        Self {
            llm,
            stall_threshold: config.stall_threshold,
            llm_attempts: config.llm_attempts,
        }
    }

    /// Route the current turn. `idle` is the gap since the previous turn's
    /// activity, measured before the inbound message was appended.
    pub async fn classify(&self, state: &ConversationState, idle: Duration) -> Stage {
        if idle > self.stall_threshold && state.status.is_active() {
            tracing::info!(
                "Lead {}: idle for {:?}, routing to follow_up",
                state.lead_id,
                idle
            );
            return Stage::FollowUp;
        }

        match self.is_brand_question(state).await {
            Some(true) => return Stage::ProvideBrandInfo,
            Some(false) => {}
            None => return Stage::GenerateResponse,
        }

        self.funnel_stage(state).await
    }

    /// Binary brand-info decision. `None` means the model call itself failed.
    async fn is_brand_question(&self, state: &ConversationState) -> Option<bool> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(BRAND_PROMPT),
            ChatMessage::user(&state.last_message),
        ])
        .with_max_tokens(16)
        .with_temperature(0.0);

        match complete_with_attempts(&self.llm, request, self.llm_attempts).await {
            Ok(response) => {
                let label = response.content.trim().to_lowercase();
                Some(label == "brand_information")
            }
            Err(e) => {
                tracing::warn!("Lead {}: brand classification failed: {}", state.lead_id, e);
                None
            }
        }
    }

    /// Categorical funnel routing, seeded with the current status.
    async fn funnel_stage(&self, state: &ConversationState) -> Stage {
        let context = format!(
            "Conversation status: {}\nCustomer message: {}",
            state.status, state.last_message
        );
        let request = CompletionRequest::new(vec![
            ChatMessage::system(FUNNEL_PROMPT),
            ChatMessage::user(context),
        ])
        .with_max_tokens(16)
        .with_temperature(0.0);

        match complete_with_attempts(&self.llm, request, self.llm_attempts).await {
            Ok(response) => match Stage::from_label(&response.content) {
                Some(stage) => stage,
                None => {
                    tracing::warn!(
                        "Lead {}: unrecognized intent label {:?}, falling back",
                        state.lead_id,
                        response.content.trim()
                    );
                    Stage::GenerateResponse
                }
            },
            Err(e) => {
                tracing::warn!("Lead {}: intent classification failed: {}", state.lead_id, e);
                Stage::GenerateResponse
            }
        }
    }
}
