//! Bounded retry for model calls.

use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;

use super::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// Run a completion with up to `attempts` tries and a short linear backoff.
///
/// The workflow treats the model as unreliable; one transient failure should
/// not cost the turn.
pub(crate) async fn complete_with_attempts(
    llm: &Arc<dyn LlmProvider>,
    request: CompletionRequest,
    attempts: u32,
) -> Result<CompletionResponse, LlmError> {
    let attempts = attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match llm.complete(request.clone()).await {
            Ok(response) => return Ok(response),
            Err(e) => {
                tracing::warn!("LLM attempt {}/{} failed: {}", attempt, attempts, e);
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
            }
        }
    }
    Err(LlmError::RetriesExhausted {
        attempts,
        last: last_error,
    })
}
