//! The intake funnel: state, routing, stage execution, and composition.

pub mod classifier;
pub mod composer;
pub mod extractor;
pub mod handlers;
pub mod manager;
pub mod stage;
pub mod state;

pub use classifier::IntentClassifier;
pub use composer::ResponseComposer;
pub use extractor::{ExtractedFields, FieldExtractor};
pub use handlers::StageHandlers;
pub use manager::{ThreadInfo, WorkflowManager};
pub use stage::Stage;
pub use state::{ChatEntry, ChatRole, ConversationState, LeadStatus};

#[cfg(test)]
pub(crate) mod testing {
    //! Shared test doubles for the workflow unit tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::LlmError;
    use crate::llm::{CompletionRequest, CompletionResponse, LlmProvider};

    /// An [`LlmProvider`] that replays a fixed script of responses in order.
    /// An exhausted or empty script errors, which exercises the fail-safe
    /// paths without any transport in the loop.
    pub(crate) struct ScriptedLlm {
        script: Mutex<VecDeque<String>>,
        fail: bool,
    }

    impl ScriptedLlm {
        pub(crate) fn new<I, S>(script: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                script: Mutex::new(script.into_iter().map(Into::into).collect()),
                fail: false,
            }
        }

        /// A provider whose every call fails.
        pub(crate) fn failing() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            if self.fail {
                return Err(LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason: "scripted failure".into(),
                });
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(content) => Ok(CompletionResponse {
                    content,
                    input_tokens: 0,
                    output_tokens: 0,
                }),
                None => Err(LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason: "script exhausted".into(),
                }),
            }
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }
}
