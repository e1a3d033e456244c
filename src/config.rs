//! Configuration types.

use std::time::Duration;

/// Funnel configuration.
#[derive(Debug, Clone)]
pub struct FunnelConfig {
    /// Service name used in log context.
    pub name: String,
    /// Idle time after which an active conversation is marked stalled.
    pub stall_threshold: Duration,
    /// Maximum number of conversation log entries kept per thread.
    pub history_limit: usize,
    /// How many recent history entries the field extractor sees.
    pub extraction_window: usize,
    /// Duration of a booked grooming slot.
    pub slot_duration: Duration,
    /// Attempts per LLM call before giving up on the turn's model step.
    pub llm_attempts: u32,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            name: "groom-assist".to_string(),
            stall_threshold: Duration::from_secs(3600), // 1 hour
            history_limit: 50,
            extraction_window: 5,
            slot_duration: Duration::from_secs(3600),
            llm_attempts: 2,
        }
    }
}
