//! Error types for the grooming intake funnel.

use crate::workflow::LeadStatus;

/// Top-level error type for the funnel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Request failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Workflow/state-machine errors.
///
/// Expected "missing data" conditions are never represented here — those keep
/// the conversation in a collecting status instead. These variants cover the
/// unexpected faults that roll a turn back.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Lead {lead_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        lead_id: String,
        from: LeadStatus,
        to: LeadStatus,
    },

    #[error("Lead {lead_id}: appointment id already assigned")]
    AppointmentAlreadyAssigned { lead_id: String },

    #[error("Lead {lead_id}: {reason}")]
    TurnFailed { lead_id: String, reason: String },
}

/// Message-channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel {0} closed")]
    Closed(String),
}

/// Result type alias for the funnel.
pub type Result<T> = std::result::Result<T, Error>;
