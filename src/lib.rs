//! Groom Assist — conversational intake funnel for a pet-grooming service.

pub mod calendar;
pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod store;
pub mod workflow;
