use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use groom_assist::calendar::MemoryCalendar;
use groom_assist::channels::{Channel, CliChannel};
use groom_assist::config::FunnelConfig;
use groom_assist::llm::{LlmBackend, LlmConfig, create_provider};
use groom_assist::store::{MemoryStore, Record, Table};
use groom_assist::workflow::WorkflowManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let backend = match std::env::var("GROOM_LLM_BACKEND").as_deref() {
        Ok("openai") => LlmBackend::OpenAi,
        _ => LlmBackend::Anthropic,
    };

    let key_var = match backend {
        LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
        LlmBackend::OpenAi => "OPENAI_API_KEY",
    };
    let api_key = std::env::var(key_var).unwrap_or_else(|_| {
        eprintln!("Error: {} not set", key_var);
        std::process::exit(1);
    });

    let model = std::env::var("GROOM_MODEL").unwrap_or_else(|_| match backend {
        LlmBackend::Anthropic => "claude-sonnet-4-20250514".to_string(),
        LlmBackend::OpenAi => "gpt-4o".to_string(),
    });

    let mut config = FunnelConfig::default();
    if let Some(secs) = env_u64("GROOM_STALL_SECS") {
        config.stall_threshold = Duration::from_secs(secs);
    }
    if let Some(limit) = env_u64("GROOM_HISTORY_LIMIT") {
        config.history_limit = limit as usize;
    }

    eprintln!("🐾 Groom Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", model);
    eprintln!("   Stall threshold: {}s", config.stall_threshold.as_secs());
    eprintln!("   Type a message and press Enter. Ctrl-D to exit.\n");

    let llm = create_provider(&LlmConfig {
        backend,
        api_key: secrecy::SecretString::from(api_key),
        model,
    })?;

    let store = Arc::new(MemoryStore::new());
    seed_demo_catalog(&store).await;
    let calendar = Arc::new(MemoryCalendar::new());

    let manager = WorkflowManager::new(llm, store, calendar, config);

    let channel = CliChannel::new();
    let mut messages = channel.start().await?;
    while let Some(msg) = messages.next().await {
        let reply = manager
            .process_message(&msg.lead_id(), &msg.external_user_id, &msg.text)
            .await;
        if let Err(e) = channel.respond(&msg, &reply).await {
            tracing::error!("Failed to deliver reply: {}", e);
        }
    }

    Ok(())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Local runs use the in-memory store; give it a small catalog so the
/// funnel has something to show and book against.
async fn seed_demo_catalog(store: &MemoryStore) {
    store
        .seed(
            Table::Services,
            vec![
                record(serde_json::json!({
                    "service_id": "SVC-BATH",
                    "title": "Bath & Brush",
                    "description": "Bath, blow-dry, and a full brush-out",
                    "base_price": 40.0,
                    "duration_min": 45,
                })),
                record(serde_json::json!({
                    "service_id": "SVC-FULL",
                    "title": "Full Groom",
                    "description": "Bath, haircut, nails, and ears",
                    "base_price": 75.0,
                    "duration_min": 90,
                })),
                record(serde_json::json!({
                    "service_id": "SVC-NAILS",
                    "title": "Nail Trim",
                    "description": "Nail trim and paw check",
                    "base_price": 15.0,
                    "duration_min": 15,
                })),
            ],
        )
        .await;

    store
        .seed(
            Table::Brands,
            vec![record(serde_json::json!({
                "brand_id": "BRD-MAIN",
                "name": "Pawfect Grooming",
                "about": "Neighborhood grooming studio, open Tue-Sat 9am-6pm",
                "address": "412 Maple Ave",
                "phone": "555-0142",
            }))],
        )
        .await;
}

fn record(value: serde_json::Value) -> Record {
    value.as_object().cloned().unwrap_or_default()
}
