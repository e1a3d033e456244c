//! Calendar seam for availability checks and event creation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Booking calendar. Like the record store, failures degrade to `false` /
/// `None` instead of surfacing into the workflow.
#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Whether the slot starting at `start` for `duration` is free.
    async fn check_availability(&self, start: DateTime<Utc>, duration: Duration) -> bool;

    /// Create an event; returns the event id, or `None` on failure.
    async fn create_event(
        &self,
        start: DateTime<Utc>,
        duration: Duration,
        summary: &str,
        description: &str,
    ) -> Option<String>;
}

struct BookedSlot {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// In-memory calendar holding a list of booked slots.
#[derive(Default)]
pub struct MemoryCalendar {
    slots: RwLock<Vec<BookedSlot>>,
}

impl MemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-book a slot, e.g. to seed conflicts in tests.
    pub async fn block(&self, start: DateTime<Utc>, duration: Duration) {
        let end = start + chrono::Duration::from_std(duration).unwrap_or_default();
        self.slots.write().await.push(BookedSlot { start, end });
    }
}

#[async_trait]
impl CalendarService for MemoryCalendar {
    async fn check_availability(&self, start: DateTime<Utc>, duration: Duration) -> bool {
        let end = start + chrono::Duration::from_std(duration).unwrap_or_default();
        let slots = self.slots.read().await;
        !slots.iter().any(|slot| slot.start < end && start < slot.end)
    }

    async fn create_event(
        &self,
        start: DateTime<Utc>,
        duration: Duration,
        summary: &str,
        _description: &str,
    ) -> Option<String> {
        if !self.check_availability(start, duration).await {
            tracing::warn!("Slot at {} already booked", start);
            return None;
        }
        self.block(start, duration).await;
        let event_id = Uuid::new_v4().to_string();
        tracing::info!("Created calendar event {} ({})", event_id, summary);
        Some(event_id)
    }
}
