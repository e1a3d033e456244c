//! Channel abstraction for message I/O.
//!
//! The funnel core is channel-agnostic: a channel turns platform events into
//! [`InboundMessage`]s and delivers replies back out. Only the CLI channel
//! ships here; production chat platforms plug in behind the same trait.

pub mod cli;

pub use cli::CliChannel;

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::ChannelError;

/// A message arriving from a chat platform.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub external_user_id: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(channel: &str, external_user_id: &str, text: &str) -> Self {
        Self {
            channel: channel.to_string(),
            external_user_id: external_user_id.to_string(),
            text: text.to_string(),
            received_at: Utc::now(),
        }
    }

    /// The thread identifier for this sender. One lead per user per channel.
    pub fn lead_id(&self) -> String {
        format!("{}:{}", self.channel, self.external_user_id)
    }
}

pub type MessageStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// A message transport.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Start listening and return the stream of inbound messages.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Deliver a reply for an inbound message.
    async fn respond(&self, msg: &InboundMessage, reply: &str) -> Result<(), ChannelError>;
}
