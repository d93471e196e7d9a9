//! Event hub abstraction
//!
//! Each hub pushes delivered events into a bounded channel per subscription.
//! A single consumer drains that channel, which keeps per-hub ordering while
//! letting hubs of different servers proceed independently.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Event exactly as delivered by a hub, before normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub id: String,
    pub topic: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub source: Value,
    #[serde(rename = "inReplyToEvent", default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

impl RawEvent {
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            data,
            source: Value::Null,
            in_reply_to: None,
        }
    }
}

/// Receiving end of a hub subscription
///
/// [`Subscription::next`] blocks until an event arrives and returns `None`
/// once the subscription or its hub is closed.
pub struct Subscription {
    topics: Vec<String>,
    rx: mpsc::Receiver<RawEvent>,
    closed: CancellationToken,
}

impl Subscription {
    pub fn new(topics: Vec<String>, rx: mpsc::Receiver<RawEvent>, closed: CancellationToken) -> Self {
        Self { topics, rx, closed }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Wait for the next event
    pub async fn next(&mut self) -> Option<RawEvent> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    /// Token that closes this subscription when cancelled
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// Publish/subscribe facility of one tracking server
#[async_trait]
pub trait EventHub: Send + Sync {
    /// Display name of the server this hub belongs to
    fn server_name(&self) -> &str;

    /// Subscribe to a set of topics with a bounded delivery queue
    async fn subscribe(&self, topics: &[String], capacity: usize) -> Result<Subscription>;

    /// Publish a reply to an event (action discover/launch responses)
    async fn reply(&self, to: &RawEvent, data: Value) -> Result<()>;

    /// Close the hub; every subscription's `next` returns `None` afterwards
    fn close(&self);
}
