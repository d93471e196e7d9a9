use crate::hub::{EventHub, RawEvent, Subscription};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Subscriber {
    topics: Vec<String>,
    tx: mpsc::Sender<RawEvent>,
}

/// In-process [`EventHub`]
pub struct MemoryHub {
    name: String,
    subscribers: Mutex<Vec<Subscriber>>,
    replies: Mutex<Vec<RawEvent>>,
    closed: CancellationToken,
}

impl MemoryHub {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Deliver an event to every subscription listening on its topic
    ///
    /// Waits for queue space, so a full subscription applies backpressure.
    /// Returns the number of subscriptions that accepted the event.
    pub async fn publish(&self, event: RawEvent) -> usize {
        let targets: Vec<mpsc::Sender<RawEvent>> = {
            let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
            subs.retain(|s| !s.tx.is_closed());
            subs.iter()
                .filter(|s| s.topics.iter().any(|t| t == &event.topic))
                .map(|s| s.tx.clone())
                .collect()
        };

        let mut delivered = 0;
        for tx in targets {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Publish a single-entity update notification
    pub async fn publish_entity(&self, topic: &str, entity_type: &str, action: &str, id: &str) -> usize {
        let data = json!({
            "entities": [
                {"entity_type": entity_type, "action": action, "entityId": id}
            ]
        });
        self.publish(RawEvent::new(topic, data)).await
    }

    /// Replies sent through [`EventHub::reply`], oldest first
    pub fn replies(&self) -> Vec<RawEvent> {
        self.replies.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.retain(|s| !s.tx.is_closed());
        subs.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl EventHub for MemoryHub {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self, topics: &[String], capacity: usize) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Subscriber {
                topics: topics.to_vec(),
                tx,
            });
        Ok(Subscription::new(topics.to_vec(), rx, self.closed.child_token()))
    }

    async fn reply(&self, to: &RawEvent, data: Value) -> Result<()> {
        let mut reply = RawEvent::new(format!("{}.reply", to.topic), data);
        reply.in_reply_to = Some(to.id.clone());
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(reply);
        Ok(())
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_routes_by_topic() {
        let hub = MemoryHub::new("hub");
        let mut updates = hub.subscribe(&["ftrack.update".to_string()], 8).await.unwrap();
        let _launches = hub
            .subscribe(&["ftrack.action.launch".to_string()], 8)
            .await
            .unwrap();

        let delivered = hub.publish_entity("ftrack.update", "Task", "add", "t-1").await;
        assert_eq!(delivered, 1);

        let event = updates.next().await.unwrap();
        assert_eq!(event.topic, "ftrack.update");
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let hub = MemoryHub::new("hub");
        let mut sub = hub.subscribe(&["t".to_string()], 1).await.unwrap();

        hub.close();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_reply_links_request() {
        let hub = MemoryHub::new("hub");
        let request = RawEvent::new("ftrack.action.discover", Value::Null);

        hub.reply(&request, json!({"items": []})).await.unwrap();

        let replies = hub.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].in_reply_to.as_deref(), Some(request.id.as_str()));
    }
}
