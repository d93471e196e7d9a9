use super::packet::{Handshake, Packet, EVENT_NAME};
use super::{authenticated_url, websocket_url, APPLICATION_ID};
use crate::config::ServerCredentials;
use crate::hub::{EventHub, RawEvent, Subscription};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OUTGOING_CAPACITY: usize = 64;

/// Queued deliveries before the socket task stops reading frames
const BACKLOG_LIMIT: usize = 1024;

const SUBSCRIBE_TOPIC: &str = "ftrack.meta.subscribe";
const REPLY_TOPIC: &str = "ftrack.meta.reply";

struct Route {
    topics: Vec<String>,
    tx: mpsc::Sender<RawEvent>,
}

/// Subscription table shared between the hub handle and its socket task
#[derive(Default)]
struct Routes {
    routes: Mutex<Vec<Route>>,
}

impl Routes {
    fn add(&self, topics: Vec<String>, tx: mpsc::Sender<RawEvent>) {
        self.routes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Route { topics, tx });
    }

    fn targets(&self, topic: &str) -> Vec<mpsc::Sender<RawEvent>> {
        let mut routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());
        routes.retain(|r| !r.tx.is_closed());
        routes
            .iter()
            .filter(|r| r.topics.iter().any(|t| t == topic))
            .map(|r| r.tx.clone())
            .collect()
    }
}

struct Pending {
    tx: mpsc::Sender<RawEvent>,
    event: RawEvent,
}

/// Events waiting for space in a full subscription queue
///
/// The socket task never blocks on a slow subscriber. An event for a full
/// queue waits here, in arrival order, while heartbeats keep flowing.
#[derive(Default)]
struct Backlog {
    queue: VecDeque<Pending>,
}

impl Backlog {
    /// Hand an event to every target, queueing where a subscription is full
    ///
    /// Returns how many subscriptions took the event right away.
    fn offer(&mut self, targets: Vec<mpsc::Sender<RawEvent>>, event: &RawEvent) -> usize {
        let mut delivered = 0;
        for tx in targets {
            // Keep per-subscription order behind anything already queued
            if self.queue.iter().any(|p| p.tx.same_channel(&tx)) {
                self.queue.push_back(Pending {
                    tx,
                    event: event.clone(),
                });
                continue;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(event)) => self.queue.push_back(Pending { tx, event }),
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn next_route(&self) -> Option<mpsc::Sender<RawEvent>> {
        self.queue.front().map(|p| p.tx.clone())
    }

    /// Send the oldest queued event through a reserved slot
    fn complete(&mut self, permit: Option<OwnedPermit<RawEvent>>) {
        let Some(pending) = self.queue.pop_front() else {
            return;
        };
        match permit {
            Some(permit) => {
                permit.send(pending.event);
            }
            None => debug!(topic = %pending.event.topic, "Subscription closed, dropping queued event"),
        }
    }
}

/// Wait for queue space on `route`; never resolves without one
async fn reserve(route: Option<mpsc::Sender<RawEvent>>) -> Option<OwnedPermit<RawEvent>> {
    match route {
        Some(tx) => tx.reserve_owned().await.ok(),
        None => std::future::pending().await,
    }
}

/// What the socket task does with one inbound frame
#[derive(Debug, PartialEq)]
enum Inbound {
    Deliver(RawEvent),
    Heartbeat,
    Disconnect,
    ServerError(String),
    Ignore,
}

fn classify(text: &str) -> Inbound {
    match Packet::decode(text) {
        Ok(Packet::Heartbeat) => Inbound::Heartbeat,
        Ok(Packet::Disconnect) => Inbound::Disconnect,
        Ok(Packet::Error(reason)) => Inbound::ServerError(reason),
        Ok(Packet::Event { name, mut args }) if name == EVENT_NAME && !args.is_empty() => {
            match serde_json::from_value::<RawEvent>(args.swap_remove(0)) {
                Ok(event) => Inbound::Deliver(event),
                Err(e) => {
                    warn!(error = %e, "Dropping malformed event payload");
                    Inbound::Ignore
                }
            }
        }
        Ok(other) => {
            debug!(packet = ?other, "Ignoring packet");
            Inbound::Ignore
        }
        Err(e) => {
            warn!(error = %e, "Dropping undecodable frame");
            Inbound::Ignore
        }
    }
}

/// Event hub of a tracking server, reached over socket.io 0.9
///
/// A background task owns the WebSocket. It answers heartbeats, routes
/// `ftrack.event` packets to subscriptions, and writes outgoing events. When
/// the socket drops, every subscription ends so the owning listener can stop
/// and be restarted.
pub struct FtrackHub {
    name: String,
    api_user: String,
    source_id: String,
    routes: Arc<Routes>,
    outgoing: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl FtrackHub {
    pub async fn connect(credentials: &ServerCredentials) -> Result<Self> {
        let handshake_url = authenticated_url(credentials, "socket.io/1/")?;
        let body = reqwest::get(handshake_url)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::connection(&credentials.name, format!("event hub handshake: {}", e)))?
            .text()
            .await
            .map_err(|e| Error::connection(&credentials.name, format!("event hub handshake: {}", e)))?;

        let handshake = Handshake::parse(&body)?;
        if !handshake.supports_websocket() {
            return Err(Error::connection(
                &credentials.name,
                format!("event hub offers no websocket transport: {:?}", handshake.transports),
            ));
        }

        let path = format!("socket.io/1/websocket/{}", handshake.session_id);
        let url = websocket_url(authenticated_url(credentials, &path)?)?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::connection(&credentials.name, format!("event hub websocket: {}", e)))?;

        info!(
            server = %credentials.name,
            session = %handshake.session_id,
            heartbeat = ?handshake.heartbeat_timeout,
            "Event hub connected"
        );

        let routes = Arc::new(Routes::default());
        let closed = CancellationToken::new();
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);

        tokio::spawn(drive_socket(
            credentials.name.clone(),
            socket,
            outgoing_rx,
            Arc::clone(&routes),
            closed.clone(),
        ));

        Ok(Self {
            name: credentials.name.clone(),
            api_user: credentials.api_user.clone(),
            source_id: uuid::Uuid::new_v4().to_string(),
            routes,
            outgoing,
            closed,
        })
    }

    fn source(&self) -> Value {
        json!({
            "id": self.source_id,
            "applicationId": APPLICATION_ID,
            "user": {"username": self.api_user},
        })
    }

    fn envelope(&self, topic: &str, data: Value, target: &str, in_reply_to: Option<&str>) -> Value {
        json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "topic": topic,
            "data": data,
            "source": self.source(),
            "target": target,
            "inReplyToEvent": in_reply_to,
        })
    }

    async fn publish(&self, payload: Value) -> Result<()> {
        let frame = Packet::event(payload).encode()?;
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| Error::Hub(format!("event hub of {} is closed", self.name)))
    }
}

async fn drive_socket<S>(
    server: String,
    socket: S,
    mut outgoing: mpsc::Receiver<String>,
    routes: Arc<Routes>,
    closed: CancellationToken,
) where
    S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = socket.split();
    let mut backlog = Backlog::default();

    loop {
        let next_route = backlog.next_route();
        tokio::select! {
            _ = closed.cancelled() => {
                let _ = write.send(Message::Text(Packet::Disconnect.encode().unwrap_or_default())).await;
                let _ = write.close().await;
                break;
            }

            Some(frame) = outgoing.recv() => {
                if let Err(e) = write.send(Message::Text(frame)).await {
                    warn!(server = %server, error = %e, "Event hub send failed");
                    break;
                }
            }

            permit = reserve(next_route), if !backlog.is_empty() => {
                backlog.complete(permit);
            }

            msg = read.next(), if backlog.len() < BACKLOG_LIMIT => {
                match msg {
                    Some(Ok(Message::Text(text))) => match classify(&text) {
                        Inbound::Deliver(event) => {
                            let delivered = backlog.offer(routes.targets(&event.topic), &event);
                            debug!(
                                server = %server,
                                topic = %event.topic,
                                delivered,
                                queued = backlog.len(),
                                "Event received"
                            );
                        }
                        Inbound::Heartbeat => {
                            if let Err(e) = write.send(Message::Text(text)).await {
                                warn!(server = %server, error = %e, "Heartbeat reply failed");
                                break;
                            }
                        }
                        Inbound::Disconnect => {
                            info!(server = %server, "Event hub disconnected by server");
                            break;
                        }
                        Inbound::ServerError(reason) => {
                            warn!(server = %server, %reason, "Event hub reported an error");
                        }
                        Inbound::Ignore => {}
                    },
                    Some(Ok(Message::Close(_))) => {
                        info!(server = %server, "Event hub closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(server = %server, error = %e, "Event hub socket error");
                        break;
                    }
                    None => {
                        warn!(server = %server, "Event hub stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Ends every subscription of this hub
    closed.cancel();
    debug!(server = %server, "Event hub task stopped");
}

#[async_trait]
impl EventHub for FtrackHub {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self, topics: &[String], capacity: usize) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.routes.add(topics.to_vec(), tx);

        let subscriber_id = uuid::Uuid::new_v4().to_string();
        for topic in topics {
            let data = json!({
                "subscriber": {"id": subscriber_id, "applicationId": APPLICATION_ID},
                "subscription": format!("topic={}", topic),
            });
            self.publish(self.envelope(SUBSCRIBE_TOPIC, data, "", None)).await?;
            debug!(server = %self.name, %topic, "Subscribed");
        }

        Ok(Subscription::new(topics.to_vec(), rx, self.closed.child_token()))
    }

    async fn reply(&self, to: &RawEvent, data: Value) -> Result<()> {
        let target = to
            .source
            .get("id")
            .and_then(Value::as_str)
            .map(|id| format!("id={}", id))
            .unwrap_or_default();
        self.publish(self.envelope(REPLY_TOPIC, data, &target, Some(&to.id)))
            .await
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for FtrackHub {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
