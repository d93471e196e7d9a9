//! socket.io 0.9 packet codec
//!
//! Wire form: `type:id:endpoint[:data]`
//!
//! | type | meaning    |
//! |------|------------|
//! | 0    | disconnect |
//! | 1    | connect    |
//! | 2    | heartbeat  |
//! | 3    | message    |
//! | 4    | json       |
//! | 5    | event      |
//! | 6    | ack        |
//! | 7    | error      |
//! | 8    | noop       |

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Event name carrying tracking-server events
pub const EVENT_NAME: &str = "ftrack.event";

/// Decoded socket.io packet
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Disconnect,
    Connect,
    Heartbeat,
    Message(String),
    Json(Value),
    Event { name: String, args: Vec<Value> },
    Ack(String),
    Error(String),
    Noop,
}

#[derive(Serialize, Deserialize)]
struct EventBody {
    name: String,
    #[serde(default)]
    args: Vec<Value>,
}

impl Packet {
    /// Event packet wrapping one tracking-server event
    pub fn event(payload: Value) -> Self {
        Packet::Event {
            name: EVENT_NAME.to_string(),
            args: vec![payload],
        }
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(4, ':');
        let kind = parts
            .next()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Protocol(format!("empty packet: {:?}", raw)))?;
        let _id = parts.next();
        let _endpoint = parts.next();
        let data = parts.next().unwrap_or("");

        let packet = match kind {
            "0" => Packet::Disconnect,
            "1" => Packet::Connect,
            "2" => Packet::Heartbeat,
            "3" => Packet::Message(data.to_string()),
            "4" => Packet::Json(serde_json::from_str(data)?),
            "5" => {
                let body: EventBody = serde_json::from_str(data)?;
                Packet::Event {
                    name: body.name,
                    args: body.args,
                }
            }
            "6" => Packet::Ack(data.to_string()),
            "7" => Packet::Error(data.to_string()),
            "8" => Packet::Noop,
            other => return Err(Error::Protocol(format!("unknown packet type {}", other))),
        };
        Ok(packet)
    }

    pub fn encode(&self) -> Result<String> {
        let encoded = match self {
            Packet::Disconnect => "0::".to_string(),
            Packet::Connect => "1::".to_string(),
            Packet::Heartbeat => "2::".to_string(),
            Packet::Message(data) => format!("3:::{}", data),
            Packet::Json(value) => format!("4:::{}", serde_json::to_string(value)?),
            Packet::Event { name, args } => {
                let body = EventBody {
                    name: name.clone(),
                    args: args.clone(),
                };
                format!("5:::{}", serde_json::to_string(&body)?)
            }
            Packet::Ack(data) => format!("6:::{}", data),
            Packet::Error(data) => format!("7:::{}", data),
            Packet::Noop => "8::".to_string(),
        };
        Ok(encoded)
    }
}

/// Parsed handshake response: `sid:heartbeat:close:transports`
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub session_id: String,
    pub heartbeat_timeout: Option<Duration>,
    pub transports: Vec<String>,
}

impl Handshake {
    pub fn parse(body: &str) -> Result<Self> {
        let mut parts = body.trim().split(':');
        let session_id = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Protocol(format!("bad handshake: {:?}", body)))?
            .to_string();
        let heartbeat_timeout = parts
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        let _close_timeout = parts.next();
        let transports = parts
            .next()
            .map(|t| t.split(',').map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Self {
            session_id,
            heartbeat_timeout,
            transports,
        })
    }

    pub fn supports_websocket(&self) -> bool {
        self.transports.is_empty() || self.transports.iter().any(|t| t == "websocket")
    }
}
