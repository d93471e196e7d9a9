//! # Trackbridge Common Library
//!
//! Shared code for every trackbridge listener:
//! - Error taxonomy and configuration loading
//! - Normalized hub events
//! - Remote store and event hub abstractions, with the tracking-server
//!   HTTP/WebSocket adapters and an in-process implementation
//! - Retry-with-backoff and Retry-Fetch
//! - Connectors opening per-side sessions
//! - The `Listener` contract run by the supervisor

pub mod config;
pub mod connect;
pub mod error;
pub mod event;
pub mod ftrack;
pub mod hub;
pub mod listener;
pub mod memory;
pub mod query;
pub mod retry;
pub mod store;

pub use connect::{Connector, ServerSide};
pub use error::{Error, Result};
pub use event::{Action, EntityKind, Event};
pub use hub::{EventHub, RawEvent, Subscription};
pub use listener::Listener;
pub use query::{Filter, Query};
pub use retry::{fetch_query_with_retry, fetch_with_retry, FetchError, RetryPolicy};
pub use store::{Fields, Record, RemoteStore};
