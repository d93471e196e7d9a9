//! Adapters for the tracking server's wire protocols
//!
//! - [`FtrackStore`]: JSON operation batches POSTed to `<server>/api`
//! - [`FtrackHub`]: socket.io 0.9 event hub over WebSocket

mod hub;
pub mod packet;
mod store;

pub use hub::FtrackHub;
pub use store::FtrackStore;

use crate::config::ServerCredentials;
use crate::{Error, Result};
use reqwest::Url;

/// Application id announced in event sources
pub const APPLICATION_ID: &str = "ftrack.client";

/// Server URL joined with `path`, authenticated through the query string
fn authenticated_url(credentials: &ServerCredentials, path: &str) -> Result<Url> {
    let base = format!("{}/{}", credentials.server_url, path.trim_start_matches('/'));
    Url::parse_with_params(
        &base,
        &[
            ("api_user", credentials.api_user.as_str()),
            ("api_key", credentials.api_key.as_str()),
        ],
    )
    .map_err(|e| Error::connection(&credentials.name, format!("invalid server URL: {}", e)))
}

/// Same URL with the WebSocket scheme matching its HTTP scheme
fn websocket_url(mut url: Url) -> Result<Url> {
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(Error::Hub(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Hub(format!("cannot switch {} to {}", url, scheme)))?;
    Ok(url)
}
