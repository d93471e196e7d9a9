//! Common error types for trackbridge

use thiserror::Error;

/// Common result type for trackbridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by stores, hubs and configuration loading
///
/// Store-call variants (`Query`, `Create`, `Update`, `Commit`) are reported to
/// the caller and leave the adapter usable for the next event. `Connection`
/// and `Config` only occur while a listener is starting.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not establish a session with a server
    #[error("Connection to {server} failed: {reason}")]
    Connection { server: String, reason: String },

    /// Query rejected or failed on the server
    #[error("Query error: {0}")]
    Query(String),

    /// Entity creation rejected
    #[error("Create error: {0}")]
    Create(String),

    /// Entity update rejected
    #[error("Update error: {0}")]
    Update(String),

    /// Pending batch could not be committed
    #[error("Commit error: {0}")]
    Commit(String),

    /// Schema information missing or malformed
    #[error("Schema error: {0}")]
    Schema(String),

    /// Event hub transport failure
    #[error("Event hub error: {0}")]
    Hub(String),

    /// Malformed payload received from a server
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Builds a connection error for the named server
    pub fn connection(server: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Connection {
            server: server.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that only occur while establishing a session
    pub fn is_startup_failure(&self) -> bool {
        matches!(self, Error::Connection { .. } | Error::Config(_))
    }
}
