//! Error types for robofleet-link.

use thiserror::Error;

/// Errors produced by the Robofleet client transport.
#[derive(Error, Debug)]
pub enum RobofleetLinkError {
    /// Invalid configuration (bad URL, unsupported scheme, missing builder field).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Socket-level transport failure. Absorbed by the connection task and
    /// surfaced through `on_error`/`on_disconnect`; only `connect()` and
    /// explicit sends ever return it.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An inbound frame could not be decoded into an envelope.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Attempted to remove a listener that is not registered. This is a
    /// lifecycle bug in the caller (mismatched add/remove), reported loudly
    /// rather than masked.
    #[error("Unregistered listener: {0}")]
    UnregisteredListener(String),

    /// The connection handle is no longer backed by a running task.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// HTTP side-channel request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type for robofleet-link operations.
pub type Result<T> = std::result::Result<T, RobofleetLinkError>;
