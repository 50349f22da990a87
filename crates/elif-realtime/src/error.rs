//! Error types for the realtime hub
//!
//! One error enum covers the whole crate so handlers, the hub and the
//! transports can all use `?` against the same `RealtimeResult`.

use crate::client::ClientId;
use crate::config::ConfigError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Realtime errors - every failure the hub, clients and transports can report
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("Client closed")]
    ClientClosed,

    #[error("Client send queue full")]
    ChannelFull,

    #[error("Hub dispatch queue full, message dropped")]
    DispatchQueueFull,

    #[error("Hub is shut down")]
    HubShutdown,

    #[error("Hub event loop is not running")]
    HubNotRunning,

    #[error("Client not registered: {0}")]
    ClientNotRegistered(ClientId),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RealtimeError {
    pub fn protocol<T: Into<String>>(message: T) -> Self {
        Self::Protocol(message.into())
    }

    pub fn invalid_payload<T: Into<String>>(message: T) -> Self {
        Self::InvalidPayload(message.into())
    }

    pub fn authentication<T: Into<String>>(message: T) -> Self {
        Self::Authentication(message.into())
    }

    /// Whether this error ends the connection it occurred on.
    ///
    /// Handler and payload errors are reported back to the peer instead.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ClientClosed
                | Self::HubShutdown
                | Self::HubNotRunning
                | Self::Transport(_)
                | Self::Io(_)
                | Self::FrameTooLarge { .. }
        )
    }
}

impl From<tungstenite::Error> for RealtimeError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::ClientClosed
            }
            tungstenite::Error::Capacity(capacity) => Self::Transport(capacity.to_string()),
            tungstenite::Error::Protocol(msg) => Self::Transport(msg.to_string()),
            tungstenite::Error::Io(io_err) => Self::Io(io_err),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Result type for realtime operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;
