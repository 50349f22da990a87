//! # elif-realtime
//!
//! Real-time messaging hub for the elif.rs framework.
//!
//! This crate provides:
//! - A hub that owns every connected client and serializes membership changes
//! - Named rooms for scoped broadcast, created on first join and reaped when empty
//! - Non-blocking fan-out where a slow client only ever hurts itself
//! - Type-tagged message routing with built-in handlers
//! - A WebSocket server with pluggable authentication

// Core modules
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod logging;
pub mod message;
pub mod room;
pub mod router;
pub mod server;
pub mod transport;

// Re-exports
pub use auth::{default_token_extractor, Authenticator, ConnectRequest, FnAuthenticator, TokenExtractor};
pub use client::{Client, ClientId, ClientState};
pub use config::{ConfigError, ConfigSource, HubConfig, HubDefaults, ServerConfig};
pub use error::{RealtimeError, RealtimeResult};
pub use hub::{Hub, HubStats};
pub use logging::{init_logging, LoggingConfig};
pub use message::Message;
pub use room::{DeliveryReport, Room, RoomManager};
pub use router::{MessageHandler, MessageRouter};
pub use server::{Server, Upgrader};
pub use transport::{
    FrameReader, FrameWriter, InboundFrame, MemoryPeer, MemoryTransport, OutboundFrame, Transport,
    WsTransport,
};
