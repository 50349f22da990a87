//! Transport abstraction
//!
//! The hub never sees sockets. A connection is anything that can be split
//! into a [`FrameReader`] and a [`FrameWriter`]; the client's inbound and
//! outbound workers each own one half. Deadlines are applied by the workers.

pub mod memory;
pub mod websocket;

use crate::error::RealtimeResult;
use async_trait::async_trait;
use bytes::Bytes;

pub use memory::{MemoryPeer, MemoryTransport, OutboundFrame};
pub use websocket::{WsReader, WsTransport, WsWriter};

/// A frame read from a peer
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Application data (one JSON envelope)
    Data(Bytes),
    /// Liveness probe from the peer
    Ping(Bytes),
    /// Answer to one of our probes
    Pong(Bytes),
    /// Peer started the close handshake
    Close,
}

/// Read half of a connection
#[async_trait]
pub trait FrameReader: Send {
    /// Next frame, or `None` once the peer has gone away
    async fn read_frame(&mut self) -> RealtimeResult<Option<InboundFrame>>;
}

/// Write half of a connection
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: Bytes) -> RealtimeResult<()>;

    /// Write a backlog in order, one frame per message.
    ///
    /// Transports that buffer should override this to flush once per batch.
    async fn write_frames(&mut self, frames: Vec<Bytes>) -> RealtimeResult<()> {
        for frame in frames {
            self.write_frame(frame).await?;
        }
        Ok(())
    }

    /// Send a liveness probe
    async fn write_ping(&mut self) -> RealtimeResult<()>;

    /// Best-effort close handshake
    async fn close(&mut self) -> RealtimeResult<()>;
}

/// A duplex connection that can be split between two workers
pub trait Transport: Send + 'static {
    type Reader: FrameReader + 'static;
    type Writer: FrameWriter + 'static;

    fn split(self) -> (Self::Reader, Self::Writer);
}
