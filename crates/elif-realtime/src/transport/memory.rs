//! In-process transport
//!
//! [`MemoryTransport::pair`] returns the server side of a connection and a
//! [`MemoryPeer`] that plays the remote end. Used to embed the hub without
//! sockets and to drive whole connections in tests.

use super::{FrameReader, FrameWriter, InboundFrame, Transport};
use crate::error::{RealtimeError, RealtimeResult};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

/// A frame written by the server side
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Data(Bytes),
    Ping,
    Close,
}

pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryPeer) {
        let (to_server, inbound) = mpsc::unbounded_channel();
        let (outbound, from_server) = mpsc::unbounded_channel();

        (
            MemoryTransport { inbound, outbound },
            MemoryPeer {
                to_server,
                from_server,
            },
        )
    }
}

impl Transport for MemoryTransport {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (
            MemoryReader {
                inbound: self.inbound,
            },
            MemoryWriter {
                outbound: self.outbound,
            },
        )
    }
}

pub struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> RealtimeResult<Option<InboundFrame>> {
        Ok(self.inbound.recv().await)
    }
}

pub struct MemoryWriter {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl MemoryWriter {
    fn push(&self, frame: OutboundFrame) -> RealtimeResult<()> {
        self.outbound
            .send(frame)
            .map_err(|_| RealtimeError::Transport("peer disconnected".to_string()))
    }
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write_frame(&mut self, frame: Bytes) -> RealtimeResult<()> {
        self.push(OutboundFrame::Data(frame))
    }

    async fn write_ping(&mut self) -> RealtimeResult<()> {
        self.push(OutboundFrame::Ping)
    }

    async fn close(&mut self) -> RealtimeResult<()> {
        self.push(OutboundFrame::Close)
    }
}

/// Remote end of a [`MemoryTransport`]
pub struct MemoryPeer {
    to_server: mpsc::UnboundedSender<InboundFrame>,
    from_server: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl MemoryPeer {
    pub fn send_frame(&self, frame: InboundFrame) -> RealtimeResult<()> {
        self.to_server
            .send(frame)
            .map_err(|_| RealtimeError::Transport("server side closed".to_string()))
    }

    pub fn send_text<T: Into<String>>(&self, text: T) -> RealtimeResult<()> {
        self.send_frame(InboundFrame::Data(Bytes::from(text.into())))
    }

    pub fn send_json(&self, value: &Value) -> RealtimeResult<()> {
        self.send_frame(InboundFrame::Data(Bytes::from(serde_json::to_vec(value)?)))
    }

    pub fn send_pong(&self) -> RealtimeResult<()> {
        self.send_frame(InboundFrame::Pong(Bytes::new()))
    }

    pub fn send_close(&self) -> RealtimeResult<()> {
        self.send_frame(InboundFrame::Close)
    }

    /// Next frame from the server, or `None` once the server side is gone
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.from_server.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.from_server.try_recv().ok()
    }

    /// Next data frame parsed as one JSON envelope.
    ///
    /// Probes are skipped; `None` on close, disconnect or a frame that is
    /// not a single JSON value.
    pub async fn recv_message(&mut self) -> Option<Value> {
        loop {
            match self.recv().await? {
                OutboundFrame::Data(frame) => return serde_json::from_slice(&frame).ok(),
                OutboundFrame::Ping => continue,
                OutboundFrame::Close => return None,
            }
        }
    }
}
