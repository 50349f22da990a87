//! WebSocket transport over tokio-tungstenite

use super::{FrameReader, FrameWriter, InboundFrame, Transport};
use crate::error::{RealtimeError, RealtimeResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

/// An upgraded WebSocket connection
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> WebSocketStream<S> {
        self.stream
    }
}

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Reader = WsReader<S>;
    type Writer = WsWriter<S>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.stream.split();
        (WsReader { stream }, WsWriter { sink })
    }
}

pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_frame(&mut self) -> RealtimeResult<Option<InboundFrame>> {
        loop {
            let frame = match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(msg)) => msg,
            };

            // tungstenite answers pings itself; the pong goes out with the next write.
            return Ok(Some(match frame {
                WsMessage::Text(text) => InboundFrame::Data(Bytes::from(text)),
                WsMessage::Binary(data) => InboundFrame::Data(Bytes::from(data)),
                WsMessage::Ping(data) => InboundFrame::Ping(Bytes::from(data)),
                WsMessage::Pong(data) => InboundFrame::Pong(Bytes::from(data)),
                WsMessage::Close(_) => InboundFrame::Close,
                WsMessage::Frame(_) => continue,
            }));
        }
    }
}

fn text_message(frame: Bytes) -> RealtimeResult<WsMessage> {
    let text = String::from_utf8(frame.to_vec())
        .map_err(|_| RealtimeError::protocol("outbound frame is not valid UTF-8"))?;
    Ok(WsMessage::Text(text))
}

pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
}

#[async_trait]
impl<S> FrameWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: Bytes) -> RealtimeResult<()> {
        self.sink.send(text_message(frame)?).await?;
        Ok(())
    }

    async fn write_frames(&mut self, frames: Vec<Bytes>) -> RealtimeResult<()> {
        for frame in frames {
            self.sink.feed(text_message(frame)?).await?;
        }
        self.sink.flush().await?;
        Ok(())
    }

    async fn write_ping(&mut self) -> RealtimeResult<()> {
        self.sink.send(WsMessage::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn close(&mut self) -> RealtimeResult<()> {
        self.sink.send(WsMessage::Close(None)).await?;
        self.sink.close().await?;
        Ok(())
    }
}
