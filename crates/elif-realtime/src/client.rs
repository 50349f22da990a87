//! Per-connection actor
//!
//! A [`Client`] owns a bounded outbound queue and runs two workers against a
//! split [`Transport`]:
//!
//! - the read loop pumps inbound frames into [`Hub::handle_message`], keeps
//!   the heartbeat fresh and reports handler failures back to the peer;
//! - the write loop drains the queue onto the transport, flushing any
//!   backlog as one batch of frames and probing idle connections.
//!
//! Both workers share one cancellation token, a child of the hub's. Whichever
//! side fails first cancels it and the other follows.

use crate::error::{RealtimeError, RealtimeResult};
use crate::hub::Hub;
use crate::message::Message;
use crate::transport::{FrameReader, FrameWriter, InboundFrame, Transport};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique identifier for a client, never reused within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// Built, not yet accepted by the hub
    Created = 0,
    /// Registered and eligible for broadcasts
    Active = 1,
    /// Cancelled; workers are winding down
    Closing = 2,
    /// Workers exited and the queue is torn down
    Closed = 3,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One connected peer, as seen by the hub
pub struct Client {
    id: ClientId,
    user_id: OnceLock<String>,
    hub: Hub,
    sender: RwLock<Option<mpsc::Sender<Bytes>>>,
    receiver: Mutex<Option<mpsc::Receiver<Bytes>>>,
    closed: AtomicBool,
    state: AtomicU8,
    workers_started: AtomicBool,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
    connected_instant: Instant,
    last_heartbeat: Mutex<Instant>,
    metadata: RwLock<HashMap<String, Value>>,
}

impl Client {
    /// Create a client bound to `hub`. It stays invisible until [`Hub::register`].
    pub fn new(hub: &Hub, user_id: Option<String>) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(hub.config().send_queue_capacity.max(1));
        let now = Instant::now();

        let user = OnceLock::new();
        if let Some(user_id) = user_id {
            let _ = user.set(user_id);
        }

        Arc::new(Self {
            id: ClientId::new(),
            user_id: user,
            hub: hub.clone(),
            sender: RwLock::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            closed: AtomicBool::new(false),
            state: AtomicU8::new(ClientState::Created as u8),
            workers_started: AtomicBool::new(false),
            cancel: hub.child_token(),
            connected_at: Utc::now(),
            connected_instant: now,
            last_heartbeat: Mutex::new(now),
            metadata: RwLock::new(HashMap::new()),
        })
    }

    /// Identifier assigned at creation
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Authenticated identity, if any
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.get().map(String::as_str)
    }

    /// Attach the authenticated identity. Only allowed once, before registration.
    pub fn set_user_id<T: Into<String>>(&self, user_id: T) -> bool {
        if self.state() != ClientState::Created {
            return false;
        }
        self.user_id.set(user_id.into()).is_ok()
    }

    /// The hub this client belongs to
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once sends are refused
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wall-clock time the client was created
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Time since the client was created
    pub fn connection_duration(&self) -> Duration {
        self.connected_instant.elapsed()
    }

    /// Last time the peer showed signs of life
    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    /// Wall-clock time of the last heartbeat
    pub fn last_heartbeat_at(&self) -> DateTime<Utc> {
        let since = self.last_heartbeat().elapsed();
        Utc::now() - chrono::Duration::from_std(since).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub(crate) fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Attach an application value to this connection
    pub fn set_metadata<K: Into<String>>(&self, key: K, value: Value) {
        self.metadata.write().insert(key.into(), value);
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.metadata.read().get(key).cloned()
    }

    /// Remove and return a metadata value
    pub fn remove_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.write().remove(key)
    }

    /// Number of frames waiting in the outbound queue
    pub fn queued_len(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Encode and queue a message for this client only
    pub fn send(&self, message: &Message) -> RealtimeResult<()> {
        if self.is_closed() {
            return Err(RealtimeError::ClientClosed);
        }

        let frame = message.encode()?;
        self.enqueue(frame)
    }

    /// Non-blocking enqueue of an encoded frame.
    ///
    /// The sender slot is emptied exactly once on teardown, under the write
    /// lock, so a racing enqueue sees either a live queue or `ClientClosed`.
    pub(crate) fn enqueue(&self, frame: Bytes) -> RealtimeResult<()> {
        if self.is_closed() {
            return Err(RealtimeError::ClientClosed);
        }

        let sender = self.sender.read();
        let Some(tx) = sender.as_ref() else {
            return Err(RealtimeError::ClientClosed);
        };

        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RealtimeError::ChannelFull),
            Err(TrySendError::Closed(_)) => Err(RealtimeError::ClientClosed),
        }
    }

    /// Shorthand for [`Hub::join_room`]
    pub async fn join_room(self: &Arc<Self>, room: &str) -> RealtimeResult<()> {
        self.hub.join_room(self, room).await
    }

    /// Shorthand for [`Hub::leave_room`]
    pub async fn leave_room(&self, room: &str) -> RealtimeResult<bool> {
        self.hub.leave_room(self, room).await
    }

    /// Close the client. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.advance_state(ClientState::Closing);
        self.cancel.cancel();
        self.hub.request_unregister(self.id);
        debug!(client_id = %self.id, "Client closing");
    }

    /// Resolves once the client's scope is cancelled
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    pub(crate) fn activate(&self) {
        let _ = self.state.compare_exchange(
            ClientState::Created as u8,
            ClientState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Tear down the outbound queue. Safe to call any number of times.
    pub(crate) fn shutdown_queue(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();

        let sender = self.sender.write().take();
        if sender.is_some() {
            debug!(client_id = %self.id, "Outbound queue closed");
        }

        if self.workers_started.load(Ordering::Acquire) {
            self.advance_state(ClientState::Closing);
        } else {
            self.advance_state(ClientState::Closed);
        }
    }

    fn advance_state(&self, next: ClientState) {
        self.state.fetch_max(next as u8, Ordering::AcqRel);
    }

    /// Spawn both workers on the hub's task tracker
    pub fn start<T: Transport>(self: &Arc<Self>, transport: T) {
        let (reader, writer) = transport.split();
        self.workers_started.store(true, Ordering::Release);
        self.hub.spawn(self.clone().write_loop(writer));
        self.hub.spawn(self.clone().read_loop(reader));
    }

    /// Inbound worker: runs until the peer goes away, the read deadline
    /// passes, a frame is too large, or the client is cancelled.
    pub async fn read_loop<R: FrameReader>(self: Arc<Self>, mut reader: R) {
        self.workers_started.store(true, Ordering::Release);
        let stale_after = self.hub.config().stale_after();
        let limit = self.hub.config().max_message_size;

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = time::timeout(stale_after, reader.read_frame()) => read,
            };

            let frame = match read {
                Err(_) => {
                    info!(client_id = %self.id, "Read deadline exceeded, dropping connection");
                    break;
                }
                Ok(Err(e)) => {
                    debug!(client_id = %self.id, error = %e, "Read failed");
                    break;
                }
                Ok(Ok(None)) | Ok(Ok(Some(InboundFrame::Close))) => {
                    debug!(client_id = %self.id, "Peer closed connection");
                    break;
                }
                Ok(Ok(Some(frame))) => frame,
            };

            match frame {
                InboundFrame::Data(data) => {
                    if data.len() > limit {
                        let err = RealtimeError::FrameTooLarge {
                            size: data.len(),
                            limit,
                        };
                        warn!(client_id = %self.id, error = %err, "Dropping connection");
                        break;
                    }

                    self.touch();
                    if let Err(e) = self.hub.handle_message(&self, &data).await {
                        if e.is_fatal() {
                            info!(client_id = %self.id, error = %e, "Handler failed fatally, dropping connection");
                            break;
                        }
                        warn!(client_id = %self.id, error = %e, "Message handling failed");
                        if let Err(send_err) = self.send(&Message::error(e.to_string())) {
                            debug!(client_id = %self.id, error = %send_err, "Could not report error to client");
                        }
                    }
                }
                InboundFrame::Ping(_) | InboundFrame::Pong(_) => self.touch(),
                InboundFrame::Close => break,
            }
        }

        self.close();
    }

    /// Outbound worker: sole consumer of the queue
    pub async fn write_loop<W: FrameWriter>(self: Arc<Self>, mut writer: W) {
        self.workers_started.store(true, Ordering::Release);

        let receiver = self.receiver.lock().take();
        let Some(mut receiver) = receiver else {
            warn!(client_id = %self.id, "Write loop already running");
            return;
        };

        let config = self.hub.config();
        let write_timeout = config.write_timeout();
        let ping_interval = config.ping_interval();
        let coalesce = config.coalesce_writes;

        let mut probe = time::interval_at(Instant::now() + ping_interval, ping_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut wrote_since_probe = false;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let _ = time::timeout(write_timeout, writer.close()).await;
                    break;
                }

                next = receiver.recv() => {
                    let Some(first) = next else {
                        let _ = time::timeout(write_timeout, writer.close()).await;
                        break;
                    };

                    let batch = if coalesce {
                        drain_pending(first, &mut receiver)
                    } else {
                        vec![first]
                    };

                    match time::timeout(write_timeout, writer.write_frames(batch)).await {
                        Ok(Ok(())) => wrote_since_probe = true,
                        Ok(Err(e)) => {
                            debug!(client_id = %self.id, error = %e, "Write failed");
                            break;
                        }
                        Err(_) => {
                            warn!(client_id = %self.id, "Write deadline exceeded");
                            break;
                        }
                    }
                }

                _ = probe.tick() => {
                    if wrote_since_probe {
                        wrote_since_probe = false;
                        continue;
                    }

                    match time::timeout(write_timeout, writer.write_ping()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(client_id = %self.id, error = %e, "Ping failed");
                            break;
                        }
                        Err(_) => {
                            warn!(client_id = %self.id, "Ping deadline exceeded");
                            break;
                        }
                    }
                }
            }
        }

        // Wake the read loop, which unregisters the client.
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
        self.hub.request_unregister(self.id);
        self.sender.write().take();
        receiver.close();
        self.advance_state(ClientState::Closed);
        debug!(client_id = %self.id, "Write loop finished");
    }
}

/// The frame plus everything already queued behind it, in order
fn drain_pending(first: Bytes, receiver: &mut mpsc::Receiver<Bytes>) -> Vec<Bytes> {
    let mut batch = vec![first];
    while let Ok(next) = receiver.try_recv() {
        batch.push(next);
    }
    batch
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("user_id", &self.user_id())
            .field("state", &self.state())
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        debug!("Dropping client: {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::transport::{MemoryTransport, OutboundFrame};
    use serde_json::json;

    fn small_hub(capacity: usize) -> Hub {
        Hub::new(HubConfig {
            send_queue_capacity: capacity,
            ..HubConfig::default()
        })
    }

    #[tokio::test]
    async fn test_send_after_close_errors() {
        let hub = Hub::default();
        let client = Client::new(&hub, None);

        client.close();
        client.close();

        assert!(client.is_closed());
        assert_eq!(client.state(), ClientState::Closing);
        assert!(matches!(
            client.send(&Message::new("late")),
            Err(RealtimeError::ClientClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_after_queue_teardown_errors() {
        let hub = Hub::default();
        let client = Client::new(&hub, None);

        client.shutdown_queue();
        client.shutdown_queue();

        assert_eq!(client.state(), ClientState::Closed);
        assert!(matches!(
            client.enqueue(Bytes::from_static(b"{}")),
            Err(RealtimeError::ClientClosed)
        ));
    }

    #[tokio::test]
    async fn test_channel_full() {
        let hub = small_hub(2);
        let client = Client::new(&hub, None);

        client.send(&Message::new("one")).unwrap();
        client.send(&Message::new("two")).unwrap();
        assert_eq!(client.queued_len(), 2);
        assert!(matches!(
            client.send(&Message::new("three")),
            Err(RealtimeError::ChannelFull)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_send_and_close_never_panics() {
        for _ in 0..50 {
            let hub = small_hub(8);
            let client = Client::new(&hub, None);

            let senders: Vec<_> = (0..4)
                .map(|_| {
                    let client = client.clone();
                    tokio::spawn(async move {
                        for _ in 0..32 {
                            let _ = client.send(&Message::new("spam"));
                        }
                    })
                })
                .collect();

            let closer = {
                let client = client.clone();
                tokio::spawn(async move {
                    client.close();
                    client.shutdown_queue();
                })
            };

            for task in senders {
                task.await.unwrap();
            }
            closer.await.unwrap();

            assert!(client.send(&Message::new("after")).is_err());
        }
    }

    #[tokio::test]
    async fn test_metadata() {
        let hub = Hub::default();
        let client = Client::new(&hub, Some("alice".to_string()));

        client.set_metadata("can_publish", json!(true));
        assert_eq!(client.metadata("can_publish"), Some(json!(true)));
        assert_eq!(client.metadata("missing"), None);
        assert_eq!(client.remove_metadata("can_publish"), Some(json!(true)));
        assert_eq!(client.user_id(), Some("alice"));
    }

    #[tokio::test]
    async fn test_user_id_set_once_before_registration() {
        let hub = Hub::default();
        let client = Client::new(&hub, None);

        assert!(client.set_user_id("bob"));
        assert!(!client.set_user_id("mallory"));
        assert_eq!(client.user_id(), Some("bob"));

        let late = Client::new(&hub, None);
        late.activate();
        assert!(!late.set_user_id("carol"));
        assert_eq!(late.user_id(), None);
    }

    #[tokio::test]
    async fn test_drain_pending_keeps_order() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.try_send(Bytes::from_static(b"b")).unwrap();
        tx.try_send(Bytes::from_static(b"c")).unwrap();

        let batch = drain_pending(Bytes::from_static(b"a"), &mut rx);
        assert_eq!(
            batch,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c")
            ]
        );

        let single = drain_pending(Bytes::from_static(b"z"), &mut rx);
        assert_eq!(single, vec![Bytes::from_static(b"z")]);
    }

    #[tokio::test]
    async fn test_backlog_is_written_one_envelope_per_frame() {
        let hub = Hub::default();
        let client = Client::new(&hub, None);
        for seq in 0..5 {
            client.send(&Message::with_payload("seq", json!(seq))).unwrap();
        }

        // The whole backlog is queued before the writer starts draining.
        let (transport, mut peer) = MemoryTransport::pair();
        client.start(transport);

        for seq in 0..5 {
            match time::timeout(Duration::from_secs(5), peer.recv()).await.unwrap() {
                Some(OutboundFrame::Data(frame)) => {
                    let envelope: Value = serde_json::from_slice(&frame).unwrap();
                    assert_eq!(envelope, json!({ "type": "seq", "data": seq }));
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }

        client.close();
        hub.shutdown().await;
    }

    /// Transport whose writes and reads never complete
    struct StalledTransport;

    struct StalledReader;

    struct StalledWriter;

    #[async_trait::async_trait]
    impl FrameReader for StalledReader {
        async fn read_frame(&mut self) -> RealtimeResult<Option<InboundFrame>> {
            std::future::pending().await
        }
    }

    #[async_trait::async_trait]
    impl FrameWriter for StalledWriter {
        async fn write_frame(&mut self, _frame: Bytes) -> RealtimeResult<()> {
            std::future::pending().await
        }

        async fn write_ping(&mut self) -> RealtimeResult<()> {
            std::future::pending().await
        }

        async fn close(&mut self) -> RealtimeResult<()> {
            std::future::pending().await
        }
    }

    impl Transport for StalledTransport {
        type Reader = StalledReader;
        type Writer = StalledWriter;

        fn split(self) -> (Self::Reader, Self::Writer) {
            (StalledReader, StalledWriter)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_deadline_closes_client() {
        let hub = Hub::new(HubConfig {
            write_timeout_secs: 2,
            ..HubConfig::default()
        });
        let client = Client::new(&hub, None);
        client.start(StalledTransport);

        client.send(&Message::new("stuck")).unwrap();
        time::sleep(Duration::from_secs(1)).await;
        assert!(!client.is_closed());

        time::sleep(Duration::from_secs(2)).await;
        assert!(client.is_closed());
        assert_eq!(client.state(), ClientState::Closed);
        assert!(client.send(&Message::new("late")).is_err());

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_ids_unique() {
        let hub = Hub::default();
        let a = Client::new(&hub, None);
        let b = Client::new(&hub, None);
        assert_ne!(a.id(), b.id());
    }
}
