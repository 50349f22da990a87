//! The hub: single authority over clients and rooms
//!
//! All admissions, removals, joins and leaves are serialized through one event
//! loop ([`Hub::run`]). Readers (`client_count`, `room_clients`, fan-out) only
//! take short read locks on the shared maps and never wait on the loop.
//!
//! Broadcasts are encoded once by the caller and handed to the loop through a
//! bounded dispatch queue, so the caller never blocks on connection I/O.

use crate::client::{Client, ClientId};
use crate::config::HubConfig;
use crate::error::{RealtimeError, RealtimeResult};
use crate::message::Message;
use crate::room::{self, DeliveryReport, RoomManager};
use crate::router::MessageRouter;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

enum HubCommand {
    Register {
        client: Arc<Client>,
        ack: oneshot::Sender<RealtimeResult<()>>,
    },
    Unregister {
        id: ClientId,
        ack: Option<oneshot::Sender<bool>>,
    },
    Join {
        client: Arc<Client>,
        room: String,
        ack: oneshot::Sender<RealtimeResult<bool>>,
    },
    Leave {
        id: ClientId,
        room: String,
        ack: oneshot::Sender<bool>,
    },
}

#[derive(Debug)]
enum DispatchTarget {
    All,
    Room(String),
}

#[derive(Debug)]
struct Dispatch {
    target: DispatchTarget,
    frame: Bytes,
    exclude: Option<ClientId>,
}

type Receivers = (mpsc::UnboundedReceiver<HubCommand>, mpsc::Receiver<Dispatch>);

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    broadcasts_dropped: AtomicU64,
    unknown_types: AtomicU64,
    stale_reaped: AtomicU64,
}

impl Counters {
    fn record(&self, report: &DeliveryReport) {
        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.dropped
            .fetch_add(report.dropped.len() as u64, Ordering::Relaxed);
    }
}

/// Point-in-time hub statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub clients: usize,
    pub rooms: usize,
    pub room_members: BTreeMap<String, usize>,
    pub messages_delivered: u64,
    /// Per-client drops because an outbound queue was full or closed
    pub messages_dropped: u64,
    /// Whole broadcasts refused because the dispatch queue was full
    pub broadcasts_dropped: u64,
    pub unknown_message_types: u64,
    pub stale_clients_reaped: u64,
}

struct HubInner {
    config: HubConfig,
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
    rooms: RoomManager,
    router: MessageRouter,
    control_tx: mpsc::UnboundedSender<HubCommand>,
    dispatch_tx: mpsc::Sender<Dispatch>,
    receivers: Mutex<Option<Receivers>>,
    token: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
    stopped: CancellationToken,
    counters: Counters,
}

/// Handle to a hub. Cheap to clone; all clones drive the same hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a hub with the built-in handlers installed.
    ///
    /// Nothing runs until [`Hub::start`] (or [`Hub::run`]) is called.
    pub fn new(config: HubConfig) -> Self {
        Self::with_router(config, MessageRouter::with_defaults())
    }

    /// Create a hub around a caller-built router.
    ///
    /// Zero capacities and intervals are raised to their minimum.
    pub fn with_router(config: HubConfig, router: MessageRouter) -> Self {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Hub config failed validation, clamping zero values");
        }
        let config = config.clamped();

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_queue_capacity);

        Self {
            inner: Arc::new(HubInner {
                config,
                clients: RwLock::new(HashMap::new()),
                rooms: RoomManager::new(),
                router,
                control_tx,
                dispatch_tx,
                receivers: Mutex::new(Some((control_rx, dispatch_rx))),
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                started: AtomicBool::new(false),
                stopped: CancellationToken::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Effective configuration, after clamping
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Handler registry consulted for every inbound message
    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    /// Spawn the event loop on the hub's task tracker. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let hub = self.clone();
        self.inner.tracker.spawn(async move { hub.run().await });
    }

    /// True once [`Hub::shutdown`] has been called
    pub fn is_shutdown(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Token cancelled when the hub shuts down
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.tracker.spawn(future);
    }

    /// Admit a client. Resolves once it is visible to broadcasts.
    pub async fn register(&self, client: Arc<Client>) -> RealtimeResult<()> {
        self.request(|ack| HubCommand::Register { client, ack })
            .await?
    }

    /// Remove a client and drop it from every room. Returns false if it was
    /// not registered.
    pub async fn unregister(&self, client: &Client) -> bool {
        let id = client.id();
        self.request(|ack| HubCommand::Unregister { id, ack: Some(ack) })
            .await
            .unwrap_or(false)
    }

    /// Fire-and-forget removal, used by clients tearing themselves down
    pub(crate) fn request_unregister(&self, id: ClientId) {
        if self
            .inner
            .control_tx
            .send(HubCommand::Unregister { id, ack: None })
            .is_err()
        {
            debug!(client_id = %id, "Hub gone, skipping unregister");
        }
    }

    /// Add a registered client to a room, creating the room on first join
    pub async fn join_room(&self, client: &Arc<Client>, room: &str) -> RealtimeResult<()> {
        if room.is_empty() {
            return Err(RealtimeError::invalid_payload("room name is required"));
        }

        let client = client.clone();
        let room = room.to_string();
        self.request(|ack| HubCommand::Join { client, room, ack })
            .await??;
        Ok(())
    }

    /// Leave a room. Returns false if the client was not a member.
    pub async fn leave_room(&self, client: &Client, room: &str) -> RealtimeResult<bool> {
        if room.is_empty() {
            return Err(RealtimeError::invalid_payload("room name is required"));
        }

        let id = client.id();
        let room = room.to_string();
        self.request(|ack| HubCommand::Leave { id, room, ack }).await
    }

    async fn request<T, F>(&self, build: F) -> RealtimeResult<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> HubCommand,
    {
        if self.is_shutdown() {
            return Err(RealtimeError::HubShutdown);
        }
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(RealtimeError::HubNotRunning);
        }

        let (ack, reply) = oneshot::channel();
        self.inner
            .control_tx
            .send(build(ack))
            .map_err(|_| RealtimeError::HubShutdown)?;

        tokio::select! {
            result = reply => result.map_err(|_| RealtimeError::HubShutdown),
            _ = self.inner.token.cancelled() => Err(RealtimeError::HubShutdown),
        }
    }

    /// Queue a message for every registered client.
    ///
    /// The message is encoded here; an encoding failure aborts the whole
    /// broadcast. `DispatchQueueFull` means nothing was sent.
    pub fn broadcast(&self, message: &Message) -> RealtimeResult<()> {
        let frame = message.encode()?;
        self.dispatch(Dispatch {
            target: DispatchTarget::All,
            frame,
            exclude: None,
        })
    }

    /// Queue a message for the members of one room. A missing room is a no-op.
    pub fn broadcast_to_room(&self, room: &str, message: &Message) -> RealtimeResult<()> {
        self.broadcast_to_room_inner(room, message, None)
    }

    /// As [`Hub::broadcast_to_room`], skipping one member
    pub fn broadcast_to_room_except(
        &self,
        room: &str,
        message: &Message,
        excluded: ClientId,
    ) -> RealtimeResult<()> {
        self.broadcast_to_room_inner(room, message, Some(excluded))
    }

    fn broadcast_to_room_inner(
        &self,
        room: &str,
        message: &Message,
        exclude: Option<ClientId>,
    ) -> RealtimeResult<()> {
        let frame = message.encode()?;

        if self.inner.rooms.get(room).is_none() {
            debug!(room = %room, "Broadcast to missing room ignored");
            return Ok(());
        }

        self.dispatch(Dispatch {
            target: DispatchTarget::Room(room.to_string()),
            frame,
            exclude,
        })
    }

    fn dispatch(&self, dispatch: Dispatch) -> RealtimeResult<()> {
        if self.is_shutdown() {
            return Err(RealtimeError::HubShutdown);
        }

        match self.inner.dispatch_tx.try_send(dispatch) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dispatch)) => {
                self.inner
                    .counters
                    .broadcasts_dropped
                    .fetch_add(1, Ordering::Relaxed);
                warn!(target_room = ?dispatch.target, "Dispatch queue full, broadcast dropped");
                Err(RealtimeError::DispatchQueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(RealtimeError::HubShutdown),
        }
    }

    /// Install or replace the handler for a message type
    pub fn register_handler<K, F, Fut>(&self, kind: K, handler: F)
    where
        K: Into<String>,
        F: Fn(Arc<Client>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RealtimeResult<()>> + Send + 'static,
    {
        self.inner.router.register(kind, handler);
    }

    /// Decode an inbound frame and route it.
    ///
    /// Unknown types are logged and counted but are not an error. Decode and
    /// handler errors are returned for the caller to report to the peer.
    pub async fn handle_message(&self, client: &Arc<Client>, frame: &[u8]) -> RealtimeResult<()> {
        let message = Message::decode(frame)?;
        let kind = message.kind().to_string();

        if !self.inner.router.route(client.clone(), message).await? {
            self.inner
                .counters
                .unknown_types
                .fetch_add(1, Ordering::Relaxed);
            warn!(client_id = %client.id(), message_type = %kind, "No handler registered for message type");
        }

        Ok(())
    }

    /// Number of registered clients
    pub fn client_count(&self) -> usize {
        self.inner.clients.read().len()
    }

    /// Number of non-empty rooms
    pub fn room_count(&self) -> usize {
        self.inner.rooms.stats().values().filter(|count| **count > 0).count()
    }

    /// Snapshot of every registered client
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.inner.clients.read().values().cloned().collect()
    }

    /// Look up a registered client
    pub fn client(&self, id: ClientId) -> Option<Arc<Client>> {
        self.inner.clients.read().get(&id).cloned()
    }

    /// Members of a room; empty if the room does not exist
    pub fn room_clients(&self, room: &str) -> Vec<ClientId> {
        self.inner
            .rooms
            .get(room)
            .map(|room| room.member_ids())
            .unwrap_or_default()
    }

    /// Names of existing rooms, sorted
    pub fn room_names(&self) -> Vec<String> {
        let mut names = self.inner.rooms.names();
        names.sort();
        names
    }

    /// Snapshot of membership and delivery counters
    pub fn stats(&self) -> HubStats {
        let counters = &self.inner.counters;
        let room_members: BTreeMap<String, usize> = self
            .inner
            .rooms
            .stats()
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .collect();

        HubStats {
            clients: self.client_count(),
            rooms: room_members.len(),
            room_members,
            messages_delivered: counters.delivered.load(Ordering::Relaxed),
            messages_dropped: counters.dropped.load(Ordering::Relaxed),
            broadcasts_dropped: counters.broadcasts_dropped.load(Ordering::Relaxed),
            unknown_message_types: counters.unknown_types.load(Ordering::Relaxed),
            stale_clients_reaped: counters.stale_reaped.load(Ordering::Relaxed),
        }
    }

    /// Run the event loop until [`Hub::shutdown`]. Only the first call does
    /// anything; [`Hub::start`] calls this on a background task.
    ///
    /// Membership requests fail with `HubNotRunning` until the loop has been
    /// started, so prefer [`Hub::start`] over spawning this directly.
    pub async fn run(&self) {
        let receivers = self.inner.receivers.lock().take();
        let Some((mut control_rx, mut dispatch_rx)) = receivers else {
            warn!("Hub event loop already running");
            return;
        };
        self.inner.started.store(true, Ordering::Release);

        // Releases `shutdown` even if the loop unwinds.
        let _stopped = self.inner.stopped.clone().drop_guard();

        let period = self.inner.config.sweep_interval();
        let mut sweep = time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Reverse index so an unregister touches only the client's own rooms.
        let mut memberships: HashMap<ClientId, HashSet<String>> = HashMap::new();

        info!("Hub event loop started");

        loop {
            tokio::select! {
                biased;

                _ = self.inner.token.cancelled() => break,

                Some(command) = control_rx.recv() => {
                    self.apply(command, &mut memberships);
                }

                Some(dispatch) = dispatch_rx.recv() => {
                    self.deliver(dispatch);
                }

                _ = sweep.tick() => {
                    self.sweep(&mut memberships);
                }
            }
        }

        control_rx.close();
        while let Ok(command) = control_rx.try_recv() {
            if let HubCommand::Register { client, .. } = command {
                client.shutdown_queue();
            }
        }
        dispatch_rx.close();

        self.teardown();
        info!("Hub event loop stopped");
    }

    fn apply(&self, command: HubCommand, memberships: &mut HashMap<ClientId, HashSet<String>>) {
        match command {
            HubCommand::Register { client, ack } => {
                let result = if client.is_closed() {
                    Err(RealtimeError::ClientClosed)
                } else {
                    client.activate();
                    self.inner.clients.write().insert(client.id(), client.clone());
                    info!(client_id = %client.id(), user_id = ?client.user_id(), "Client registered");
                    Ok(())
                };
                let _ = ack.send(result);
            }
            HubCommand::Unregister { id, ack } => {
                let removed = self.remove_client(id, memberships);
                if let Some(ack) = ack {
                    let _ = ack.send(removed);
                }
            }
            HubCommand::Join { client, room, ack } => {
                let id = client.id();
                let result = if self.inner.clients.read().contains_key(&id) {
                    let added = self.inner.rooms.get_or_create(&room).add(client);
                    memberships.entry(id).or_default().insert(room.clone());
                    if added {
                        info!(client_id = %id, room = %room, "Client joined room");
                    }
                    Ok(added)
                } else {
                    Err(RealtimeError::ClientNotRegistered(id))
                };
                let _ = ack.send(result);
            }
            HubCommand::Leave { id, room, ack } => {
                let removed = self
                    .inner
                    .rooms
                    .get(&room)
                    .and_then(|r| r.remove(id))
                    .is_some();
                self.inner.rooms.remove_if_empty(&room);

                if let Some(rooms) = memberships.get_mut(&id) {
                    rooms.remove(&room);
                    if rooms.is_empty() {
                        memberships.remove(&id);
                    }
                }
                if removed {
                    info!(client_id = %id, room = %room, "Client left room");
                }
                let _ = ack.send(removed);
            }
        }
    }

    /// Rooms first, then the client map, then the client's queue.
    fn remove_client(
        &self,
        id: ClientId,
        memberships: &mut HashMap<ClientId, HashSet<String>>,
    ) -> bool {
        for name in memberships.remove(&id).unwrap_or_default() {
            if let Some(room) = self.inner.rooms.get(&name) {
                room.remove(id);
            }
            self.inner.rooms.remove_if_empty(&name);
        }

        let removed = self.inner.clients.write().remove(&id);
        match removed {
            Some(client) => {
                client.shutdown_queue();
                info!(client_id = %id, "Client unregistered");
                true
            }
            None => false,
        }
    }

    fn deliver(&self, dispatch: Dispatch) {
        let report = match &dispatch.target {
            DispatchTarget::All => {
                let clients: Vec<Arc<Client>> = self
                    .inner
                    .clients
                    .read()
                    .values()
                    .filter(|client| Some(client.id()) != dispatch.exclude)
                    .cloned()
                    .collect();
                room::deliver(&dispatch.frame, &clients)
            }
            DispatchTarget::Room(name) => match self.inner.rooms.get(name) {
                Some(room) => room.deliver(&dispatch.frame, dispatch.exclude),
                None => {
                    debug!(room = %name, "Room vanished before delivery");
                    return;
                }
            },
        };

        if report.has_drops() {
            debug!(
                delivered = report.delivered,
                dropped = report.dropped.len(),
                "Broadcast skipped slow clients"
            );
        }
        self.inner.counters.record(&report);
    }

    fn sweep(&self, memberships: &mut HashMap<ClientId, HashSet<String>>) {
        let stale_after = self.inner.config.stale_after();
        let stale: Vec<ClientId> = self
            .inner
            .clients
            .read()
            .values()
            .filter(|client| client.last_heartbeat().elapsed() > stale_after)
            .map(|client| client.id())
            .collect();

        for id in stale {
            if self.remove_client(id, memberships) {
                self.inner
                    .counters
                    .stale_reaped
                    .fetch_add(1, Ordering::Relaxed);
                info!(client_id = %id, "Reaped stale client");
            }
        }

        self.inner.rooms.cleanup();
    }

    fn teardown(&self) {
        let clients: Vec<Arc<Client>> = self
            .inner
            .clients
            .write()
            .drain()
            .map(|(_, client)| client)
            .collect();

        for client in &clients {
            client.shutdown_queue();
        }
        self.inner.rooms.clear();
        self.inner.stopped.cancel();

        if !clients.is_empty() {
            info!("Closed {} clients on shutdown", clients.len());
        }
    }

    /// Stop the hub: close every client, clear all rooms and wait for every
    /// connection worker to exit.
    ///
    /// Must not be awaited from inside a message handler, which is itself one
    /// of the workers being waited on.
    pub async fn shutdown(&self) {
        info!("Shutting down hub");
        self.inner.token.cancel();

        if self.inner.started.load(Ordering::Acquire) {
            self.inner.stopped.cancelled().await;
        } else {
            self.teardown();
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("clients", &self.client_count())
            .field("rooms", &self.room_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientState;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use tokio::time::Duration;
    use tokio_test::{assert_err, assert_ok};
    use tracing_test::traced_test;

    async fn started(config: HubConfig) -> Hub {
        let hub = Hub::new(config);
        hub.start();
        hub
    }

    async fn registered(hub: &Hub) -> Arc<Client> {
        let client = Client::new(hub, None);
        assert_ok!(hub.register(client.clone()).await);
        client
    }

    /// Wait for the event loop to catch up with queued dispatches
    async fn settle<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("hub never reached the expected state");
    }

    fn assert_rooms_within_clients(hub: &Hub) {
        let clients: HashSet<ClientId> = hub.clients().iter().map(|c| c.id()).collect();
        for name in hub.room_names() {
            for member in hub.room_clients(&name) {
                assert!(clients.contains(&member), "room {} holds unknown client", name);
            }
        }
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let hub = started(HubConfig::default()).await;
        let client = registered(&hub).await;

        assert_eq!(hub.client_count(), 1);
        assert_eq!(client.state(), ClientState::Active);
        assert!(hub.client(client.id()).is_some());

        assert!(hub.unregister(&client).await);
        assert!(!hub.unregister(&client).await);
        assert_eq!(hub.client_count(), 0);
        assert!(client.is_closed());

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_creates_and_leave_deletes_room() {
        let hub = started(HubConfig::default()).await;
        let a = registered(&hub).await;
        let b = registered(&hub).await;

        assert_ok!(hub.join_room(&a, "lobby").await);
        assert_ok!(hub.join_room(&b, "lobby").await);
        assert_eq!(hub.room_count(), 1);
        assert_eq!(hub.room_clients("lobby").len(), 2);

        assert!(assert_ok!(hub.leave_room(&a, "lobby").await));
        assert!(!assert_ok!(hub.leave_room(&a, "lobby").await));
        assert_eq!(hub.room_count(), 1);

        assert!(assert_ok!(hub.leave_room(&b, "lobby").await));
        assert_eq!(hub.room_count(), 0);
        assert!(hub.room_names().is_empty());

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_requires_registration_and_name() {
        let hub = started(HubConfig::default()).await;
        let stranger = Client::new(&hub, None);

        let err = assert_err!(hub.join_room(&stranger, "lobby").await);
        assert!(matches!(err, RealtimeError::ClientNotRegistered(id) if id == stranger.id()));
        assert_eq!(hub.room_count(), 0);

        let client = registered(&hub).await;
        let err = assert_err!(hub.join_room(&client, "").await);
        assert!(matches!(err, RealtimeError::InvalidPayload(_)));

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregister_removes_from_every_room() {
        let hub = started(HubConfig::default()).await;
        let a = registered(&hub).await;
        let b = registered(&hub).await;

        for room in ["one", "two", "three"] {
            assert_ok!(hub.join_room(&a, room).await);
        }
        assert_ok!(hub.join_room(&b, "two").await);
        assert_rooms_within_clients(&hub);

        assert!(hub.unregister(&a).await);
        assert_rooms_within_clients(&hub);
        assert_eq!(hub.room_names(), vec!["two".to_string()]);
        assert_eq!(hub.room_clients("two"), vec![b.id()]);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_isolates_full_queues() {
        let hub = started(HubConfig {
            send_queue_capacity: 1,
            ..HubConfig::default()
        })
        .await;
        let slow = registered(&hub).await;
        let fast = registered(&hub).await;

        assert_ok!(slow.send(&Message::new("filler")));
        assert_ok!(hub.broadcast(&Message::with_payload("news", json!(1))));
        settle(|| hub.stats().messages_dropped == 1).await;

        let stats = hub.stats();
        assert_eq!(stats.messages_delivered, 1);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(fast.queued_len(), 1);
        assert_eq!(slow.queued_len(), 1);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_queue_full_is_reported() {
        // Not started: nothing drains the dispatch queue.
        let hub = Hub::new(HubConfig {
            dispatch_queue_capacity: 1,
            ..HubConfig::default()
        });

        assert_ok!(hub.broadcast(&Message::new("first")));
        let err = assert_err!(hub.broadcast(&Message::new("second")));
        assert!(matches!(err, RealtimeError::DispatchQueueFull));
        assert_eq!(hub.stats().broadcasts_dropped, 1);

        hub.shutdown().await;
        assert!(matches!(
            hub.broadcast(&Message::new("third")),
            Err(RealtimeError::HubShutdown)
        ));
    }

    #[tokio::test]
    async fn test_broadcast_to_missing_room_is_noop() {
        let hub = started(HubConfig::default()).await;
        assert_ok!(hub.broadcast_to_room("nowhere", &Message::new("hello")));
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_to_room_except() {
        let hub = started(HubConfig::default()).await;
        let a = registered(&hub).await;
        let b = registered(&hub).await;
        assert_ok!(hub.join_room(&a, "lobby").await);
        assert_ok!(hub.join_room(&b, "lobby").await);

        assert_ok!(hub.broadcast_to_room_except("lobby", &Message::new("hi"), a.id()));
        settle(|| hub.stats().messages_delivered == 1).await;

        assert_eq!(a.queued_len(), 0);
        assert_eq!(b.queued_len(), 1);

        hub.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unknown_message_type_is_not_an_error() {
        let hub = started(HubConfig::default()).await;
        let client = registered(&hub).await;

        assert_ok!(hub.handle_message(&client, br#"{"type":"teleport"}"#).await);
        assert_eq!(client.queued_len(), 0);
        assert_eq!(hub.stats().unknown_message_types, 1);
        assert!(logs_contain("No handler registered for message type"));

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_message_is_an_error() {
        let hub = started(HubConfig::default()).await;
        let client = registered(&hub).await;

        let err = assert_err!(hub.handle_message(&client, b"{not json").await);
        assert!(matches!(err, RealtimeError::Protocol(_)));

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_custom_handler_replaces_default() {
        let hub = started(HubConfig::default()).await;
        let client = registered(&hub).await;

        hub.register_handler("ping", |client: Arc<Client>, _message| async move {
            client.send(&Message::new("custom_pong"))
        });
        assert_ok!(hub.handle_message(&client, br#"{"type":"ping"}"#).await);
        assert_eq!(client.queued_len(), 1);

        hub.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_clients_are_reaped() {
        let hub = started(HubConfig {
            ping_interval_secs: 1,
            stale_after_secs: 3,
            sweep_interval_secs: 1,
            ..HubConfig::default()
        })
        .await;
        let client = registered(&hub).await;
        assert_ok!(hub.join_room(&client, "lobby").await);

        time::sleep(Duration::from_secs(5)).await;

        assert_eq!(hub.client_count(), 0);
        assert_eq!(hub.room_count(), 0);
        assert!(client.is_closed());
        assert_eq!(hub.stats().stale_clients_reaped, 1);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_empties_hub() {
        let hub = started(HubConfig::default()).await;
        let mut clients = Vec::new();
        for i in 0..5 {
            let client = registered(&hub).await;
            assert_ok!(hub.join_room(&client, &format!("room-{}", i % 2)).await);
            clients.push(client);
        }
        assert_eq!(hub.client_count(), 5);
        assert_eq!(hub.room_count(), 2);

        hub.shutdown().await;

        assert!(hub.is_shutdown());
        assert_eq!(hub.client_count(), 0);
        assert_eq!(hub.room_count(), 0);
        for client in &clients {
            assert!(client.send(&Message::new("late")).is_err());
        }

        let late = Client::new(&hub, None);
        let err = assert_err!(hub.register(late).await);
        assert!(matches!(err, RealtimeError::HubShutdown));
    }

    #[tokio::test]
    async fn test_zero_intervals_are_clamped() {
        let hub = started(HubConfig {
            ping_interval_secs: 0,
            sweep_interval_secs: 0,
            write_timeout_secs: 0,
            ..HubConfig::default()
        })
        .await;
        assert_eq!(hub.config().sweep_interval(), Duration::from_secs(1));
        assert_eq!(hub.config().ping_interval(), Duration::from_secs(1));

        let client = registered(&hub).await;
        let (transport, _peer) = MemoryTransport::pair();
        client.start(transport);
        time::sleep(Duration::from_millis(50)).await;

        assert_ok!(time::timeout(Duration::from_secs(3), hub.shutdown()).await);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_requests_fail_before_start() {
        let hub = Hub::default();
        let client = Client::new(&hub, None);

        let err = assert_err!(
            time::timeout(Duration::from_secs(1), hub.register(client.clone()))
                .await
                .expect("register waited on a stopped loop")
        );
        assert!(matches!(err, RealtimeError::HubNotRunning));

        let err = assert_err!(hub.join_room(&client, "lobby").await);
        assert!(matches!(err, RealtimeError::HubNotRunning));
        assert!(!hub.unregister(&client).await);

        hub.start();
        assert_ok!(hub.register(client.clone()).await);
        assert_eq!(hub.client_count(), 1);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_serialize() {
        let hub = started(HubConfig::default()).await;
        let client = registered(&hub).await;
        assert_ok!(hub.join_room(&client, "lobby").await);

        let stats = serde_json::to_value(hub.stats()).unwrap();
        assert_eq!(stats["clients"], 1);
        assert_eq!(stats["rooms"], 1);
        assert_eq!(stats["room_members"]["lobby"], 1);

        hub.shutdown().await;
    }
}
