//! Connection boundary: upgrade, authenticate, admit
//!
//! [`Upgrader`] turns an accepted transport into a registered, running
//! [`Client`]. [`Server`] is a plain TCP accept loop that performs the
//! WebSocket handshake with tokio-tungstenite and hands the result to the
//! upgrader.

use crate::auth::{default_token_extractor, Authenticator, ConnectRequest, TokenExtractor};
use crate::client::Client;
use crate::config::ServerConfig;
use crate::error::{RealtimeError, RealtimeResult};
use crate::hub::Hub;
use crate::transport::{Transport, WsTransport};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tracing::{debug, info, warn};

/// Admits transports into a hub
#[derive(Clone)]
pub struct Upgrader {
    hub: Hub,
    authenticator: Option<Arc<dyn Authenticator>>,
    token_extractor: TokenExtractor,
}

impl Upgrader {
    /// An upgrader that admits every connection anonymously
    pub fn new(hub: Hub) -> Self {
        Self {
            hub,
            authenticator: None,
            token_extractor: default_token_extractor(),
        }
    }

    /// Require every connection to authenticate
    pub fn with_authenticator<A: Authenticator + 'static>(mut self, authenticator: A) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    pub fn with_token_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&ConnectRequest) -> Option<String> + Send + Sync + 'static,
    {
        self.token_extractor = Arc::new(extractor);
        self
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn requires_auth(&self) -> bool {
        self.authenticator.is_some()
    }

    /// Resolve the user behind a request. `Ok(None)` when no authenticator
    /// is configured.
    pub async fn authorize(&self, request: &ConnectRequest) -> RealtimeResult<Option<String>> {
        let Some(authenticator) = &self.authenticator else {
            return Ok(None);
        };

        let token = (self.token_extractor)(request)
            .ok_or_else(|| RealtimeError::authentication("missing token"))?;
        let user_id = authenticator.authenticate(request, &token).await?;
        Ok(Some(user_id))
    }

    /// Register a client for `transport` and start its workers
    pub async fn admit<T: Transport>(
        &self,
        user_id: Option<String>,
        transport: T,
    ) -> RealtimeResult<Arc<Client>> {
        let client = Client::new(&self.hub, user_id);
        self.hub.register(client.clone()).await?;
        client.start(transport);

        info!(client_id = %client.id(), user_id = ?client.user_id(), "Client connected");
        Ok(client)
    }

    /// Authenticate then admit. A rejected request never becomes a client.
    pub async fn accept<T: Transport>(
        &self,
        request: &ConnectRequest,
        transport: T,
    ) -> RealtimeResult<Arc<Client>> {
        let user_id = self.authorize(request).await?;
        self.admit(user_id, transport).await
    }
}

impl std::fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgrader")
            .field("requires_auth", &self.requires_auth())
            .finish()
    }
}

/// WebSocket server in front of a hub
pub struct Server {
    hub: Hub,
    upgrader: Upgrader,
    config: ServerConfig,
    connections: Arc<Semaphore>,
}

impl Server {
    pub fn new(hub: Hub, config: ServerConfig) -> Self {
        let connections = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Self {
            upgrader: Upgrader::new(hub.clone()),
            hub,
            config,
            connections,
        }
    }

    pub fn with_upgrader(mut self, upgrader: Upgrader) -> Self {
        self.upgrader = upgrader;
        self
    }

    pub fn upgrader(&self) -> &Upgrader {
        &self.upgrader
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn bind(&self) -> RealtimeResult<TcpListener> {
        self.config.validate()?;
        Ok(TcpListener::bind(self.config.socket_addr()).await?)
    }

    /// Bind the configured address and serve until the hub shuts down
    pub async fn run(self) -> RealtimeResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until the hub shuts down
    pub async fn serve(self, listener: TcpListener) -> RealtimeResult<()> {
        let shutdown = self.hub.cancellation_token();
        info!("Realtime server listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let Ok(permit) = self.connections.clone().try_acquire_owned() else {
                warn!(peer = %peer, "Connection limit reached, refusing connection");
                drop(stream);
                continue;
            };

            let upgrader = self.upgrader.clone();
            self.hub.spawn(async move {
                let _permit = permit;
                if let Err(e) = handle_connection(upgrader, stream, peer).await {
                    debug!(peer = %peer, error = %e, "Connection ended with error");
                }
            });
        }

        info!("Realtime server stopped accepting connections");
        Ok(())
    }
}

async fn handle_connection(
    upgrader: Upgrader,
    stream: TcpStream,
    peer: SocketAddr,
) -> RealtimeResult<()> {
    let config = upgrader.hub().config().clone();

    let captured: Arc<Mutex<Option<ConnectRequest>>> = Arc::new(Mutex::new(None));
    let slot = captured.clone();
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        *slot.lock() = Some(ConnectRequest::from_handshake(request, Some(peer)));
        Ok(response)
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);

    let handshake =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config));
    let mut ws = time::timeout(config.write_timeout(), handshake)
        .await
        .map_err(|_| RealtimeError::Transport("handshake timed out".to_string()))??;

    let request = captured
        .lock()
        .take()
        .unwrap_or_else(|| ConnectRequest::default().with_peer_addr(peer));

    let user_id = match upgrader.authorize(&request).await {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!(peer = %peer, path = %request.path, error = %e, "Rejected connection");
            let close = CloseFrame {
                code: CloseCode::Policy,
                reason: Cow::Borrowed("unauthorized"),
            };
            if let Err(close_err) = ws.close(Some(close)).await {
                debug!(peer = %peer, error = %close_err, "Close after rejection failed");
            }
            return Err(e);
        }
    };

    let client = upgrader.admit(user_id, WsTransport::new(ws)).await?;

    // Hold the connection slot for as long as the client lives.
    client.closed().await;
    Ok(())
}
