//! Message routing by envelope type

use crate::client::Client;
use crate::error::RealtimeResult;
use crate::handlers;
use crate::message::Message;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Handler invoked for every inbound message of one type
pub type MessageHandler =
    Arc<dyn Fn(Arc<Client>, Message) -> BoxFuture<'static, RealtimeResult<()>> + Send + Sync>;

/// Registry mapping message types to handlers
pub struct MessageRouter {
    handlers: RwLock<HashMap<String, MessageHandler>>,
}

impl MessageRouter {
    /// An empty router
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// A router with the built-in handlers installed
    pub fn with_defaults() -> Self {
        let router = Self::new();
        handlers::install_defaults(&router);
        router
    }

    /// Register a handler for a message type, replacing any previous one
    pub fn register<K, F, Fut>(&self, kind: K, handler: F)
    where
        K: Into<String>,
        F: Fn(Arc<Client>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RealtimeResult<()>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(
            move |client: Arc<Client>, message: Message| -> BoxFuture<'static, RealtimeResult<()>> {
                Box::pin(handler(client, message))
            },
        );
        self.register_handler(kind, handler);
    }

    /// Register an already boxed handler
    pub fn register_handler<K: Into<String>>(&self, kind: K, handler: MessageHandler) {
        let kind = kind.into();
        let replaced = self.handlers.write().insert(kind.clone(), handler).is_some();

        if replaced {
            info!("Replaced message handler for type: {}", kind);
        } else {
            info!("Registered message handler for type: {}", kind);
        }
    }

    /// Handler for a message type, if any
    pub fn handler(&self, kind: &str) -> Option<MessageHandler> {
        self.handlers.read().get(kind).cloned()
    }

    /// Remove a handler. Returns false if none was registered.
    pub fn remove(&self, kind: &str) -> bool {
        self.handlers.write().remove(kind).is_some()
    }

    /// Whether a handler is registered for a message type
    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.read().contains_key(kind)
    }

    /// Registered message types, sorted
    pub fn message_types(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Dispatch a message to its handler.
    ///
    /// Returns `Ok(false)` when no handler is registered for the type. The
    /// handler runs after the registry lock is released, so handlers may
    /// register or remove other handlers.
    pub async fn route(&self, client: Arc<Client>, message: Message) -> RealtimeResult<bool> {
        let Some(handler) = self.handler(message.kind()) else {
            return Ok(false);
        };

        debug!(client_id = %client.id(), message_type = %message.kind(), "Routing message");
        handler(client, message).await?;
        Ok(true)
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("message_types", &self.message_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RealtimeError;
    use crate::hub::Hub;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_route_to_registered_handler() {
        let hub = Hub::default();
        let client = Client::new(&hub, None);
        let router = MessageRouter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        router.register("count", move |_client, _message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert!(router.route(client.clone(), Message::new("count")).await.unwrap());
        assert!(!router.route(client, Message::new("unknown")).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let hub = Hub::default();
        let client = Client::new(&hub, None);
        let router = MessageRouter::new();

        router.register("fail", |_client, _message| async {
            Err(RealtimeError::invalid_payload("nope"))
        });

        let result = router.route(client, Message::new("fail")).await;
        assert!(matches!(result, Err(RealtimeError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_replace_and_remove() {
        let router = MessageRouter::new();
        router.register("a", |_c, _m| async { Ok(()) });
        router.register("a", |_c, _m| async { Ok(()) });
        router.register("b", |_c, _m| async { Ok(()) });

        assert_eq!(router.message_types(), vec!["a".to_string(), "b".to_string()]);
        assert!(router.remove("a"));
        assert!(!router.remove("a"));
        assert!(!router.contains("a"));
    }

    #[test]
    fn test_defaults_installed() {
        let router = MessageRouter::with_defaults();
        for kind in ["ping", "join_room", "leave_room", "broadcast", "echo", "status"] {
            assert!(router.contains(kind), "missing default handler {}", kind);
        }
    }
}
