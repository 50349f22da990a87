//! Connection authentication
//!
//! A token is pulled out of the [`ConnectRequest`] by a [`TokenExtractor`]
//! and checked by an [`Authenticator`], which maps it to a user id.

use crate::error::{RealtimeError, RealtimeResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::handshake::server::Request;

/// What the server saw of an inbound connection before upgrading it
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub peer_addr: Option<SocketAddr>,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names are lowercased
    pub headers: HashMap<String, String>,
}

impl ConnectRequest {
    pub fn new<T: Into<String>>(path: T) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Capture a WebSocket handshake request
    pub fn from_handshake(request: &Request, peer_addr: Option<SocketAddr>) -> Self {
        let uri = request.uri();
        let query = uri
            .query()
            .and_then(|query| serde_urlencoded::from_str(query).ok())
            .unwrap_or_default();

        let headers = request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();

        Self {
            peer_addr,
            path: uri.path().to_string(),
            query,
            headers,
        }
    }

    /// Parse and merge a raw query string
    pub fn with_query(mut self, query: &str) -> RealtimeResult<Self> {
        let parsed: HashMap<String, String> = serde_urlencoded::from_str(query)
            .map_err(|e| RealtimeError::protocol(format!("invalid query string: {}", e)))?;
        self.query.extend(parsed);
        Ok(self)
    }

    pub fn with_header<K: AsRef<str>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Finds the credential in a connection request
pub type TokenExtractor = Arc<dyn Fn(&ConnectRequest) -> Option<String> + Send + Sync>;

/// The `token` query parameter, else an `Authorization: Bearer` header
pub fn default_token_extractor() -> TokenExtractor {
    Arc::new(|request: &ConnectRequest| {
        if let Some(token) = request.query_param("token").filter(|t| !t.is_empty()) {
            return Some(token.to_string());
        }

        request
            .header("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    })
}

/// Maps a token to a user id, or rejects the connection
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &ConnectRequest, token: &str) -> RealtimeResult<String>;
}

/// [`Authenticator`] backed by an async closure over the token
pub struct FnAuthenticator<F> {
    check: F,
}

impl<F, Fut> FnAuthenticator<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RealtimeResult<String>> + Send + 'static,
{
    pub fn new(check: F) -> Self {
        Self { check }
    }
}

#[async_trait]
impl<F, Fut> Authenticator for FnAuthenticator<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RealtimeResult<String>> + Send + 'static,
{
    async fn authenticate(&self, _request: &ConnectRequest, token: &str) -> RealtimeResult<String> {
        (self.check)(token.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_query_token_preferred_over_header() {
        let extract = default_token_extractor();
        let request = ConnectRequest::new("/ws")
            .with_query("token=from-query&x=1")
            .unwrap()
            .with_header("Authorization", "Bearer from-header");

        assert_eq!(extract(&request), Some("from-query".to_string()));
    }

    #[test]
    fn test_bearer_header_fallback() {
        let extract = default_token_extractor();
        let request = ConnectRequest::new("/ws").with_header("AUTHORIZATION", "Bearer abc123");
        assert_eq!(extract(&request), Some("abc123".to_string()));

        let basic = ConnectRequest::new("/ws").with_header("authorization", "Basic Zm9v");
        assert_eq!(extract(&basic), None);
        assert_eq!(extract(&ConnectRequest::new("/ws")), None);
    }

    #[test]
    fn test_from_handshake() {
        let request = Request::builder()
            .uri("/ws?token=t%201&room=lobby")
            .header("X-Client", "demo")
            .body(())
            .unwrap();

        let captured = ConnectRequest::from_handshake(&request, None);
        assert_eq!(captured.path, "/ws");
        assert_eq!(captured.query_param("token"), Some("t 1"));
        assert_eq!(captured.header("x-client"), Some("demo"));
    }

    #[tokio::test]
    async fn test_fn_authenticator() {
        let auth = FnAuthenticator::new(|token: String| async move {
            if token == "secret" {
                Ok("alice".to_string())
            } else {
                Err(RealtimeError::authentication("bad token"))
            }
        });
        let request = ConnectRequest::new("/ws");

        assert_eq!(assert_ok!(auth.authenticate(&request, "secret").await), "alice");
        let err = assert_err!(auth.authenticate(&request, "guess").await);
        assert!(matches!(err, RealtimeError::Authentication(_)));
    }
}
