//! Cluster token sub-protocol
//!
//! A server fetches a client's cluster token lazily over a transient
//! TokenConnect virtual stream addressed to the well-known endpoint
//! ([`CLIENT_TOKEN_PROTO`]/[`CLIENT_TOKEN_ADDRESS`]). The client answers with
//! one Data frame carrying the JSON-encoded token payload and closes the
//! stream. Fetched tokens are cached in a bounded LRU keyed by client key;
//! a RemoveClient announcement evicts the entry so reconnecting clients never
//! serve stale credentials.

use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::session::Session;
use crate::stream::TunnelStream;

/// Well-known protocol of the token endpoint
pub const CLIENT_TOKEN_PROTO: &str = "client-token-proto";

/// Well-known address of the token endpoint
pub const CLIENT_TOKEN_ADDRESS: &str = "client-token-address";

/// Credentials fetched from a client
///
/// The JSON field names are part of the wire contract; both ends encode and
/// decode through this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientToken {
    /// Cluster token
    pub token: String,
    /// CA certificate bundle, PEM encoded
    pub cacert: String,
}

/// Function producing one credential string on demand
pub type TokenGetter = Arc<dyn Fn() -> Result<String> + Send + Sync>;

/// Paired token and CA certificate getters for the client side
#[derive(Clone)]
pub struct TokenSource {
    token: TokenGetter,
    cacert: TokenGetter,
}

impl TokenSource {
    /// Create a token source from a pair of getters
    #[must_use]
    pub fn new(token: TokenGetter, cacert: TokenGetter) -> Self {
        Self { token, cacert }
    }

    /// Invoke both getters and assemble the payload
    pub(crate) fn collect(&self) -> Result<ClientToken> {
        Ok(ClientToken {
            token: (self.token)()?,
            cacert: (self.cacert)()?,
        })
    }
}

static REGISTERED_SOURCE: OnceLock<TokenSource> = OnceLock::new();

/// Register process-wide token getters
///
/// Compatibility shim for callers that cannot thread a [`TokenSource`]
/// through their client configuration. Set once at startup; reads are
/// lock-free afterwards and later registrations are ignored. Prefer
/// `TunnelClient::with_token_source`.
pub fn register_token_getter(token: TokenGetter, cacert: TokenGetter) {
    let _ = REGISTERED_SOURCE.set(TokenSource::new(token, cacert));
}

/// The process-wide token source, if one was registered
pub(crate) fn registered_source() -> Option<TokenSource> {
    REGISTERED_SOURCE.get().cloned()
}

/// Answer a TokenConnect request: one Data frame with the JSON payload, then
/// a clean close. Getter or encoding failures surface to the peer as the
/// stream's Error frame.
pub(crate) async fn serve_token_request(
    session: &Arc<Session>,
    mut stream: TunnelStream,
    source: Option<TokenSource>,
) {
    let conn_id = stream.conn_id();
    let payload = match source {
        None => Err("no token source registered".to_string()),
        Some(source) => source
            .collect()
            .and_then(|token| {
                serde_json::to_vec(&token).map_err(crate::error::TunnelError::transport)
            })
            .map_err(|e| e.to_string()),
    };

    match payload {
        Ok(bytes) => {
            if let Err(e) = stream.write_all(&bytes).await {
                session.fail_connection(conn_id, e.to_string()).await;
                return;
            }
            let _ = stream.shutdown().await;
        }
        Err(reason) => {
            tracing::warn!(conn_id, reason = %reason, "token request failed");
            session.fail_connection(conn_id, reason).await;
        }
    }
}

/// Bounded LRU of client key to [`ClientToken`]; eviction is LRU-only
#[derive(Clone)]
pub struct TokenCache {
    cache: Arc<Mutex<LruCache<String, ClientToken>>>,
}

impl TokenCache {
    /// Create a cache holding at most `capacity` tokens (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Fetch the cached token for `client_key`, refreshing its recency
    #[must_use]
    pub fn get(&self, client_key: &str) -> Option<ClientToken> {
        self.cache.lock().get(client_key).cloned()
    }

    /// Insert or replace the token for `client_key`
    pub fn add(&self, client_key: &str, token: ClientToken) {
        self.cache.lock().put(client_key.to_string(), token);
    }

    /// Evict the token for `client_key`
    pub fn remove(&self, client_key: &str) {
        self.cache.lock().pop(client_key);
    }

    /// Whether a token is cached for `client_key`
    #[must_use]
    pub fn contains(&self, client_key: &str) -> bool {
        self.cache.lock().contains(client_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(t: &str, ca: &str) -> ClientToken {
        ClientToken {
            token: t.to_string(),
            cacert: ca.to_string(),
        }
    }

    #[test]
    fn test_client_token_json_field_names() {
        // The lowercase keys are the wire contract
        let encoded = serde_json::to_string(&token("tk", "ca")).unwrap();
        assert_eq!(encoded, r#"{"token":"tk","cacert":"ca"}"#);

        let decoded: ClientToken = serde_json::from_str(r#"{"token":"tk","cacert":"ca"}"#).unwrap();
        assert_eq!(decoded, token("tk", "ca"));
    }

    #[test]
    fn test_client_token_rejects_missing_fields() {
        let result: std::result::Result<ClientToken, _> = serde_json::from_str(r#"{"token":"tk"}"#);
        assert!(result.is_err(), "cacert is required");
    }

    #[test]
    fn test_token_source_collects_both_getters() {
        let source = TokenSource::new(
            Arc::new(|| Ok("tk".to_string())),
            Arc::new(|| Ok("ca".to_string())),
        );
        assert_eq!(source.collect().unwrap(), token("tk", "ca"));
    }

    #[test]
    fn test_token_source_propagates_getter_error() {
        let source = TokenSource::new(
            Arc::new(|| Err(crate::error::TunnelError::token_unavailable("c"))),
            Arc::new(|| Ok("ca".to_string())),
        );
        assert!(source.collect().is_err());
    }

    #[test]
    fn test_cache_add_get_remove_contains() {
        let cache = TokenCache::new(4);
        assert!(!cache.contains("a"));
        assert!(cache.get("a").is_none());

        cache.add("a", token("tk", "ca"));
        assert!(cache.contains("a"));
        assert_eq!(cache.get("a").unwrap(), token("tk", "ca"));

        cache.remove("a");
        assert!(!cache.contains("a"));
    }

    #[test]
    fn test_cache_add_replaces_existing() {
        let cache = TokenCache::new(4);
        cache.add("a", token("old", "ca"));
        cache.add("a", token("new", "ca"));
        assert_eq!(cache.get("a").unwrap().token, "new");
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let cache = TokenCache::new(2);
        cache.add("a", token("ta", "ca"));
        cache.add("b", token("tb", "cb"));

        // Touch "a" so "b" becomes the eviction candidate
        let _ = cache.get("a");
        cache.add("c", token("tc", "cc"));

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"), "least recently used entry is evicted");
        assert!(cache.contains("c"));
    }

    #[test]
    fn test_cache_minimum_capacity() {
        let cache = TokenCache::new(0);
        cache.add("a", token("t", "c"));
        assert!(cache.contains("a"));
    }

    #[test]
    fn test_registered_source_shim() {
        register_token_getter(
            Arc::new(|| Ok("global-token".to_string())),
            Arc::new(|| Ok("global-cacert".to_string())),
        );
        let source = registered_source().expect("source registered");
        assert_eq!(source.collect().unwrap().token, "global-token");

        // Later registrations are ignored
        register_token_getter(
            Arc::new(|| Ok("other".to_string())),
            Arc::new(|| Ok("other".to_string())),
        );
        let source = registered_source().unwrap();
        assert_eq!(source.collect().unwrap().token, "global-token");
    }
}
