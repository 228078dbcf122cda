//! Session routing: client key to sessions, peer forwarding, token cache
//!
//! The [`SessionManager`] owns every session a server accepted plus the
//! outbound peer sessions (listeners) used to announce local clients to the
//! rest of the mesh. Dials for a client key round-robin over that client's
//! sessions and fall back to any peer session that advertised the key.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::dial::{BoxedConn, Dialer};
use crate::error::{Result, TunnelError};
use crate::session::{Session, SessionParams, WsStream};
use crate::stream::TunnelStream;
use crate::token::TokenCache;

/// Ordered sessions for one client key with a round-robin cursor
#[derive(Default)]
struct ClientSessions {
    sessions: Vec<Arc<Session>>,
    next: usize,
}

impl ClientSessions {
    fn pick(&mut self) -> Option<Arc<Session>> {
        if self.sessions.is_empty() {
            return None;
        }
        let session = Arc::clone(&self.sessions[self.next % self.sessions.len()]);
        self.next = self.next.wrapping_add(1);
        Some(session)
    }
}

/// Maps client keys to sessions and routes new virtual dials
pub struct SessionManager {
    clients: Mutex<HashMap<String, ClientSessions>>,
    /// Inbound sessions authenticated as peers, by peer id
    peers: DashMap<String, Arc<Session>>,
    /// Outbound peer sessions that receive AddClient/RemoveClient
    /// announcements, by session key
    listeners: Mutex<HashMap<i64, Arc<Session>>>,
    token_cache: TokenCache,
    next_session_key: AtomicI64,
}

impl SessionManager {
    /// Create a manager with a token cache of the given capacity
    #[must_use]
    pub fn new(token_cache_size: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            peers: DashMap::new(),
            listeners: Mutex::new(HashMap::new()),
            token_cache: TokenCache::new(token_cache_size),
            next_session_key: AtomicI64::new(0),
        }
    }

    /// Allocate the next monotonic session key
    pub(crate) fn allocate_session_key(&self) -> i64 {
        self.next_session_key.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The token cache shared by all sessions of this manager
    #[must_use]
    pub fn token_cache(&self) -> &TokenCache {
        &self.token_cache
    }

    /// Register a freshly upgraded transport as a session
    ///
    /// Non-peer sessions are announced to every listener so the mesh learns
    /// the new client.
    pub(crate) async fn add_session(
        &self,
        client_key: &str,
        ws: WsStream,
        is_peer: bool,
    ) -> Arc<Session> {
        let session_key = self.allocate_session_key();
        let cache = self.token_cache.clone();
        let session = Session::new(
            ws,
            SessionParams {
                session_key,
                client_key: client_key.to_string(),
                remove_client_hook: Some(Arc::new(move |key: &str| cache.remove(key))),
                ..SessionParams::default()
            },
        );

        if is_peer {
            if let Some(old) = self
                .peers
                .insert(client_key.to_string(), Arc::clone(&session))
            {
                old.close().await;
            }
            tracing::info!(peer = %client_key, session_key, "peer session added");
        } else {
            self.clients
                .lock()
                .entry(client_key.to_string())
                .or_default()
                .sessions
                .push(Arc::clone(&session));
            tracing::info!(client_key = %client_key, session_key, "session added");

            for listener in self.listener_snapshot() {
                listener.session_added(client_key, session_key).await;
            }
        }

        session
    }

    /// Unregister a session and close it
    ///
    /// Non-peer removals are announced to every listener.
    pub(crate) async fn remove_session(&self, session: &Arc<Session>) {
        let client_key = session.client_key().to_string();
        let session_key = session.session_key();

        let removed_client = {
            let mut clients = self.clients.lock();
            let mut removed = false;
            if let Some(entry) = clients.get_mut(&client_key) {
                let before = entry.sessions.len();
                entry.sessions.retain(|s| s.session_key() != session_key);
                removed = entry.sessions.len() != before;
                if entry.sessions.is_empty() {
                    clients.remove(&client_key);
                }
            }
            removed
        };

        if removed_client {
            tracing::info!(client_key = %client_key, session_key, "session removed");
            for listener in self.listener_snapshot() {
                listener.session_removed(&client_key, session_key).await;
            }
        } else {
            let removed_peer = self
                .peers
                .remove_if(&client_key, |_, existing| Arc::ptr_eq(existing, session))
                .is_some();
            if removed_peer {
                tracing::info!(peer = %client_key, session_key, "peer session removed");
            }
        }

        session.close().await;
    }

    /// Register an outbound peer session as an announcement listener,
    /// telling it about every client currently attached
    pub(crate) async fn add_listener(&self, session: Arc<Session>) {
        self.listeners
            .lock()
            .insert(session.session_key(), Arc::clone(&session));

        // Register first, snapshot second: a concurrently attaching client
        // is then announced twice at worst, and the remote key set absorbs
        // duplicates
        let existing: Vec<(String, i64)> = {
            let clients = self.clients.lock();
            clients
                .iter()
                .flat_map(|(key, entry)| {
                    entry
                        .sessions
                        .iter()
                        .map(|s| (key.clone(), s.session_key()))
                })
                .collect()
        };

        for (client_key, session_key) in existing {
            session.session_added(&client_key, session_key).await;
        }
    }

    /// Drop an announcement listener
    pub(crate) fn remove_listener(&self, session: &Arc<Session>) {
        self.listeners.lock().remove(&session.session_key());
    }

    fn listener_snapshot(&self) -> Vec<Arc<Session>> {
        // Snapshot under the lock; announcement writes may block and must
        // not hold it
        self.listeners.lock().values().cloned().collect()
    }

    /// Select a session for `client_key`
    ///
    /// Direct sessions are preferred (round-robin); otherwise any peer
    /// session that advertised the key is used and the returned prefix must
    /// be prepended to the dial protocol as `clientKey::proto`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::NoSession`] if neither path is available.
    pub fn get_session(&self, client_key: &str) -> Result<(Arc<Session>, String)> {
        if let Some(session) = self
            .clients
            .lock()
            .get_mut(client_key)
            .and_then(ClientSessions::pick)
        {
            return Ok((session, String::new()));
        }

        for entry in self.peers.iter() {
            if entry.value().has_remote_client(client_key) {
                return Ok((Arc::clone(entry.value()), client_key.to_string()));
            }
        }

        Err(TunnelError::no_session(client_key))
    }

    /// Whether any route to `client_key` exists
    #[must_use]
    pub fn has_session(&self, client_key: &str) -> bool {
        if self
            .clients
            .lock()
            .get(client_key)
            .is_some_and(|entry| !entry.sessions.is_empty())
        {
            return true;
        }
        self.peers
            .iter()
            .any(|entry| entry.value().has_remote_client(client_key))
    }

    /// Open a virtual connection to `proto`/`address` through `client_key`
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::NoSession`] if no route exists, or the write
    /// error that prevented the Connect frame from being sent.
    pub async fn dial(
        &self,
        client_key: &str,
        deadline: Duration,
        proto: &str,
        address: &str,
    ) -> Result<TunnelStream> {
        let (session, prefix) = self.get_session(client_key)?;
        let proto = prefixed_proto(&prefix, proto);
        session.server_connect(deadline, &proto, address).await
    }

    /// Open a token-request connection through `client_key`
    ///
    /// # Errors
    ///
    /// Same failure modes as [`SessionManager::dial`].
    pub async fn token_dial(
        &self,
        client_key: &str,
        deadline: Duration,
        proto: &str,
        address: &str,
    ) -> Result<TunnelStream> {
        let (session, prefix) = self.get_session(client_key)?;
        let proto = prefixed_proto(&prefix, proto);
        session.server_token_connect(deadline, &proto, address).await
    }

    /// Close and remove every session registered for `client_key`
    pub async fn close_client_sessions(&self, client_key: &str) {
        let sessions = {
            let mut clients = self.clients.lock();
            clients
                .remove(client_key)
                .map(|entry| entry.sessions)
                .unwrap_or_default()
        };
        for session in sessions {
            for listener in self.listener_snapshot() {
                listener
                    .session_removed(client_key, session.session_key())
                    .await;
            }
            session.close().await;
        }
    }

    /// Total live virtual connections across the sessions of `client_key`
    #[must_use]
    pub fn active_virtual_connections(&self, client_key: &str) -> usize {
        self.clients
            .lock()
            .get(client_key)
            .map(|entry| {
                entry
                    .sessions
                    .iter()
                    .map(|s| s.connection_count())
                    .sum()
            })
            .unwrap_or(0)
    }
}

fn prefixed_proto(prefix: &str, proto: &str) -> String {
    if prefix.is_empty() {
        proto.to_string()
    } else {
        format!("{prefix}::{proto}")
    }
}

/// Build a [`Dialer`] over a manager shared behind an `Arc`
#[must_use]
pub fn manager_dialer(
    sessions: Arc<SessionManager>,
    client_key: &str,
    deadline: Duration,
) -> Dialer {
    let client_key = client_key.to_string();
    Arc::new(move |proto: String, address: String| {
        let sessions = Arc::clone(&sessions);
        let client_key = client_key.clone();
        Box::pin(async move {
            let stream = sessions
                .dial(&client_key, deadline, &proto, &address)
                .await
                .map_err(io::Error::other)?;
            Ok(Box::new(stream) as BoxedConn)
        })
    })
}

/// Forwarding dialer for an outbound peer session: dials carry
/// `clientKey::proto` and are routed back through the local manager
///
/// `token_requests` selects the TokenConnect path, so a forwarded token
/// request reaches the terminal client with its frame type intact instead of
/// degrading into a plain Connect.
pub(crate) fn peer_forwarder(
    sessions: Arc<SessionManager>,
    deadline: Duration,
    token_requests: bool,
) -> Dialer {
    Arc::new(move |network: String, address: String| {
        let sessions = Arc::clone(&sessions);
        Box::pin(async move {
            let (client_key, proto) = network.split_once("::").ok_or_else(|| {
                io::Error::other(format!("invalid peer dial protocol {network}"))
            })?;
            let stream = if token_requests {
                sessions
                    .token_dial(client_key, deadline, proto, &address)
                    .await
            } else {
                sessions.dial(client_key, deadline, proto, &address).await
            }
            .map_err(io::Error::other)?;
            Ok(Box::new(stream) as BoxedConn)
        })
    })
}
