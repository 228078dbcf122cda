//! Tunnel server: accepts sessions over a WebSocket upgrade endpoint
//!
//! Each inbound connection is authenticated during the handshake: the peer
//! headers [`ID_HEADER`]/[`TOKEN_HEADER`] mark sessions from other servers in
//! the mesh, anything else goes through the pluggable [`Authorizer`].
//! Rejections are answered as HTTP handshake responses (401 for failed auth,
//! 400 for bad requests); once the socket is upgraded, serve errors can only
//! be logged.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::dial::Dialer;
use crate::error::{Result, TunnelError};
use crate::manager::{manager_dialer, peer_forwarder, SessionManager};
use crate::session::{Session, SessionParams};
use crate::stream::TunnelStream;
use crate::token::{ClientToken, CLIENT_TOKEN_ADDRESS, CLIENT_TOKEN_PROTO};

/// Request header carrying the peer id
pub const ID_HEADER: &str = "ID";

/// Request header carrying the peer token
pub const TOKEN_HEADER: &str = "Token";

/// Delay between reconnect attempts of an outbound peer connection
const PEER_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// The WebSocket upgrade request as seen by auth callbacks
pub type HandshakeRequest = Request;

/// Decides `(client_key, authed)` for a non-peer upgrade request
pub type Authorizer = Arc<dyn Fn(&HandshakeRequest) -> Result<(String, bool)> + Send + Sync>;

/// Builds the HTTP response for a rejected handshake
pub type ErrorWriter = Arc<dyn Fn(u16, &TunnelError) -> ErrorResponse + Send + Sync>;

/// Default [`ErrorWriter`]: status code plus the error text as the body
#[must_use]
pub fn default_error_writer(code: u16, err: &TunnelError) -> ErrorResponse {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = status;
    response
}

struct PeerEntry {
    token: String,
    cancel: CancellationToken,
}

/// Tunnel server: session acceptance, routing, peer mesh, token fetching
pub struct Server {
    config: ServerConfig,
    authorizer: Authorizer,
    error_writer: ErrorWriter,
    /// Identity presented to other servers when dialing out as a peer
    peer_identity: Mutex<Option<(String, String)>>,
    /// Registered peers by id; used to authenticate inbound peer sessions
    /// and to keep outbound connections alive
    peers: DashMap<String, PeerEntry>,
    sessions: Arc<SessionManager>,
}

impl Server {
    /// Create a server with the given configuration and authorizer
    #[must_use]
    pub fn new(config: ServerConfig, authorizer: Authorizer) -> Self {
        let sessions = Arc::new(SessionManager::new(config.token_cache_size));
        Self {
            config,
            authorizer,
            error_writer: Arc::new(default_error_writer),
            peer_identity: Mutex::new(None),
            peers: DashMap::new(),
            sessions,
        }
    }

    /// Replace the handshake rejection writer (builder pattern)
    #[must_use]
    pub fn with_error_writer(mut self, error_writer: ErrorWriter) -> Self {
        self.error_writer = error_writer;
        self
    }

    /// Set the id and token this server presents when connecting to peers
    /// (builder pattern)
    #[must_use]
    pub fn with_peer_identity(self, id: impl Into<String>, token: impl Into<String>) -> Self {
        *self.peer_identity.lock() = Some((id.into(), token.into()));
        self
    }

    /// Bind `addr` and accept tunnel connections until the listener fails
    ///
    /// # Errors
    ///
    /// Returns an error if binding or accepting fails fatally.
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "tunnel server listening");
        self.serve_listener(listener).await
    }

    /// Accept tunnel connections from an already bound listener
    ///
    /// # Errors
    ///
    /// Returns an error when accepting fails fatally.
    pub async fn serve_listener(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    tracing::info!(addr = %addr, code = e.http_code(), error = %e, "connection ended");
                }
            });
        }
    }

    /// Upgrade one inbound connection and serve its session to completion
    ///
    /// # Errors
    ///
    /// Returns the handshake, auth, or serve error that ended the
    /// connection.
    pub async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<()> {
        let mut authed: Option<(String, bool)> = None;
        let mut auth_err: Option<TunnelError> = None;

        let callback = |request: &Request,
                        response: Response|
         -> std::result::Result<Response, ErrorResponse> {
            match self.authenticate(request) {
                Ok(result) => {
                    authed = Some(result);
                    Ok(response)
                }
                Err(e) => {
                    let rejection = (self.error_writer)(e.http_code(), &e);
                    auth_err = Some(e);
                    Err(rejection)
                }
            }
        };

        let upgrade = timeout(
            self.config.handshake_timeout,
            accept_hdr_async(MaybeTlsStream::Plain(stream), callback),
        )
        .await;

        let ws = match upgrade {
            Err(_) => return Err(TunnelError::Timeout),
            Ok(Err(e)) => {
                return Err(auth_err.unwrap_or_else(|| TunnelError::transport(e)));
            }
            Ok(Ok(ws)) => ws,
        };
        let (client_key, is_peer) =
            authed.ok_or_else(|| TunnelError::malformed("handshake finished without auth"))?;

        tracing::info!(
            client_key = %client_key,
            addr = %addr,
            peer = is_peer,
            "handling backend connection request"
        );

        let session = self.sessions.add_session(&client_key, ws, is_peer).await;
        let result = session.serve().await;
        self.sessions.remove_session(&session).await;

        // The socket is hijacked after the upgrade; the caller can only log
        result
    }

    fn authenticate(&self, request: &HandshakeRequest) -> Result<(String, bool)> {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
        };

        let id = header(ID_HEADER);
        let token = header(TOKEN_HEADER);
        if !id.is_empty() && !token.is_empty() {
            if let Some(peer) = self.peers.get(id) {
                if peer.token == token {
                    return Ok((id.to_string(), true));
                }
            }
        }

        let (client_key, authed) = (self.authorizer)(request)?;
        if !authed {
            return Err(TunnelError::AuthFailed);
        }
        Ok((client_key, false))
    }

    /// Register a peer server and keep an outbound connection to it alive
    ///
    /// The peer must know this server under the identity configured with
    /// [`Server::with_peer_identity`]. Replaces any previous registration of
    /// the same id.
    pub fn add_peer(self: &Arc<Self>, url: &str, id: &str, token: &str) {
        let cancel = CancellationToken::new();
        let entry = PeerEntry {
            token: token.to_string(),
            cancel: cancel.clone(),
        };
        if let Some(old) = self.peers.insert(id.to_string(), entry) {
            old.cancel.cancel();
        }

        let server = Arc::clone(self);
        let url = url.to_string();
        let id = id.to_string();
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = server.peer_connect_once(&url, &id, &cancel).await {
                    tracing::warn!(peer = %id, error = %e, "peer connection failed");
                }
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(PEER_RECONNECT_INTERVAL) => {}
                }
            }
        });
    }

    /// Unregister a peer and stop its outbound connection
    pub fn remove_peer(&self, id: &str) {
        if let Some((_, entry)) = self.peers.remove(id) {
            entry.cancel.cancel();
        }
    }

    /// One outbound peer connection: connect, announce local clients, serve
    async fn peer_connect_once(
        self: &Arc<Self>,
        url: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (peer_id, peer_token) = self
            .peer_identity
            .lock()
            .clone()
            .ok_or_else(|| TunnelError::config("peer identity not configured"))?;

        let mut request = url
            .into_client_request()
            .map_err(TunnelError::transport)?;
        request.headers_mut().insert(
            ID_HEADER,
            HeaderValue::from_str(&peer_id).map_err(TunnelError::transport)?,
        );
        request.headers_mut().insert(
            TOKEN_HEADER,
            HeaderValue::from_str(&peer_token).map_err(TunnelError::transport)?,
        );

        let (ws, _) = connect_async(request)
            .await
            .map_err(TunnelError::transport)?;
        tracing::info!(peer = %id, url = %url, "peer connected");

        // Connects and TokenConnects arriving over this session carry
        // `clientKey::proto` and are routed back through the local session
        // manager, each keeping its own frame type
        let forward_deadline = self.config.peer_dial_deadline;
        let dialer = peer_forwarder(Arc::clone(&self.sessions), forward_deadline, false);
        let token_dialer = peer_forwarder(Arc::clone(&self.sessions), forward_deadline, true);

        let cache = self.sessions.token_cache().clone();
        let session = Session::new(
            ws,
            SessionParams {
                session_key: self.sessions.allocate_session_key(),
                client_key: id.to_string(),
                is_client: true,
                connect_auth: Some(Arc::new(|_, _| true)),
                dialer: Some(dialer),
                token_dialer: Some(token_dialer),
                remove_client_hook: Some(Arc::new(move |key: &str| cache.remove(key))),
                ..SessionParams::default()
            },
        );

        self.sessions.add_listener(Arc::clone(&session)).await;
        let result = tokio::select! {
            result = session.serve() => result,
            () = cancel.cancelled() => Ok(()),
        };
        self.sessions.remove_listener(&session);
        session.close().await;
        result
    }

    /// Whether any route to `client_key` exists
    #[must_use]
    pub fn has_session(&self, client_key: &str) -> bool {
        self.sessions.has_session(client_key)
    }

    /// Close every session registered for `client_key`
    pub async fn close_session(&self, client_key: &str) {
        self.sessions.close_client_sessions(client_key).await;
    }

    /// Live virtual connections across the direct sessions of `client_key`
    #[must_use]
    pub fn active_virtual_connections(&self, client_key: &str) -> usize {
        self.sessions.active_virtual_connections(client_key)
    }

    /// Open a virtual connection to `proto`/`address` through `client_key`
    ///
    /// `deadline` bounds the dial on the remote side.
    ///
    /// # Errors
    ///
    /// [`TunnelError::NoSession`] if the client key is unknown; the stream's
    /// first read reports a remote dial failure.
    pub async fn dial(
        &self,
        client_key: &str,
        deadline: Duration,
        proto: &str,
        address: &str,
    ) -> Result<TunnelStream> {
        self.sessions.dial(client_key, deadline, proto, address).await
    }

    /// A [`Dialer`] that opens virtual connections through `client_key`
    #[must_use]
    pub fn dialer(&self, client_key: &str, deadline: Duration) -> Dialer {
        manager_dialer(Arc::clone(&self.sessions), client_key, deadline)
    }

    /// Open a token-request connection through `client_key`
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Server::dial`].
    pub async fn dial_with_client_token(
        &self,
        client_key: &str,
        deadline: Duration,
        proto: &str,
        address: &str,
    ) -> Result<TunnelStream> {
        self.sessions
            .token_dial(client_key, deadline, proto, address)
            .await
    }

    /// Fetch the cluster token of `client_key`, consulting the cache first
    ///
    /// # Errors
    ///
    /// [`TunnelError::NoSession`] if the client key is unknown,
    /// [`TunnelError::Timeout`] if the client does not answer within
    /// `deadline`, and [`TunnelError::TokenUnavailable`] if either field of
    /// the response is empty.
    pub async fn get_cluster_token(
        &self,
        client_key: &str,
        deadline: Duration,
    ) -> Result<ClientToken> {
        if let Some(token) = self.sessions.token_cache().get(client_key) {
            return Ok(token);
        }

        let mut stream = self
            .dial_with_client_token(client_key, deadline, CLIENT_TOKEN_PROTO, CLIENT_TOKEN_ADDRESS)
            .await?;

        let mut data = Vec::new();
        timeout(deadline, stream.read_to_end(&mut data))
            .await
            .map_err(|_| TunnelError::Timeout)??;

        let token: ClientToken = serde_json::from_slice(&data)
            .map_err(|e| TunnelError::malformed(format!("invalid token payload: {e}")))?;
        if token.token.is_empty() || token.cacert.is_empty() {
            return Err(TunnelError::token_unavailable(client_key));
        }

        self.sessions.token_cache().add(client_key, token.clone());
        Ok(token)
    }
}
