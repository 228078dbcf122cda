//! Session state for one physical tunnel transport
//!
//! A [`Session`] owns one WebSocket connection and every virtual connection
//! multiplexed on it. One reader task drives [`Session::serve`], dispatching
//! frames by type; one writer task owns the sink and drains the outbound
//! frame queue, which serializes all writes and gives Data/Error frames of a
//! connection their total order. Client-side sessions additionally run a
//! periodic pinger.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::dial::{client_dial, ConnectRequest, Dialer};
use crate::error::{Result, TunnelError};
use crate::protocol::{Message, EOF_REASON};
use crate::stream::{stream_pair, ConnHandle, TunnelStream};
use crate::token::{self, TokenSource};

/// Interval between keepalive pings written by client-side sessions
pub const PING_WRITE_INTERVAL: Duration = Duration::from_secs(5);

/// Outbound frame queue depth per session
const FRAME_QUEUE_SIZE: usize = 256;

/// WebSocket transport carrying one session
pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Per-session gate deciding whether a Connect/TokenConnect to
/// `(proto, address)` is allowed
pub type ConnectAuthorizer = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Whether per-frame debug logging was requested via
/// `CATTLE_TUNNEL_DATA_DEBUG=true` (read once)
pub(crate) fn frame_debug() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var("CATTLE_TUNNEL_DATA_DEBUG").map(|v| v == "true") == Ok(true)
    })
}

/// One unit handed to the session's writer task
#[derive(Debug)]
pub(crate) enum WireFrame {
    /// An encoded protocol message
    Message(Message),
    /// WebSocket keepalive ping
    Ping,
    /// Reply to a received ping
    Pong(Vec<u8>),
}

/// Construction parameters for a session
pub(crate) struct SessionParams {
    pub session_key: i64,
    pub client_key: String,
    /// Client-side sessions drive pings and default-dial on Connect
    pub is_client: bool,
    pub connect_auth: Option<ConnectAuthorizer>,
    pub dialer: Option<Dialer>,
    /// Forwards remote TokenConnect requests (peer sessions); without one,
    /// token requests are answered from the token source
    pub token_dialer: Option<Dialer>,
    pub token_source: Option<TokenSource>,
    /// Invoked with the client key of every RemoveClient announcement
    pub remove_client_hook: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub ping_interval: Duration,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            session_key: 0,
            client_key: "client".to_string(),
            is_client: false,
            connect_auth: None,
            dialer: None,
            token_dialer: None,
            token_source: None,
            remove_client_hook: None,
            ping_interval: PING_WRITE_INTERVAL,
        }
    }
}

/// State for one physical tunnel transport and all virtual connections
/// multiplexed on it
pub struct Session {
    client_key: String,
    session_key: i64,
    is_client: bool,
    next_conn_id: AtomicI64,
    conns: Mutex<HashMap<i64, ConnHandle>>,
    remote_client_keys: Mutex<HashMap<String, HashSet<i64>>>,
    outbound: mpsc::Sender<WireFrame>,
    dialer: Option<Dialer>,
    token_dialer: Option<Dialer>,
    connect_auth: Option<ConnectAuthorizer>,
    token_source: Option<TokenSource>,
    remove_client_hook: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    ping_interval: Duration,
    reader: Mutex<Option<SplitStream<WsStream>>>,
    writer_cancel: CancellationToken,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    ping_cancel: CancellationToken,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    close_done: AsyncMutex<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_key", &self.client_key)
            .field("session_key", &self.session_key)
            .field("is_client", &self.is_client)
            .finish_non_exhaustive()
    }
}

/// Cancels the session's background tasks when the serve future ends or is
/// dropped, so an aborted serve still releases the transport
struct ServeGuard {
    session: Weak<Session>,
    writer: CancellationToken,
    pings: CancellationToken,
}

impl Drop for ServeGuard {
    fn drop(&mut self) {
        self.pings.cancel();
        self.writer.cancel();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            if let Some(session) = self.session.upgrade() {
                handle.spawn(async move { session.close().await });
            }
        }
    }
}

impl Session {
    pub(crate) fn new(ws: WsStream, params: SessionParams) -> Arc<Self> {
        let (sink, stream) = ws.split();
        let (outbound, outbound_rx) = mpsc::channel(FRAME_QUEUE_SIZE);
        let writer_cancel = CancellationToken::new();
        let writer_task = tokio::spawn(write_loop(sink, outbound_rx, writer_cancel.clone()));

        Arc::new(Self {
            client_key: params.client_key,
            session_key: params.session_key,
            is_client: params.is_client,
            next_conn_id: AtomicI64::new(0),
            conns: Mutex::new(HashMap::new()),
            remote_client_keys: Mutex::new(HashMap::new()),
            outbound,
            dialer: params.dialer,
            token_dialer: params.token_dialer,
            connect_auth: params.connect_auth,
            token_source: params.token_source,
            remove_client_hook: params.remove_client_hook,
            ping_interval: params.ping_interval,
            reader: Mutex::new(Some(stream)),
            writer_cancel,
            writer_task: Mutex::new(Some(writer_task)),
            ping_cancel: CancellationToken::new(),
            ping_task: Mutex::new(None),
            close_done: AsyncMutex::new(false),
        })
    }

    /// Logical identity of the remote party
    #[must_use]
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    /// Numeric nonce identifying this session on its server
    #[must_use]
    pub fn session_key(&self) -> i64 {
        self.session_key
    }

    /// Number of live virtual connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.conns.lock().len()
    }

    /// Whether `client_key` was announced as reachable through this session
    #[must_use]
    pub fn has_remote_client(&self, client_key: &str) -> bool {
        self.remote_client_keys
            .lock()
            .get(client_key)
            .is_some_and(|keys| !keys.is_empty())
    }

    /// Run the read loop until the transport fails or closes
    ///
    /// Exactly one caller may serve a session. Client-side sessions start
    /// their pinger here.
    ///
    /// # Errors
    ///
    /// Returns the decode or transport error that terminated the session, or
    /// [`TunnelError::Shutdown`] if the session was already being served.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        let reader = self.reader.lock().take();
        let Some(mut reader) = reader else {
            return Err(TunnelError::Shutdown);
        };
        let _guard = ServeGuard {
            session: Arc::downgrade(self),
            writer: self.writer_cancel.clone(),
            pings: self.ping_cancel.clone(),
        };
        if self.is_client {
            self.start_pings();
        }
        self.read_loop(&mut reader).await
    }

    async fn read_loop(self: &Arc<Self>, reader: &mut SplitStream<WsStream>) -> Result<()> {
        while let Some(next) = reader.next().await {
            match next {
                Ok(WsMessage::Binary(data)) => {
                    let message = Message::decode(&data)?;
                    self.serve_message(message).await?;
                }
                Ok(WsMessage::Ping(payload)) => {
                    let _ = self.outbound.send(WireFrame::Pong(payload)).await;
                }
                Ok(WsMessage::Pong(_)) => {
                    tracing::trace!(session_key = self.session_key, "pong received");
                }
                Ok(WsMessage::Close(_)) => return Ok(()),
                Ok(_) => return Err(TunnelError::WrongMessageType),
                Err(e) => return Err(TunnelError::transport(e)),
            }
        }
        Ok(())
    }

    async fn serve_message(self: &Arc<Self>, message: Message) -> Result<()> {
        if frame_debug() {
            tracing::debug!(session_key = self.session_key, message = %message, "request");
        }

        match message {
            Message::Connect {
                conn_id,
                deadline_ms,
                proto,
                address,
            } => {
                eprintln!("DEBUG: got connect frame conn_id={conn_id}");
                if !self.connect_allowed(&proto, &address) {
                    eprintln!("DEBUG: connect not allowed, calling reject_connect");
                    self.reject_connect(conn_id, &proto, &address).await;
                    eprintln!("DEBUG: reject_connect returned");
                    return Ok(());
                }
                self.client_connect(conn_id, deadline_ms, proto, address);
                Ok(())
            }

            Message::TokenConnect {
                conn_id,
                deadline_ms,
                proto,
                address,
            } => {
                if !self.connect_allowed(&proto, &address) {
                    self.reject_connect(conn_id, &proto, &address).await;
                    return Ok(());
                }
                self.client_token_connect(conn_id, deadline_ms, proto, address);
                Ok(())
            }

            Message::Data { conn_id, payload } => {
                let writer = self.conns.lock().get(&conn_id).map(ConnHandle::tunnel_writer);
                match writer {
                    None => {
                        // Normal race with close: answer and drop
                        let reason = TunnelError::ConnectNotFound {
                            client_key: self.client_key.clone(),
                            session_key: self.session_key,
                            conn_id,
                        }
                        .to_string();
                        let _ = self.write_message(Message::Error { conn_id, reason }).await;
                    }
                    Some(writer) => {
                        if writer.send(payload).await.is_err() {
                            // Local consumer went away mid-dispatch
                            self.close_connection(
                                conn_id,
                                Some("tunnel write failed".to_string()),
                            );
                        }
                    }
                }
                Ok(())
            }

            Message::Error { conn_id, reason } => {
                // Close locally with the carried cause; never echoed. An
                // Error for an already-removed connection is a normal race
                // with close and is ignored.
                let reason = if reason == EOF_REASON {
                    None
                } else {
                    Some(reason)
                };
                self.close_connection(conn_id, reason);
                Ok(())
            }

            Message::AddClient { address } => {
                if let Err(e) = self.add_remote_client(&address) {
                    tracing::warn!(address = %address, error = %e, "invalid AddClient announcement");
                }
                Ok(())
            }

            Message::RemoveClient { address } => {
                if let Err(e) = self.remove_remote_client(&address) {
                    tracing::warn!(address = %address, error = %e, "invalid RemoveClient announcement");
                }
                Ok(())
            }
        }
    }

    fn connect_allowed(&self, proto: &str, address: &str) -> bool {
        self.connect_auth
            .as_ref()
            .is_some_and(|auth| auth(proto, address))
    }

    async fn reject_connect(&self, conn_id: i64, proto: &str, address: &str) {
        tracing::warn!(
            session_key = self.session_key,
            proto = %proto,
            address = %address,
            "connect not allowed"
        );
        let reason = TunnelError::ConnectNotAllowed {
            proto: proto.to_string(),
            address: address.to_string(),
        }
        .to_string();
        let _ = self.write_message(Message::Error { conn_id, reason }).await;
    }

    /// Handle a remote Connect: register the stream and dial on its own task
    fn client_connect(self: &Arc<Self>, conn_id: i64, deadline_ms: u64, proto: String, address: String) {
        self.dial_and_pipe(conn_id, deadline_ms, proto, address, self.dialer.clone());
    }

    /// Handle a remote TokenConnect: forward it through the token dialer
    /// (peer sessions, keeping the frame type across the hop) or answer from
    /// the locally configured token source
    fn client_token_connect(
        self: &Arc<Self>,
        conn_id: i64,
        deadline_ms: u64,
        proto: String,
        address: String,
    ) {
        if let Some(dialer) = self.token_dialer.clone() {
            self.dial_and_pipe(conn_id, deadline_ms, proto, address, Some(dialer));
            return;
        }
        let stream = self.register_stream(conn_id, &proto, &address);
        let session = Arc::clone(self);
        let source = self.token_source.clone().or_else(token::registered_source);
        tokio::spawn(async move {
            token::serve_token_request(&session, stream, source).await;
        });
    }

    fn dial_and_pipe(
        self: &Arc<Self>,
        conn_id: i64,
        deadline_ms: u64,
        proto: String,
        address: String,
        dialer: Option<Dialer>,
    ) {
        let stream = self.register_stream(conn_id, &proto, &address);
        let session = Arc::clone(self);
        let request = ConnectRequest {
            conn_id,
            deadline: Duration::from_millis(deadline_ms),
            proto,
            address,
        };
        tokio::spawn(async move {
            client_dial(&session, dialer, stream, request).await;
        });
    }

    /// Open a virtual connection to `proto`/`address` through the remote side
    ///
    /// # Errors
    ///
    /// Returns an error if the Connect frame cannot be written; the
    /// connection is torn down locally in that case.
    pub async fn server_connect(
        self: &Arc<Self>,
        deadline: Duration,
        proto: &str,
        address: &str,
    ) -> Result<TunnelStream> {
        let message_type = |conn_id| Message::Connect {
            conn_id,
            deadline_ms: deadline.as_millis().try_into().unwrap_or(u64::MAX),
            proto: proto.to_string(),
            address: address.to_string(),
        };
        self.open_connection(proto, address, message_type).await
    }

    /// Open a transient token-request connection through the remote side
    ///
    /// # Errors
    ///
    /// Returns an error if the TokenConnect frame cannot be written.
    pub async fn server_token_connect(
        self: &Arc<Self>,
        deadline: Duration,
        proto: &str,
        address: &str,
    ) -> Result<TunnelStream> {
        let message_type = |conn_id| Message::TokenConnect {
            conn_id,
            deadline_ms: deadline.as_millis().try_into().unwrap_or(u64::MAX),
            proto: proto.to_string(),
            address: address.to_string(),
        };
        self.open_connection(proto, address, message_type).await
    }

    async fn open_connection(
        self: &Arc<Self>,
        proto: &str,
        address: &str,
        message: impl FnOnce(i64) -> Message,
    ) -> Result<TunnelStream> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let stream = self.register_stream(conn_id, proto, address);
        if let Err(e) = self.write_message(message(conn_id)).await {
            self.close_connection(conn_id, Some(e.to_string()));
            return Err(e);
        }
        Ok(stream)
    }

    fn register_stream(self: &Arc<Self>, conn_id: i64, proto: &str, address: &str) -> TunnelStream {
        let (handle, stream) = stream_pair(
            conn_id,
            proto,
            address,
            Arc::downgrade(self),
            self.outbound.clone(),
        );
        let old = self.conns.lock().insert(conn_id, handle);
        if let Some(old) = old {
            old.tunnel_close(Some("duplicate connection id".to_string()));
        }
        if frame_debug() {
            tracing::debug!(
                session_key = self.session_key,
                conns = self.connection_count(),
                "connections"
            );
        }
        stream
    }

    /// Local teardown of one connection: remove it from the table and close
    /// it with the given cause. Never emits a frame; idempotent.
    pub(crate) fn close_connection(&self, conn_id: i64, reason: Option<String>) {
        let handle = self.conns.lock().remove(&conn_id);
        if let Some(handle) = handle {
            handle.tunnel_close(reason);
        }
    }

    /// Teardown that surfaces the cause to the peer with one Error frame
    pub(crate) async fn fail_connection(&self, conn_id: i64, reason: String) {
        let handle = self.conns.lock().remove(&conn_id);
        if let Some(handle) = handle {
            let emit = handle.claim_error_frame();
            handle.tunnel_close(Some(reason.clone()));
            if emit {
                let _ = self.write_message(Message::Error { conn_id, reason }).await;
            }
        }
    }

    /// Serialize one frame onto the transport via the writer task
    pub(crate) async fn write_message(&self, message: Message) -> Result<()> {
        if frame_debug() {
            tracing::debug!(session_key = self.session_key, message = %message, "write");
        }
        self.outbound
            .send(WireFrame::Message(message))
            .await
            .map_err(|_| TunnelError::Shutdown)
    }

    /// Announce a newly attached client to the remote side
    pub(crate) async fn session_added(&self, client_key: &str, session_key: i64) {
        let address = format!("{client_key}/{session_key}");
        if self
            .write_message(Message::AddClient { address })
            .await
            .is_err()
        {
            tracing::warn!(
                session_key = self.session_key,
                "failed to announce added client"
            );
        }
    }

    /// Withdraw a detached client from the remote side
    pub(crate) async fn session_removed(&self, client_key: &str, session_key: i64) {
        let address = format!("{client_key}/{session_key}");
        if self
            .write_message(Message::RemoveClient { address })
            .await
            .is_err()
        {
            tracing::warn!(
                session_key = self.session_key,
                "failed to announce removed client"
            );
        }
    }

    fn add_remote_client(&self, address: &str) -> Result<()> {
        let (client_key, session_key) = parse_client_address(address)?;
        self.remote_client_keys
            .lock()
            .entry(client_key)
            .or_default()
            .insert(session_key);
        tracing::info!(
            address = %address,
            session_key = self.session_key,
            "added remote client"
        );
        Ok(())
    }

    fn remove_remote_client(&self, address: &str) -> Result<()> {
        let (client_key, session_key) = parse_client_address(address)?;
        {
            let mut keys = self.remote_client_keys.lock();
            if let Some(entry) = keys.get_mut(&client_key) {
                entry.remove(&session_key);
                if entry.is_empty() {
                    keys.remove(&client_key);
                }
            }
        }
        // Tokens cached for that client are stale after it reconnects
        if let Some(hook) = &self.remove_client_hook {
            hook(&client_key);
        }
        tracing::info!(
            address = %address,
            session_key = self.session_key,
            "removed remote client"
        );
        Ok(())
    }

    fn start_pings(self: &Arc<Self>) {
        let cancel = self.ping_cancel.clone();
        let outbound = self.outbound.clone();
        let interval = self.ping_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                // The send itself stays cancellable so teardown never waits
                // on a congested outbound queue
                tokio::select! {
                    () = cancel.cancelled() => return,
                    sent = outbound.send(WireFrame::Ping) => {
                        if sent.is_err() {
                            return;
                        }
                        tracing::trace!("wrote ping");
                    }
                }
            }
        });
        *self.ping_task.lock() = Some(task);
    }

    async fn stop_pings(&self) {
        self.ping_cancel.cancel();
        let task = self.ping_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Tear the session down: stop pings, close every virtual connection with
    /// a tunnel-disconnect cause, and stop the writer (closing the transport)
    ///
    /// Safe to call more than once; later callers wait for the first
    /// teardown to finish.
    pub async fn close(&self) {
        let mut done = self.close_done.lock().await;
        if *done {
            return;
        }
        *done = true;

        self.stop_pings().await;

        let handles: Vec<(i64, ConnHandle)> = self.conns.lock().drain().collect();
        for (_, handle) in handles {
            handle.tunnel_close(Some(TunnelError::TunnelDisconnect.to_string()));
        }

        self.writer_cancel.cancel();
        let task = self.writer_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        tracing::debug!(
            client_key = %self.client_key,
            session_key = self.session_key,
            "session closed"
        );
    }
}

/// Parse a `clientKey/sessionKey` announcement address
fn parse_client_address(address: &str) -> Result<(String, i64)> {
    let (client_key, session_key) = address
        .split_once('/')
        .ok_or_else(|| TunnelError::malformed(format!("not / separated: {address}")))?;
    let session_key = session_key
        .parse::<i64>()
        .map_err(|e| TunnelError::malformed(format!("invalid session key in {address}: {e}")))?;
    Ok((client_key.to_string(), session_key))
}

/// Drain the outbound queue into the sink; sole writer for the transport
async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut outbound: mpsc::Receiver<WireFrame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let ws_message = match frame {
            WireFrame::Message(message) => WsMessage::Binary(message.encode()),
            WireFrame::Ping => WsMessage::Ping(Vec::new()),
            WireFrame::Pong(payload) => WsMessage::Pong(payload),
        };
        eprintln!("DEBUG: write_loop sending frame");
        if let Err(e) = sink.send(ws_message).await {
            tracing::debug!(error = %e, "transport write failed, stopping session writer");
            break;
        }
    }
    let _ = sink.close().await;
}
