//! Client-side dialing and the bidirectional pipe
//!
//! When a Connect frame arrives, the client dials the real target and pipes
//! bytes between the socket and the virtual connection. The pipe spawns one
//! task for the tunnel→socket direction and runs socket→tunnel inline; the
//! first direction to terminate closes both sides, both directions are joined
//! before the single terminating Error frame is written, so the peer never
//! sees the Error ahead of trailing Data.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::session::Session;
use crate::stream::TunnelStream;

/// Fallback dial timeout when the Connect frame carries none
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Byte stream a dialer can return
pub trait TunnelDuplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelDuplex for T {}

/// Boxed duplex byte stream
pub type BoxedConn = Box<dyn TunnelDuplex>;

impl std::fmt::Debug for dyn TunnelDuplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelDuplex").finish_non_exhaustive()
    }
}

/// Pluggable dial function: `(proto, address)` to a duplex byte stream
pub type Dialer =
    Arc<dyn Fn(String, String) -> BoxFuture<'static, io::Result<BoxedConn>> + Send + Sync>;

/// A Connect request as received from the remote side
pub(crate) struct ConnectRequest {
    pub conn_id: i64,
    /// Dial timeout requested by the peer
    pub deadline: Duration,
    pub proto: String,
    pub address: String,
}

/// Dial the requested target and pipe it against the virtual connection
pub(crate) async fn client_dial(
    session: &Arc<Session>,
    dialer: Option<Dialer>,
    stream: TunnelStream,
    request: ConnectRequest,
) {
    let target = match dialer {
        Some(dialer) => dialer(request.proto.clone(), request.address.clone()).await,
        None => default_tcp_dial(&request.proto, &request.address, request.deadline).await,
    };

    let net = match target {
        Ok(net) => net,
        Err(e) => {
            tracing::debug!(
                conn_id = request.conn_id,
                proto = %request.proto,
                address = %request.address,
                error = %e,
                "dial failed"
            );
            session.fail_connection(request.conn_id, e.to_string()).await;
            return;
        }
    };

    pipe(stream, net).await;
}

/// Default dialer: a TCP connection bounded by the requested deadline
pub(crate) async fn default_tcp_dial(
    proto: &str,
    address: &str,
    deadline: Duration,
) -> io::Result<BoxedConn> {
    if !proto.starts_with("tcp") {
        return Err(io::Error::other(format!("unsupported protocol {proto}")));
    }
    let deadline = if deadline.is_zero() {
        DEFAULT_DIAL_TIMEOUT
    } else {
        deadline
    };
    let stream = tokio::time::timeout(deadline, TcpStream::connect(address))
        .await
        .map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, format!("dial {address} timed out"))
        })??;
    Ok(Box::new(stream))
}

fn copy_outcome(result: io::Result<u64>) -> Option<String> {
    match result {
        Ok(_) => None,
        Err(e) => Some(e.to_string()),
    }
}

/// Copy bytes in both directions until the connection ends, then emit the
/// single terminating Error frame
///
/// The tunnel→socket direction runs on its own task; socket→tunnel runs
/// inline. Whichever terminates first closes both sides: the tunnel side via
/// the idempotent local close (which also unblocks the other copy), the
/// socket side via write shutdown plus cancellation of the inline read. Both
/// directions have fully terminated before the Error frame is queued.
pub(crate) async fn pipe(stream: TunnelStream, net: BoxedConn) {
    let closer = stream.close_handle();
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(stream);
    let (mut net_read, mut net_write) = tokio::io::split(net);
    let done = CancellationToken::new();

    let tunnel_to_net = {
        let closer = closer.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let outcome = copy_outcome(tokio::io::copy(&mut tunnel_read, &mut net_write).await);
            closer.tunnel_close(outcome);
            let _ = net_write.shutdown().await;
            done.cancel();
        })
    };

    let inline = tokio::select! {
        result = tokio::io::copy(&mut net_read, &mut tunnel_write) => Some(copy_outcome(result)),
        () = done.cancelled() => None,
    };
    // When the spawned direction won, report its stored cause instead
    let outcome = inline
        .or_else(|| closer.close_reason())
        .unwrap_or(None);
    closer.tunnel_close(outcome.clone());
    drop(net_read);

    let _ = tunnel_to_net.await;

    // Both directions are done; no Data frame of this connection can follow
    closer.write_err(outcome).await;
}
