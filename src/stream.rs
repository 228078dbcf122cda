//! Virtual connection streams multiplexed over a session
//!
//! A [`TunnelStream`] is one logical byte stream inside a session, identified
//! by a 64-bit connection id. The read side is fed by Data frames the session
//! dispatches into a bounded channel (the bound is the flow-control window:
//! the session's reader blocks when the local consumer hasn't drained). The
//! write side turns every `poll_write` into exactly one Data frame on the
//! session's outbound queue.
//!
//! Close discipline: each stream ends with exactly one Error frame on the
//! wire from its own side; a clean close carries [`EOF_REASON`]. Error
//! frames that arrive for an already-removed connection are ignored by the
//! session, so symmetric emission never loops.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::protocol::{Message, EOF_REASON};
use crate::session::{Session, WireFrame};

/// Per-connection inbound window, in Data frames
pub(crate) const DATA_WINDOW: usize = 64;

/// Shared state between a stream, its session-side handle, and the dial pipe
#[derive(Debug)]
pub(crate) struct StreamInner {
    conn_id: i64,
    proto: String,
    address: String,
    /// Close state; the first close wins and stores the cause
    state: Mutex<CloseState>,
    /// Set once the terminating Error frame has been claimed for emission
    err_frame_sent: AtomicBool,
}

#[derive(Debug, Default)]
struct CloseState {
    closed: bool,
    /// `None` while open or when the close was clean (EOF)
    reason: Option<String>,
}

impl StreamInner {
    /// Transition to closed with the given cause; the first caller wins
    fn close(&self, reason: Option<String>) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.reason = reason;
        }
    }

    /// `None` while open; `Some(None)` once closed cleanly; `Some(Some(_))`
    /// once closed with an error
    fn close_reason(&self) -> Option<Option<String>> {
        let state = self.state.lock();
        state.closed.then(|| state.reason.clone())
    }

    /// Claim the right to emit the terminating Error frame; returns true for
    /// exactly one caller
    fn claim_error_frame(&self) -> bool {
        !self.err_frame_sent.swap(true, Ordering::AcqRel)
    }
}

/// Session-side handle for one virtual connection
///
/// Owned by the session's connection table; dropping it (via
/// [`ConnHandle::tunnel_close`]) closes the inbound channel and unblocks any
/// pending reader.
pub(crate) struct ConnHandle {
    data_tx: mpsc::Sender<Bytes>,
    inner: Arc<StreamInner>,
}

impl ConnHandle {
    /// Sink the session's dispatch path uses to push inbound Data
    pub(crate) fn tunnel_writer(&self) -> mpsc::Sender<Bytes> {
        self.data_tx.clone()
    }

    /// Local teardown without emitting a frame; idempotent via the inner
    /// first-close-wins state
    pub(crate) fn tunnel_close(self, reason: Option<String>) {
        self.inner.close(reason);
        // Dropping self releases data_tx, which ends the reader with the
        // stored cause once buffered chunks drain.
    }

    /// Claim the right to emit the terminating Error frame
    pub(crate) fn claim_error_frame(&self) -> bool {
        self.inner.claim_error_frame()
    }
}

/// Non-owning closer shared by the dial pipe's two copy directions
#[derive(Clone)]
pub(crate) struct CloseHandle {
    conn_id: i64,
    session: Weak<Session>,
    inner: Arc<StreamInner>,
}

impl CloseHandle {
    /// Connection id this handle refers to
    pub(crate) fn conn_id(&self) -> i64 {
        self.conn_id
    }

    /// Idempotent local teardown: store the cause, remove the connection from
    /// the session table, unblock readers. Never emits a frame.
    pub(crate) fn tunnel_close(&self, reason: Option<String>) {
        self.inner.close(reason.clone());
        if let Some(session) = self.session.upgrade() {
            session.close_connection(self.conn_id, reason);
        }
    }

    /// The stored close cause, if the connection has been closed
    pub(crate) fn close_reason(&self) -> Option<Option<String>> {
        self.inner.close_reason()
    }

    /// Emit the single terminating Error frame, after all Data of this
    /// connection. No-op if the frame was already claimed.
    pub(crate) async fn write_err(&self, reason: Option<String>) {
        if !self.inner.claim_error_frame() {
            return;
        }
        if let Some(session) = self.session.upgrade() {
            let _ = session
                .write_message(Message::Error {
                    conn_id: self.conn_id,
                    reason: reason.unwrap_or_else(|| EOF_REASON.to_string()),
                })
                .await;
        }
    }
}

/// One virtual connection, used like a socket
///
/// Reads block until Data arrives or the connection closes; a clean close
/// reads as EOF, an errored close surfaces the stored cause. Each write emits
/// one Data frame. [`AsyncWrite::poll_shutdown`] performs the public close:
/// local teardown plus one Error(EOF) frame to the peer. Dropping the stream
/// without shutting it down does the same on a best-effort basis.
pub struct TunnelStream {
    handle: CloseHandle,
    rx: mpsc::Receiver<Bytes>,
    /// Chunks received but not yet consumed by the reader
    pending: VecDeque<Bytes>,
    frames: PollSender<WireFrame>,
    /// Plain sender kept for the best-effort close in `Drop`
    frames_tx: mpsc::Sender<WireFrame>,
    shutdown_done: bool,
}

/// Create the session-side handle and caller-side stream for one connection
pub(crate) fn stream_pair(
    conn_id: i64,
    proto: &str,
    address: &str,
    session: Weak<Session>,
    outbound: mpsc::Sender<WireFrame>,
) -> (ConnHandle, TunnelStream) {
    let inner = Arc::new(StreamInner {
        conn_id,
        proto: proto.to_string(),
        address: address.to_string(),
        state: Mutex::new(CloseState::default()),
        err_frame_sent: AtomicBool::new(false),
    });
    let (data_tx, data_rx) = mpsc::channel(DATA_WINDOW);

    let handle = ConnHandle {
        data_tx,
        inner: Arc::clone(&inner),
    };
    let stream = TunnelStream {
        handle: CloseHandle {
            conn_id,
            session,
            inner,
        },
        rx: data_rx,
        pending: VecDeque::new(),
        frames: PollSender::new(outbound.clone()),
        frames_tx: outbound,
        shutdown_done: false,
    };
    (handle, stream)
}

impl TunnelStream {
    /// Connection id within the owning session
    #[must_use]
    pub fn conn_id(&self) -> i64 {
        self.handle.conn_id
    }

    /// Protocol this connection was opened with
    #[must_use]
    pub fn proto(&self) -> &str {
        &self.handle.inner.proto
    }

    /// Address this connection was opened to
    #[must_use]
    pub fn address(&self) -> &str {
        &self.handle.inner.address
    }

    /// Closer shared with the dial pipe
    pub(crate) fn close_handle(&self) -> CloseHandle {
        self.handle.clone()
    }

    fn closed_write_error(reason: Option<String>) -> io::Error {
        match reason {
            Some(reason) => io::Error::other(reason),
            None => io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"),
        }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if let Some(chunk) = this.pending.front_mut() {
                if chunk.is_empty() {
                    this.pending.pop_front();
                    continue;
                }
                let n = buf.remaining().min(chunk.len());
                buf.put_slice(&chunk.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => this.pending.push_back(chunk),
                None => {
                    // Channel closed: clean EOF or the stored cause
                    return match this.handle.inner.close_reason() {
                        Some(Some(reason)) => Poll::Ready(Err(io::Error::other(reason))),
                        _ => Poll::Ready(Ok(())),
                    };
                }
            }
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if let Some(reason) = this.handle.inner.close_reason() {
            return Poll::Ready(Err(Self::closed_write_error(reason)));
        }
        if ready!(this.frames.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session closed",
            )));
        }
        // One Data frame per write call, never fragmented
        let message = Message::Data {
            conn_id: this.handle.conn_id,
            payload: Bytes::copy_from_slice(buf),
        };
        if this.frames.send_item(WireFrame::Message(message)).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session closed",
            )));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the session writer as they are produced
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shutdown_done {
            return Poll::Ready(Ok(()));
        }
        match this.frames.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                this.handle.tunnel_close(None);
                if this.handle.inner.claim_error_frame() {
                    let message = Message::Error {
                        conn_id: this.handle.conn_id,
                        reason: EOF_REASON.to_string(),
                    };
                    let _ = this.frames.send_item(WireFrame::Message(message));
                } else {
                    this.frames.abort_send();
                }
                this.shutdown_done = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                // Session writer is gone; local teardown is all that is left
                this.handle.tunnel_close(None);
                this.shutdown_done = true;
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        if self.shutdown_done {
            return;
        }
        self.handle.tunnel_close(None);
        if self.handle.inner.claim_error_frame() {
            let message = Message::Error {
                conn_id: self.handle.conn_id,
                reason: EOF_REASON.to_string(),
            };
            let _ = self.frames_tx.try_send(WireFrame::Message(message));
        }
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("conn_id", &self.handle.conn_id)
            .field("proto", &self.handle.inner.proto)
            .field("address", &self.handle.inner.address)
            .finish_non_exhaustive()
    }
}
