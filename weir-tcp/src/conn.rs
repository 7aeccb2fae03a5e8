use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    task::{Context, Poll},
};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream as TokioTcpStream;
use tokio_util::sync::CancellationToken;

use weir_core::DrainController;
use weir_core::conn::{ConnControl, ConnKey, ExchangeState};
use weir_core::controller::Admission;

/// The per-connection state the controller steers through [`ConnControl`].
///
/// All signal delivery is atomics and a cancellation token: nothing here
/// blocks, and nothing calls back into the controller.
#[derive(Debug, Default)]
pub(crate) struct ConnTracker {
    exchange: AtomicU8,
    last: AtomicBool,
    destroy: CancellationToken,
}

impl ConnTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn set_exchange(&self, state: ExchangeState) {
        self.exchange.store(state as u8, Ordering::Release);
    }

    pub(crate) fn destroy_token(&self) -> CancellationToken {
        self.destroy.clone()
    }
}

impl ConnControl for ConnTracker {
    fn exchange_state(&self) -> ExchangeState {
        match self.exchange.load(Ordering::Acquire) {
            0 => ExchangeState::None,
            1 => ExchangeState::Active,
            _ => ExchangeState::Served,
        }
    }

    fn mark_last(&self) {
        self.last.store(true, Ordering::Release);
    }

    fn destroy(&self) {
        self.destroy.cancel();
    }
}

/// Cheap cloneable handle tying one connection to its [`DrainController`].
///
/// Connection handlers use it to report the request/response rhythm
/// ([`begin_request`](Self::begin_request), [`end_request`](Self::end_request)),
/// to honor drain signals ([`marked_last`](Self::marked_last),
/// [`destroyed`](Self::destroyed)) and to negotiate streaming mode
/// ([`upgrade`](Self::upgrade)). It can be cloned out of a [`TcpConn`]
/// before the io is split or consumed.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    key: ConnKey,
    tracker: Arc<ConnTracker>,
    controller: DrainController,
}

impl ConnHandle {
    pub(crate) fn new(
        key: ConnKey,
        tracker: Arc<ConnTracker>,
        controller: DrainController,
    ) -> Self {
        Self {
            key,
            tracker,
            controller,
        }
    }

    /// The key under which this connection is tracked.
    #[must_use]
    pub const fn key(&self) -> ConnKey {
        self.key
    }

    /// The peer address of this connection.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.key.peer_addr()
    }

    /// Report that a request arrived and its response is now being produced.
    pub fn begin_request(&self) {
        self.tracker.set_exchange(ExchangeState::Active);
        self.controller.on_request_started(self.key);
    }

    /// Report that the response was fully written; the connection is idle.
    pub fn end_request(&self) {
        self.tracker.set_exchange(ExchangeState::Served);
    }

    /// Whether the response in flight (or the next one) must be this
    /// connection's last. Handlers check this after every response and
    /// close the connection when it is set.
    #[must_use]
    pub fn marked_last(&self) -> bool {
        self.tracker.last.load(Ordering::Acquire)
    }

    /// Ask to switch this connection into streaming mode.
    ///
    /// Refused whenever the controller is draining; a refused connection
    /// is destroyed and its handler should return right away.
    pub fn upgrade(&self) -> Admission {
        self.controller.on_conn_upgraded(self.key, self.tracker.clone())
    }

    /// Completes when the controller destroys this connection.
    ///
    /// Streaming handlers select on this next to their own io; plain
    /// handlers usually don't need it, their task is cancelled for them.
    pub async fn destroyed(&self) {
        self.tracker.destroy.cancelled().await;
    }
}

pin_project! {
    /// A tracked TCP connection, handed to the [`Service`] serving it.
    ///
    /// Acts as the io stream (it is `AsyncRead` + `AsyncWrite`) and carries
    /// the [`ConnHandle`] for everything drain-related.
    ///
    /// [`Service`]: weir_core::Service
    #[derive(Debug)]
    pub struct TcpConn {
        #[pin]
        stream: TokioTcpStream,
        handle: ConnHandle,
    }
}

impl TcpConn {
    pub(crate) fn new(stream: TokioTcpStream, handle: ConnHandle) -> Self {
        Self { stream, handle }
    }

    /// The drain handle of this connection.
    #[must_use]
    pub fn handle(&self) -> ConnHandle {
        self.handle.clone()
    }

    /// The key under which this connection is tracked.
    #[must_use]
    pub const fn key(&self) -> ConnKey {
        self.handle.key()
    }

    /// The peer address of this connection.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.handle.peer_addr()
    }

    /// The local address this connection arrived on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Consume the connection, returning the inner [`tokio::net::TcpStream`].
    ///
    /// The connection stays tracked; keep the [`ConnHandle`] around to
    /// keep reporting its lifecycle.
    #[must_use]
    pub fn into_stream(self) -> TokioTcpStream {
        self.stream
    }
}

impl AsyncRead for TcpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().stream.poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write_vectored(cx, bufs)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}
