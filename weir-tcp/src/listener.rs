use std::pin::pin;
use std::sync::Arc;
use std::{io, net::SocketAddr};

use tokio::net::{TcpListener as TokioTcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use weir_core::conn::{ConnKey, ListenerControl};
use weir_core::error::{BoxError, ErrorContext};
use weir_core::rt::Executor;
use weir_core::{DrainController, Service};

use crate::conn::{ConnHandle, ConnTracker, TcpConn};

/// The stop side of a bound listener; what the controller flips when the
/// accept intake must end.
#[derive(Debug, Default)]
struct ListenerStop {
    token: CancellationToken,
}

impl ListenerControl for ListenerStop {
    fn stop_accepting(&self) {
        self.token.cancel();
    }
}

#[derive(Clone, Debug)]
/// Builder for `TcpListener`.
pub struct TcpListenerBuilder {
    ttl: Option<u32>,
    exec: Executor,
    controller: DrainController,
}

impl TcpListenerBuilder {
    /// Create a new `TcpListenerBuilder` wired to the given controller.
    #[must_use]
    pub fn new(controller: DrainController) -> Self {
        Self {
            ttl: None,
            exec: Executor::new(),
            controller,
        }
    }

    /// Sets the value for the `IP_TTL` option on this socket.
    ///
    /// This value sets the time-to-live field that is used in every packet sent
    /// from this socket.
    #[must_use]
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the value for the `IP_TTL` option on this socket.
    ///
    /// This value sets the time-to-live field that is used in every packet sent
    /// from this socket.
    pub fn set_ttl(&mut self, ttl: u32) -> &mut Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the executor used to spawn the per-connection tasks.
    #[must_use]
    pub fn with_executor(mut self, exec: Executor) -> Self {
        self.exec = exec;
        self
    }

    /// Set the executor used to spawn the per-connection tasks.
    pub fn set_executor(&mut self, exec: Executor) -> &mut Self {
        self.exec = exec;
        self
    }

    /// Creates a new TcpListener, which will be bound to the specified address.
    ///
    /// The returned listener is ready for accepting connections, and is
    /// already attached to the controller: suspending the controller (or
    /// the expiry of its accept grace) stops the accept loop.
    ///
    /// Binding with a port number of 0 will request that the OS assigns a port
    /// to this listener. The port allocated can be queried via the `local_addr`
    /// method.
    pub async fn bind<A: ToSocketAddrs>(self, addr: A) -> Result<TcpListener, BoxError> {
        let inner = TokioTcpListener::bind(addr)
            .await
            .context("bind tcp listener")?;

        if let Some(ttl) = self.ttl {
            inner.set_ttl(ttl).context("set ttl on tcp listener")?;
        }

        let stop = Arc::new(ListenerStop::default());
        self.controller.attach_listener(stop.clone());

        Ok(TcpListener {
            inner,
            exec: self.exec,
            controller: self.controller,
            stop,
        })
    }
}

#[derive(Debug)]
/// A TCP socket server listening for incoming connections, tracking each
/// of them with the [`DrainController`] it was built with.
pub struct TcpListener {
    inner: TokioTcpListener,
    exec: Executor,
    controller: DrainController,
    stop: Arc<ListenerStop>,
}

impl TcpListener {
    /// Create a new `TcpListenerBuilder` wired to the given controller,
    /// which can be used to configure a `TcpListener`.
    #[must_use]
    pub fn build(controller: DrainController) -> TcpListenerBuilder {
        TcpListenerBuilder::new(controller)
    }

    /// Creates a new TcpListener, which will be bound to the specified address.
    ///
    /// The returned listener is ready for accepting connections.
    ///
    /// Binding with a port number of 0 will request that the OS assigns a port
    /// to this listener. The port allocated can be queried via the `local_addr`
    /// method.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        controller: DrainController,
    ) -> Result<Self, BoxError> {
        TcpListenerBuilder::new(controller).bind(addr).await
    }

    /// Returns the local address that this listener is bound to.
    ///
    /// This can be useful, for example, when binding to port 0 to figure out
    /// which port was actually bound.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Gets the value of the `IP_TTL` option for this socket.
    ///
    /// For more information about this option, see [`set_ttl`].
    ///
    /// [`set_ttl`]: TcpListenerBuilder::set_ttl
    pub fn ttl(&self) -> io::Result<u32> {
        self.inner.ttl()
    }

    /// Sets the value for the `IP_TTL` option on this socket.
    ///
    /// This value sets the time-to-live field that is used in every packet sent
    /// from this socket.
    pub fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        self.inner.set_ttl(ttl)
    }

    /// The controller this listener reports to.
    #[must_use]
    pub fn controller(&self) -> &DrainController {
        &self.controller
    }

    /// Serve connections from this listener with the given service.
    ///
    /// Every accepted connection is offered to the controller; admitted
    /// ones are served in their own task. The loop ends, and the listening
    /// socket with it, once the controller stops the intake (suspension,
    /// grace expiry or destruction).
    pub async fn serve<S>(self, service: S)
    where
        S: Service<TcpConn>,
    {
        let service = Arc::new(service);

        let stop = self.stop.token.clone();
        let mut stopped_fut = pin!(stop.cancelled());

        loop {
            tokio::select! {
                _ = stopped_fut.as_mut() => {
                    trace!("listener stop received: accept loop ends");
                    break;
                }
                result = self.inner.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            self.handle_accept(&service, stream, peer_addr);
                        }
                        Err(err) => {
                            handle_accept_err(err).await;
                        }
                    }
                }
            }
        }
    }

    fn handle_accept<S>(
        &self,
        service: &Arc<S>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) where
        S: Service<TcpConn>,
    {
        let key = ConnKey::new(peer_addr);
        let tracker = Arc::new(ConnTracker::new());
        if self
            .controller
            .on_conn_accepted(key, tracker.clone())
            .is_refused()
        {
            // dropping the stream closes it
            debug!(%key, "connection refused at accept");
            return;
        }

        let destroy = tracker.destroy_token();
        let handle = ConnHandle::new(key, tracker, self.controller.clone());
        let conn = TcpConn::new(stream, handle);
        let controller = self.controller.clone();
        let service = service.clone();

        self.exec.spawn_task(async move {
            tokio::select! {
                _ = destroy.cancelled() => {
                    trace!(%key, "connection destroyed; dropping its stream");
                }
                _ = service.serve(conn) => {}
            }
            controller.on_conn_closed(key);
        });
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Interrupted
    )
}

async fn handle_accept_err(err: io::Error) {
    if is_connection_error(&err) {
        trace!("TCP accept error: connect error: {err:?}");
    } else {
        // [From `hyper::Server` in 0.14](https://github.com/hyperium/hyper/blob/v0.14.27/src/server/tcp.rs#L186)
        //
        // > A possible scenario is that the process has hit the max open files
        // > allowed, and so trying to accept a new connection will fail with
        // > `EMFILE`. In some cases, it's preferable to just wait for some time, if
        // > the application will likely close some files (or connections), and try
        // > to accept the connection again. If this option is `true`, the error
        // > will be logged at the `error` level, since it is still a big deal,
        // > and then the listener will sleep for 1 second.
        //
        // hyper allowed customizing this but axum does not.
        error!("TCP accept error: {err:?}");
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

#[cfg(target_family = "unix")]
mod unix_fd {
    use super::TcpListener;
    use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};

    impl AsRawFd for TcpListener {
        #[inline(always)]
        fn as_raw_fd(&self) -> RawFd {
            self.inner.as_raw_fd()
        }
    }

    impl AsFd for TcpListener {
        #[inline(always)]
        fn as_fd(&self) -> BorrowedFd<'_> {
            self.inner.as_fd()
        }
    }
}
