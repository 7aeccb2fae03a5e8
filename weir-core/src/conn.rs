//! Shared connection vocabulary for drain-aware servers.
//!
//! The drain controller never touches sockets. It sees connections through
//! the [`ConnControl`] capability trait and identifies them by [`ConnKey`];
//! the transport (e.g. `weir-tcp`) owns the actual I/O.

use std::{fmt, net::SocketAddr, str::FromStr};

/// Identity of a tracked connection: its remote (peer) address and port.
///
/// A key is unique among live connections. The transport may only reuse a
/// key once the connection previously registered under it has been closed
/// out via the connection-closed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnKey(SocketAddr);

impl ConnKey {
    /// Create a key from the connection's remote address.
    #[must_use]
    pub const fn new(peer: SocketAddr) -> Self {
        Self(peer)
    }

    /// The remote address this key was derived from.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for ConnKey {
    fn from(peer: SocketAddr) -> Self {
        Self(peer)
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnKey {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl serde::Serialize for ConnKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let address = self.to_string();
        address.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for ConnKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The transport mode a connection is currently tracked as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnKind {
    /// Request/response with keep-alive in between.
    Plain,
    /// Upgraded to a long-lived stream (push payloads, no request cycle).
    Streaming,
}

/// Where a plain connection is in its request/response exchange,
/// as reported by the transport via [`ConnControl::exchange_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeState {
    /// No request has ever been received on this connection.
    #[default]
    None,
    /// A response is currently being produced.
    Active,
    /// At least one response was served; currently between exchanges.
    Served,
}

/// Classification of a connection at a decision point.
///
/// Always derived fresh from the connection's kind and live exchange state,
/// never stored: a connection may move between phases at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnPhase {
    /// Plain, never received a request.
    Uncommitted,
    /// Plain, mid-response.
    InProgress,
    /// Plain, between exchanges.
    Idle,
    /// Upgraded to a long-lived stream.
    Streaming,
}

/// Classify a connection for a drain decision.
pub fn classify(kind: ConnKind, conn: &dyn ConnControl) -> ConnPhase {
    match kind {
        ConnKind::Streaming => ConnPhase::Streaming,
        ConnKind::Plain => match conn.exchange_state() {
            ExchangeState::None => ConnPhase::Uncommitted,
            ExchangeState::Active => ConnPhase::InProgress,
            ExchangeState::Served => ConnPhase::Idle,
        },
    }
}

/// Capability surface the drain controller requires from every tracked
/// connection.
///
/// Implemented by the transport side (see `weir-tcp`). All methods are
/// cheap, non-blocking signals that may be called from any task; they must
/// not call back into the controller synchronously.
pub trait ConnControl: Send + Sync + 'static {
    /// The connection's current exchange state.
    ///
    /// Read fresh at every decision point; the controller never caches it.
    fn exchange_state(&self) -> ExchangeState;

    /// Mark the current or next response as this connection's last.
    ///
    /// Once the marked response completes, the transport closes the
    /// connection instead of keeping it alive. Calling this on an already
    /// marked (or destroyed) connection is a no-op.
    fn mark_last(&self);

    /// Forcibly terminate the connection.
    ///
    /// A signal, not a synchronous close: the transport tears the
    /// connection down as soon as it observes it. Idempotent.
    fn destroy(&self);
}

/// Capability surface the drain controller requires from the listener.
pub trait ListenerControl: Send + Sync + 'static {
    /// Stop accepting new connections. Idempotent.
    fn stop_accepting(&self);
}
