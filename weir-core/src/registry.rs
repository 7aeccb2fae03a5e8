//! Book-keeping of live connections, keyed by peer address.
//!
//! One map per connection kind. The stored handles are non-owning signal
//! references: the connection task owns the socket, the registry only hands
//! out [`ConnControl`] handles to act on. The registry itself is not
//! synchronized; the drain controller serializes every access behind its
//! own lock.

use std::sync::Arc;

use ahash::{HashMap, HashMapExt as _};
use tracing::warn;

use crate::conn::{ConnControl, ConnKey, ConnKind};

pub(crate) struct Registry {
    plain: HashMap<ConnKey, Arc<dyn ConnControl>>,
    streaming: HashMap<ConnKey, Arc<dyn ConnControl>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            plain: HashMap::new(),
            streaming: HashMap::new(),
        }
    }

    fn map_mut(&mut self, kind: ConnKind) -> &mut HashMap<ConnKey, Arc<dyn ConnControl>> {
        match kind {
            ConnKind::Plain => &mut self.plain,
            ConnKind::Streaming => &mut self.streaming,
        }
    }

    fn map(&self, kind: ConnKind) -> &HashMap<ConnKey, Arc<dyn ConnControl>> {
        match kind {
            ConnKind::Plain => &self.plain,
            ConnKind::Streaming => &self.streaming,
        }
    }

    /// Track a connection under the given key.
    ///
    /// A live entry under the same key is an invariant violation on the
    /// transport side; the last write wins so the registry keeps tracking
    /// the connection that actually exists.
    pub(crate) fn insert(&mut self, key: ConnKey, kind: ConnKind, conn: Arc<dyn ConnControl>) {
        let prev = self.map_mut(kind).insert(key, conn);
        if prev.is_some() {
            warn!(%key, ?kind, "connection key registered over a live entry; last write wins");
        }
        debug_assert!(prev.is_none(), "duplicate connection key: {key}");
    }

    /// Remove a connection, whichever kind it is tracked as.
    pub(crate) fn remove(&mut self, key: ConnKey) -> Option<(ConnKind, Arc<dyn ConnControl>)> {
        if let Some(conn) = self.plain.remove(&key) {
            return Some((ConnKind::Plain, conn));
        }
        self.streaming
            .remove(&key)
            .map(|conn| (ConnKind::Streaming, conn))
    }

    /// Remove a connection of a specific kind, leaving the other map alone.
    pub(crate) fn remove_kind(
        &mut self,
        key: ConnKey,
        kind: ConnKind,
    ) -> Option<Arc<dyn ConnControl>> {
        self.map_mut(kind).remove(&key)
    }

    pub(crate) fn handle(&self, key: ConnKey) -> Option<&Arc<dyn ConnControl>> {
        self.plain.get(&key).or_else(|| self.streaming.get(&key))
    }

    pub(crate) fn streaming_handle(&self, key: ConnKey) -> Option<&Arc<dyn ConnControl>> {
        self.streaming.get(&key)
    }

    pub(crate) fn count(&self, kind: ConnKind) -> usize {
        self.map(kind).len()
    }

    pub(crate) fn len(&self) -> usize {
        self.plain.len() + self.streaming.len()
    }

    /// Owned copy of one kind's entries, safe to iterate while the registry
    /// keeps mutating.
    pub(crate) fn snapshot(&self, kind: ConnKind) -> Vec<(ConnKey, Arc<dyn ConnControl>)> {
        self.map(kind)
            .iter()
            .map(|(key, conn)| (*key, conn.clone()))
            .collect()
    }

    /// Empty both maps, returning every tracked connection.
    pub(crate) fn drain_all(&mut self) -> Vec<(ConnKey, Arc<dyn ConnControl>)> {
        self.plain.drain().chain(self.streaming.drain()).collect()
    }
}
