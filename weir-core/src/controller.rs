//! The drain controller: orchestrates suspension and destruction across
//! every tracked connection.
//!
//! One controller instance guards one listening server. The hosting server
//! feeds it connection lifecycle events ([`DrainController::on_conn_accepted`],
//! [`DrainController::on_conn_upgraded`], [`DrainController::on_conn_closed`],
//! [`DrainController::on_request_started`]) and hands it the listener via
//! [`DrainController::attach_listener`]; a signal handler or operator
//! endpoint drives [`DrainController::suspend`] and, if the server must go
//! down *now*, [`DrainController::destroy`].
//!
//! All registry mutation and every shutdown decision is serialized behind a
//! single mutex. Deferred work (accept-grace expiry, the idle sweep, shed
//! batches) runs as spawned timer tasks that re-enter that serialized
//! section when they fire, and every pending timer is cancellable in bulk
//! through one token so destruction can cut them all off at once.

use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{
    conn::{ConnControl, ConnKey, ConnKind, ConnPhase, ListenerControl, classify},
    policy::{DrainAction, DrainPolicy, decide},
    registry::Registry,
    rt::Executor,
    shed::{self, ShedPlan},
};

/// Lifecycle state of a [`DrainController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainState {
    /// Accepting and serving as normal.
    #[default]
    Running,
    /// [`DrainController::suspend`] is winding existing work down.
    Suspending,
    /// The synchronous part of suspension is complete; deferred work
    /// (accept-grace timer, idle sweep, shed batches) may still fire.
    Suspended,
    /// [`DrainController::destroy`] tore everything down. Terminal.
    Destroyed,
}

impl DrainState {
    /// True once the controller has left [`DrainState::Running`].
    #[must_use]
    pub const fn is_draining(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Outcome of offering a connection (or an upgrade) to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a refused connection must not be served"]
pub enum Admission {
    /// The connection is tracked; keep serving it.
    Accepted,
    /// The connection was refused and has already been signalled to
    /// destroy itself; the caller must not serve it.
    Refused,
}

impl Admission {
    /// True if the connection was admitted.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// True if the connection was turned away.
    #[must_use]
    pub const fn is_refused(&self) -> bool {
        matches!(self, Self::Refused)
    }
}

/// Aggregate outcome of [`DrainController::suspend`].
///
/// The counts cover the synchronous suspension pass only; deferred work
/// (grace expiry, idle sweep, shed batches) is reported through `tracing`
/// as it happens. A call that found the controller already draining
/// reports zero work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuspendReport {
    /// Connections destroyed outright.
    pub destroyed: usize,
    /// Connections whose current or next response was marked as their last.
    pub marked_last: usize,
    /// Connections left open awaiting their first request.
    pub left_open: usize,
    /// Streaming connections handed to the staged shedder.
    pub shed_scheduled: usize,
}

/// Aggregate outcome of [`DrainController::destroy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestroyReport {
    /// Connections that were still tracked and have been destroyed.
    pub destroyed: usize,
}

/// Builder for a [`DrainController`].
#[derive(Debug, Clone)]
pub struct DrainControllerBuilder {
    policy: DrainPolicy,
    close_idle_after: Duration,
    accept_grace: Duration,
    shed_window: Duration,
    executor: Executor,
}

impl Default for DrainControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainControllerBuilder {
    /// Create a builder with the default configuration: the graceful
    /// policy, no accept grace, no idle deadline and no shed window.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            policy: DrainPolicy::Graceful,
            close_idle_after: Duration::ZERO,
            accept_grace: Duration::ZERO,
            shed_window: Duration::ZERO,
            executor: Executor::new(),
        }
    }

    /// Set the drain policy applied to live connections at suspension.
    #[must_use]
    pub fn with_policy(mut self, policy: DrainPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the drain policy applied to live connections at suspension.
    pub fn set_policy(&mut self, policy: DrainPolicy) -> &mut Self {
        self.policy = policy;
        self
    }

    /// Set how long after suspension plain connections still idle or
    /// uncommitted are swept.
    ///
    /// Zero (the default) disables the sweep.
    #[must_use]
    pub fn with_close_idle_after(mut self, delay: Duration) -> Self {
        self.close_idle_after = delay;
        self
    }

    /// Set how long after suspension plain connections still idle or
    /// uncommitted are swept.
    ///
    /// Zero (the default) disables the sweep.
    pub fn set_close_idle_after(&mut self, delay: Duration) -> &mut Self {
        self.close_idle_after = delay;
        self
    }

    /// Set how long the listener keeps accepting after suspension begins.
    ///
    /// Zero (the default) stops the listener immediately. Connections
    /// arriving within the grace are admitted and tracked like any other.
    #[must_use]
    pub fn with_accept_grace(mut self, grace: Duration) -> Self {
        self.accept_grace = grace;
        self
    }

    /// Set how long the listener keeps accepting after suspension begins.
    ///
    /// Zero (the default) stops the listener immediately. Connections
    /// arriving within the grace are admitted and tracked like any other.
    pub fn set_accept_grace(&mut self, grace: Duration) -> &mut Self {
        self.accept_grace = grace;
        self
    }

    /// Set the window over which streaming connections are shed.
    ///
    /// Zero (the default) destroys them immediately at suspension instead
    /// of spreading the destruction out.
    #[must_use]
    pub fn with_shed_window(mut self, window: Duration) -> Self {
        self.shed_window = window;
        self
    }

    /// Set the window over which streaming connections are shed.
    ///
    /// Zero (the default) destroys them immediately at suspension instead
    /// of spreading the destruction out.
    pub fn set_shed_window(&mut self, window: Duration) -> &mut Self {
        self.shed_window = window;
        self
    }

    /// Set the executor used to spawn drain timer tasks.
    #[must_use]
    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    /// Set the executor used to spawn drain timer tasks.
    pub fn set_executor(&mut self, executor: Executor) -> &mut Self {
        self.executor = executor;
        self
    }

    /// Build the controller.
    #[must_use]
    pub fn build(self) -> DrainController {
        let (state_tx, _) = watch::channel(DrainState::Running);
        DrainController {
            inner: Arc::new(Shared {
                policy: self.policy,
                close_idle_after: self.close_idle_after,
                accept_grace: self.accept_grace,
                shed_window: self.shed_window,
                executor: self.executor,
                state_tx,
                timers: CancellationToken::new(),
                accept_stopped: CancellationToken::new(),
                core: Mutex::new(Core {
                    state: DrainState::Running,
                    registry: Registry::new(),
                    listener: None,
                    listener_stopped: false,
                }),
            }),
        }
    }
}

struct Core {
    state: DrainState,
    registry: Registry,
    listener: Option<Arc<dyn ListenerControl>>,
    /// Whether the listener stop has been issued, whether or not a
    /// listener is attached yet. Authoritative for admission decisions.
    listener_stopped: bool,
}

struct Shared {
    policy: DrainPolicy,
    close_idle_after: Duration,
    accept_grace: Duration,
    shed_window: Duration,
    executor: Executor,
    state_tx: watch::Sender<DrainState>,
    /// Cancels every pending drain timer (grace, sweep, shed) in bulk.
    timers: CancellationToken,
    /// Fires once the listener stop has been issued.
    accept_stopped: CancellationToken,
    core: Mutex<Core>,
}

impl Shared {
    /// Must be called with the `core` lock held (enforced by the `&mut
    /// Core` parameter).
    fn set_state(&self, core: &mut Core, state: DrainState) {
        trace!(from = ?core.state, to = ?state, "drain state transition");
        core.state = state;
        self.state_tx.send_replace(state);
    }

    /// Issue the listener stop exactly once. Never call with the core
    /// lock held: the listener callback runs synchronously.
    fn stop_listener(&self) {
        let (first, listener) = {
            let mut core = self.core.lock();
            let first = !core.listener_stopped;
            core.listener_stopped = true;
            (first, if first { core.listener.clone() } else { None })
        };
        if first {
            debug!("listener stop issued; new connections are no longer admitted");
            if let Some(listener) = listener {
                listener.stop_accepting();
            }
            self.accept_stopped.cancel();
        }
    }
}

/// Orchestrates the suspension and destruction of a server's connections.
///
/// Cheap to clone; every clone drives the same underlying state. See the
/// [module documentation](self) for how the pieces fit together.
#[derive(Clone)]
pub struct DrainController {
    inner: Arc<Shared>,
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DrainController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainController")
            .field("state", &self.state())
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

impl DrainController {
    /// Create a controller with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        DrainControllerBuilder::new().build()
    }

    /// Create a [`DrainControllerBuilder`] to configure a controller.
    #[must_use]
    pub const fn builder() -> DrainControllerBuilder {
        DrainControllerBuilder::new()
    }

    /// The current drain state.
    #[must_use]
    pub fn state(&self) -> DrainState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to drain state transitions.
    pub fn subscribe(&self) -> watch::Receiver<DrainState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of connections currently tracked, both kinds combined.
    #[must_use]
    pub fn tracked_connections(&self) -> usize {
        self.inner.core.lock().registry.len()
    }

    /// Attach the listener handle that suspension stops.
    ///
    /// May be called before or after draining begins; attaching once the
    /// stop moment has passed delivers the stop immediately.
    pub fn attach_listener(&self, listener: Arc<dyn ListenerControl>) {
        let stop_now = {
            let mut core = self.inner.core.lock();
            core.listener = Some(listener.clone());
            core.listener_stopped
        };
        if stop_now {
            debug!("listener attached after the stop moment; stopping it now");
            listener.stop_accepting();
        }
    }

    /// Completes once the listener stop has been issued: immediately at
    /// suspension without an accept grace, when the grace elapses, or at
    /// destruction, whichever comes first.
    pub async fn stopped_accepting(&self) {
        self.inner.accept_stopped.cancelled().await;
    }

    /// Offer a freshly accepted plain connection for tracking.
    ///
    /// Admitted until the listener stop has been issued; connections
    /// showing up during the accept grace are subject to the drain policy.
    /// A refused connection has already been signalled to destroy itself.
    pub fn on_conn_accepted(&self, key: ConnKey, conn: Arc<dyn ConnControl>) -> Admission {
        let inner = &self.inner;
        let refused = {
            let mut core = inner.core.lock();
            let refuse = if core.state == DrainState::Destroyed || core.listener_stopped {
                true
            } else if core.state.is_draining() {
                // late arrival inside the accept grace: the policy decides,
                // exactly as it would have at suspension time
                matches!(
                    decide(inner.policy, classify(ConnKind::Plain, conn.as_ref())),
                    DrainAction::Destroy
                )
            } else {
                false
            };
            if !refuse {
                core.registry.insert(key, ConnKind::Plain, conn.clone());
            }
            refuse
        };
        if refused {
            trace!(%key, "connection refused while draining; destroying");
            conn.destroy();
            Admission::Refused
        } else {
            trace!(%key, "connection tracked");
            Admission::Accepted
        }
    }

    /// Offer a tracked plain connection's upgrade to streaming.
    ///
    /// While draining, upgrades are always refused and the connection is
    /// destroyed: a stream that starts during shutdown would outlive it.
    pub fn on_conn_upgraded(&self, key: ConnKey, conn: Arc<dyn ConnControl>) -> Admission {
        let inner = &self.inner;
        let refused = {
            let mut core = inner.core.lock();
            if core.state.is_draining() {
                true
            } else {
                // same key moves from the plain to the streaming set; the
                // transport may hand over a new handle for the new mode
                core.registry.remove_kind(key, ConnKind::Plain);
                core.registry.insert(key, ConnKind::Streaming, conn.clone());
                false
            }
        };
        if refused {
            trace!(%key, "upgrade refused while draining; destroying connection");
            conn.destroy();
            Admission::Refused
        } else {
            trace!(%key, "connection upgraded to streaming");
            Admission::Accepted
        }
    }

    /// Report that a connection fully closed.
    ///
    /// The one and only way a connection leaves the registry outside of
    /// [`destroy`](Self::destroy). Reporting an untracked key is a no-op,
    /// so natural closes racing a destroy signal are harmless.
    pub fn on_conn_closed(&self, key: ConnKey) {
        let removed = self.inner.core.lock().registry.remove(key);
        match removed {
            Some((kind, _conn)) => trace!(%key, ?kind, "connection closed; untracked"),
            None => trace!(%key, "close reported for an untracked connection; ignored"),
        }
    }

    /// Report that a request started on a tracked connection.
    ///
    /// Once draining has begun, every request that still arrives is the
    /// connection's last, no matter what the suspension pass decided for
    /// that connection earlier.
    pub fn on_request_started(&self, key: ConnKey) {
        let mark = {
            let core = self.inner.core.lock();
            if core.state.is_draining() {
                core.registry.handle(key).cloned()
            } else {
                None
            }
        };
        if let Some(conn) = mark {
            trace!(%key, "request started while draining; response will be the last");
            conn.mark_last();
        }
    }

    /// Suspend the server: stop taking new work and wind down what is live.
    ///
    /// Synchronous and non-blocking. Walks every tracked connection once,
    /// applies the configured [`DrainPolicy`] to its current phase, and
    /// schedules the deferred pieces (accept-grace expiry, idle sweep,
    /// staged shed) on the configured executor. Calling it again while
    /// draining is a no-op.
    ///
    /// Under [`DrainPolicy::Abrupt`] suspension escalates straight to
    /// [`destroy`](Self::destroy): everything is terminated on the spot and
    /// the controller ends up [`DrainState::Destroyed`].
    pub fn suspend(&self) -> SuspendReport {
        let inner = &self.inner;

        // abrupt suspension is destruction by another name: no grace, no
        // staging, straight to the terminal state
        if inner.policy == DrainPolicy::Abrupt {
            let destroyed = self.destroy().destroyed;
            return SuspendReport {
                destroyed,
                ..SuspendReport::default()
            };
        }

        let mut report = SuspendReport::default();
        let mut to_destroy = Vec::new();
        let mut to_mark = Vec::new();
        let mut to_shed = Vec::new();

        {
            let mut core = inner.core.lock();
            if core.state.is_draining() {
                debug!(state = ?core.state, "suspend ignored; already draining");
                return report;
            }
            inner.set_state(&mut core, DrainState::Suspending);
            info!(
                policy = ?inner.policy,
                tracked = core.registry.len(),
                "suspending: winding down connections"
            );

            for kind in [ConnKind::Plain, ConnKind::Streaming] {
                for (key, conn) in core.registry.snapshot(kind) {
                    let phase = classify(kind, conn.as_ref());
                    match decide(inner.policy, phase) {
                        DrainAction::Destroy => to_destroy.push((key, conn)),
                        DrainAction::MarkLast => to_mark.push((key, conn)),
                        DrainAction::LeaveOpen => report.left_open += 1,
                        DrainAction::Shed => to_shed.push(key),
                    }
                }
            }
        }

        // Stop the intake first, so nothing slips in behind the pass above.
        if inner.accept_grace.is_zero() {
            inner.stop_listener();
        } else {
            self.spawn_grace_timer();
        }

        let plan = ShedPlan::new(to_shed.len(), inner.shed_window);
        if plan.is_none() {
            // no window to spread over: streams go down with the idle ones
            let core = inner.core.lock();
            for key in to_shed.drain(..) {
                if let Some(conn) = core.registry.streaming_handle(key) {
                    to_destroy.push((key, conn.clone()));
                }
            }
        }

        report.destroyed = to_destroy.len();
        for (key, conn) in &to_destroy {
            trace!(%key, "destroying connection");
            conn.destroy();
        }

        report.marked_last = to_mark.len();
        for (key, conn) in &to_mark {
            trace!(%key, "marking the connection's current response as its last");
            conn.mark_last();
        }

        if let Some(plan) = plan {
            report.shed_scheduled = to_shed.len();
            self.spawn_shed(to_shed, plan);
        }

        if !inner.close_idle_after.is_zero() {
            self.spawn_idle_sweep();
        }

        {
            let mut core = inner.core.lock();
            // destroy() may have raced us here; never walk that back
            if core.state == DrainState::Suspending {
                inner.set_state(&mut core, DrainState::Suspended);
            }
        }

        info!(
            destroyed = report.destroyed,
            marked_last = report.marked_last,
            left_open = report.left_open,
            shed_scheduled = report.shed_scheduled,
            "suspension pass complete"
        );
        report
    }

    /// Destroy everything: stop the listener, cancel every pending drain
    /// timer and terminate every tracked connection unconditionally.
    ///
    /// Callable from any state, any number of times; later calls find
    /// nothing left to do.
    pub fn destroy(&self) -> DestroyReport {
        let inner = &self.inner;
        // cut off grace, sweep and shed timers before touching the rest
        inner.timers.cancel();

        let victims = {
            let mut core = inner.core.lock();
            if core.state == DrainState::Destroyed {
                debug!("destroy ignored; already destroyed");
                return DestroyReport::default();
            }
            inner.set_state(&mut core, DrainState::Destroyed);
            core.registry.drain_all()
        };

        inner.stop_listener();

        info!(count = victims.len(), "destroying every tracked connection");
        for (key, conn) in &victims {
            trace!(%key, "destroying connection");
            conn.destroy();
        }

        DestroyReport {
            destroyed: victims.len(),
        }
    }

    fn spawn_grace_timer(&self) {
        let shared = self.inner.clone();
        debug!(grace = ?shared.accept_grace, "accept grace running; listener stop deferred");
        self.inner.executor.spawn_task(async move {
            tokio::select! {
                _ = shared.timers.cancelled() => {}
                _ = tokio::time::sleep(shared.accept_grace) => {
                    debug!("accept grace elapsed");
                    shared.stop_listener();
                }
            }
        });
    }

    fn spawn_idle_sweep(&self) {
        let shared = self.inner.clone();
        debug!(delay = ?shared.close_idle_after, "idle sweep scheduled");
        self.inner.executor.spawn_task(async move {
            tokio::select! {
                _ = shared.timers.cancelled() => return,
                _ = tokio::time::sleep(shared.close_idle_after) => {}
            }
            let victims: Vec<_> = {
                let core = shared.core.lock();
                core.registry
                    .snapshot(ConnKind::Plain)
                    .into_iter()
                    .filter(|(_, conn)| {
                        // a response in flight is spared; the standing
                        // mark-last rule closes it once it completes
                        matches!(
                            classify(ConnKind::Plain, conn.as_ref()),
                            ConnPhase::Idle | ConnPhase::Uncommitted
                        )
                    })
                    .collect()
            };
            debug!(
                count = victims.len(),
                "idle sweep: destroying idle and uncommitted connections"
            );
            for (key, conn) in victims {
                trace!(%key, "idle sweep destroys connection");
                conn.destroy();
            }
        });
    }

    fn spawn_shed(&self, keys: Vec<ConnKey>, plan: ShedPlan) {
        let shared = self.inner.clone();
        let cancel = shared.timers.clone();
        debug!(
            count = keys.len(),
            window = ?shared.shed_window,
            "staged shed scheduled"
        );
        self.inner.executor.spawn_task(async move {
            shed::run(keys, plan, cancel, move |key| {
                shared.core.lock().registry.streaming_handle(key).cloned()
            })
            .await;
        });
    }
}
