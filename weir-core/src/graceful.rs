//! Process-level graceful shutdown, re-exported from [`tokio-graceful`].
//!
//! The drain controller winds down *connections*; [`Shutdown`] winds down
//! *tasks*. The two compose: spawn connection tasks through a guard-aware
//! [`Executor`](crate::rt::Executor), call
//! [`DrainController::suspend`](crate::DrainController::suspend) when the
//! shutdown signal arrives, and escalate to
//! [`DrainController::destroy`](crate::DrainController::destroy) when the
//! shutdown deadline is about to expire.
//!
//! [`tokio-graceful`]: https://docs.rs/tokio-graceful

pub use tokio_graceful::{Shutdown, ShutdownGuard, WeakShutdownGuard};
