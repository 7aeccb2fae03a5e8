//! weir is a connection-drain controller for async network servers.
//!
//! A server registers every connection it accepts with a
//! [`DrainController`]; from then on one call to
//! [`DrainController::suspend`] winds the server down without cutting off
//! the work it already promised to do:
//!
//! - the listener stops accepting, immediately or after a configurable
//!   grace window;
//! - connections mid-response finish that response and then close;
//! - idle connections are closed (or, under the `prefer_sync` policy, kept
//!   around for one final exchange and swept later);
//! - long-lived streaming connections are shed in staged batches spread
//!   over a window instead of all at once;
//! - any request that still arrives is answered and marked as that
//!   connection's last.
//!
//! [`DrainController::destroy`] is the escalation hatch: it cancels every
//! pending drain timer and terminates everything that is still tracked.
//!
//! The controller is transport-agnostic; it steers connections through the
//! [`conn::ConnControl`] signal trait. The `tcp` feature enables the `tcp`
//! module, a ready-made TCP listener and connection tracker wired into it.
//!
//! Task-level shutdown is a separate, composable concern: see [`graceful`]
//! and [`rt::Executor`] for tying connection draining and
//! [`tokio_graceful`]-style task tracking together.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use weir::DrainController;
//! use weir::policy::DrainPolicy;
//!
//! # tokio_test::block_on(async {
//! let controller = DrainController::builder()
//!     .with_policy(DrainPolicy::PreferSync)
//!     .with_accept_grace(Duration::from_secs(2))
//!     .with_close_idle_after(Duration::from_secs(10))
//!     .with_shed_window(Duration::from_secs(30))
//!     .build();
//!
//! // the hosting server reports lifecycle events to the controller and
//! // attaches its listener; an operator endpoint or signal handler then
//! // drives the drain:
//! let report = controller.suspend();
//! assert_eq!(0, report.destroyed);
//! # });
//! ```
//!
//! Learn more about `weir`:
//!
//! - Github: <https://github.com/plabayo/weir>
//!
//! [`tokio_graceful`]: https://docs.rs/tokio-graceful

#![doc(
    html_favicon_url = "https://raw.githubusercontent.com/plabayo/weir/main/docs/img/logo.png"
)]
#![doc(html_logo_url = "https://raw.githubusercontent.com/plabayo/weir/main/docs/img/logo.png")]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

pub mod error {
    //! Error utilities for weir and its users.
    //!
    //! Re-export of [`weir_core::error`].

    pub use ::weir_core::error::*;
}

pub mod conn {
    //! Connection keys, phases and the control-signal traits.
    //!
    //! Re-export of [`weir_core::conn`].

    pub use ::weir_core::conn::*;
}

pub mod policy {
    //! Drain policies and the decision table applied at suspension.
    //!
    //! Re-export of [`weir_core::policy`].

    pub use ::weir_core::policy::*;
}

pub mod controller {
    //! The drain controller and its builder, reports and state.
    //!
    //! Re-export of [`weir_core::controller`].

    pub use ::weir_core::controller::*;
}

pub mod graceful {
    //! Task-level graceful shutdown, re-exported from [`tokio_graceful`].
    //!
    //! Re-export of [`weir_core::graceful`].
    //!
    //! [`tokio_graceful`]: https://docs.rs/tokio-graceful

    pub use ::weir_core::graceful::*;
}

pub mod rt {
    //! Runtime utilities: the [`Executor`] drain timers and connection
    //! tasks are spawned on.
    //!
    //! Re-export of [`weir_core::rt`].

    pub use ::weir_core::rt::*;
}

pub mod service {
    //! The async [`Service`] trait connection handlers implement.
    //!
    //! Re-export of [`weir_core::service`].

    pub use ::weir_core::service::*;
}

pub use ::weir_core::{DrainController, Service};

#[cfg(feature = "tcp")]
pub use ::weir_tcp as tcp;
