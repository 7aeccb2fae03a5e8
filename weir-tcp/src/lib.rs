//! TCP transport for weir.
//!
//! Binds a TCP listener whose accept loop, per-connection tasks and io
//! streams are all wired into a [`DrainController`]: accepted connections
//! are tracked, drain signals are enforced (a destroyed connection's task
//! is cancelled and its socket dropped) and lifecycle events flow back to
//! the controller as they happen.
//!
//! # weir
//!
//! Crate used by the end-user `weir` crate and `weir` crate authors alike.
//!
//! Learn more about `weir`:
//!
//! - Github: <https://github.com/plabayo/weir>
//!
//! [`DrainController`]: weir_core::DrainController

#![doc(
    html_favicon_url = "https://raw.githubusercontent.com/plabayo/weir/main/docs/img/logo.png"
)]
#![doc(html_logo_url = "https://raw.githubusercontent.com/plabayo/weir/main/docs/img/logo.png")]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

mod conn;
pub use conn::{ConnHandle, TcpConn};

mod listener;
pub use listener::{TcpListener, TcpListenerBuilder};
