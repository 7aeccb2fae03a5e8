//! Core of `weir`: a connection-drain controller for async network servers.
//!
//! A server that accepts both plain request/response connections and
//! long-lived streaming connections registers every connection with a
//! [`DrainController`]. When the process wants to stop, one call to
//! [`DrainController::suspend`] stops the intake of new connections,
//! finishes the work that is already in flight and sheds streaming
//! connections gradually instead of severing them all at once.
//! [`DrainController::destroy`] is the escalation hatch that tears
//! everything down immediately.
//!
//! Learn more about `weir`:
//!
//! - Github: <https://github.com/plabayo/weir>

#![doc(
    html_favicon_url = "https://raw.githubusercontent.com/plabayo/weir/main/docs/img/logo.png"
)]
#![doc(html_logo_url = "https://raw.githubusercontent.com/plabayo/weir/main/docs/img/logo.png")]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

pub mod conn;
pub mod error;
pub mod graceful;
pub mod policy;
pub mod rt;

pub mod service;
pub use service::Service;

pub mod controller;
pub use controller::DrainController;

mod registry;
mod shed;
