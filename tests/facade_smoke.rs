//! The umbrella crate surface: every re-exported path is usable as-is.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use weir::DrainController;
use weir::conn::{ConnControl, ConnKey, ConnPhase, ExchangeState};
use weir::controller::{Admission, DrainState};
use weir::error::{ErrorContext, OpaqueError};
use weir::policy::{DrainAction, DrainPolicy, decide};

#[derive(Default)]
struct Conn {
    destroyed: AtomicBool,
}

impl ConnControl for Conn {
    fn exchange_state(&self) -> ExchangeState {
        ExchangeState::Served
    }

    fn mark_last(&self) {}

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }
}

#[tokio::test]
async fn controller_lifecycle_through_the_facade() {
    let controller = DrainController::new();
    assert_eq!(DrainState::Running, controller.state());

    let key = ConnKey::new(([127, 0, 0, 1], 4040).into());
    let conn = Arc::new(Conn::default());
    assert_eq!(
        Admission::Accepted,
        controller.on_conn_accepted(key, conn.clone())
    );

    let report = controller.suspend();
    assert_eq!(1, report.destroyed);
    assert!(conn.destroyed.load(Ordering::Acquire));
    assert_eq!(DrainState::Suspended, controller.state());
}

#[test]
fn policy_decisions_are_reachable() {
    assert_eq!(
        DrainAction::MarkLast,
        decide(DrainPolicy::Graceful, ConnPhase::InProgress)
    );
}

#[test]
fn error_context_composes() {
    let err: OpaqueError = "boom".parse::<u32>().context("parse the answer").unwrap_err();
    assert!(err.to_string().contains("parse the answer"));
}
