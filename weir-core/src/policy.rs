//! Drain policies and the pure decision function behind them.

use serde::{Deserialize, Serialize};

use crate::conn::ConnPhase;

/// How live connections are treated when the server suspends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Finish responses in flight, close idle connections right away and
    /// shed streaming connections gradually over the shed window.
    ///
    /// Named `default` in configuration files.
    #[default]
    #[serde(alias = "default")]
    Graceful,
    /// Like [`Graceful`], except idle connections stay open for one more
    /// exchange: their next response is served and marked as the last.
    ///
    /// [`Graceful`]: Self::Graceful
    PreferSync,
    /// Destroy every connection immediately, streaming included.
    Abrupt,
}

/// What the drain policy wants done with a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainAction {
    /// Terminate now.
    Destroy,
    /// Let the current or next response be the connection's last, then
    /// close instead of keeping alive.
    MarkLast,
    /// Leave untouched. Any request that still arrives is caught by the
    /// standing mark-last rule.
    LeaveOpen,
    /// Hand over to the staged shedder.
    Shed,
}

/// Decide what to do with a connection in the given phase.
///
/// Pure: same policy and phase always give the same action. The caller is
/// responsible for classifying the connection at the moment of decision.
#[must_use]
pub const fn decide(policy: DrainPolicy, phase: ConnPhase) -> DrainAction {
    match (policy, phase) {
        (DrainPolicy::Abrupt, _) | (DrainPolicy::Graceful, ConnPhase::Idle) => {
            DrainAction::Destroy
        }
        (_, ConnPhase::Streaming) => DrainAction::Shed,
        (_, ConnPhase::InProgress) | (DrainPolicy::PreferSync, ConnPhase::Idle) => {
            DrainAction::MarkLast
        }
        (_, ConnPhase::Uncommitted) => DrainAction::LeaveOpen,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graceful_decision_table() {
        use DrainPolicy::Graceful;
        assert_eq!(DrainAction::Shed, decide(Graceful, ConnPhase::Streaming));
        assert_eq!(
            DrainAction::MarkLast,
            decide(Graceful, ConnPhase::InProgress)
        );
        assert_eq!(DrainAction::Destroy, decide(Graceful, ConnPhase::Idle));
        assert_eq!(
            DrainAction::LeaveOpen,
            decide(Graceful, ConnPhase::Uncommitted)
        );
    }

    #[test]
    fn prefer_sync_decision_table() {
        use DrainPolicy::PreferSync;
        assert_eq!(DrainAction::Shed, decide(PreferSync, ConnPhase::Streaming));
        assert_eq!(
            DrainAction::MarkLast,
            decide(PreferSync, ConnPhase::InProgress)
        );
        // the one row that differs from graceful: idle gets a final exchange
        assert_eq!(DrainAction::MarkLast, decide(PreferSync, ConnPhase::Idle));
        assert_eq!(
            DrainAction::LeaveOpen,
            decide(PreferSync, ConnPhase::Uncommitted)
        );
    }

    #[test]
    fn abrupt_destroys_every_phase() {
        for phase in [
            ConnPhase::Uncommitted,
            ConnPhase::InProgress,
            ConnPhase::Idle,
            ConnPhase::Streaming,
        ] {
            assert_eq!(
                DrainAction::Destroy,
                decide(DrainPolicy::Abrupt, phase),
                "phase: {phase:?}"
            );
        }
    }

    #[test]
    fn policy_is_default_graceful() {
        assert_eq!(DrainPolicy::Graceful, DrainPolicy::default());
    }

    #[test]
    fn policy_config_names() {
        let policy: DrainPolicy = serde_json::from_str("\"prefer_sync\"").unwrap();
        assert_eq!(DrainPolicy::PreferSync, policy);

        // `default` is the historical name for the graceful policy
        let policy: DrainPolicy = serde_json::from_str("\"default\"").unwrap();
        assert_eq!(DrainPolicy::Graceful, policy);

        let policy: DrainPolicy = serde_json::from_str("\"abrupt\"").unwrap();
        assert_eq!(DrainPolicy::Abrupt, policy);
    }
}
