//! Replay test lifecycle state machine.
//!
//! ```text
//! pending → snapshot_created → running → {completed | failed} → restored
//! ```
//!
//! `failed` is reachable from any non-terminal state. `restored` is reachable
//! from `completed` and `failed`, and also from `snapshot_created` (a test
//! that captured but never ran may still restore whatever was captured).
//! No transition skips a state.

use serde::{Deserialize, Serialize};

/// Lifecycle states of a replay test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    /// Created, nothing captured or deleted yet.
    Pending,
    /// Every affected row has been captured; live tables untouched.
    SnapshotCreated,
    /// Rollback has deleted the located rows; replay is in flight.
    Running,
    /// Comparison finished and results written.
    Completed,
    /// A stage failed; `error_message` holds the cause. Restore still works.
    Failed,
    /// Original rows confirmed reinserted. Terminal.
    Restored,
}

impl ReplayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayStatus::Pending => "pending",
            ReplayStatus::SnapshotCreated => "snapshot_created",
            ReplayStatus::Running => "running",
            ReplayStatus::Completed => "completed",
            ReplayStatus::Failed => "failed",
            ReplayStatus::Restored => "restored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReplayStatus::Pending),
            "snapshot_created" => Some(ReplayStatus::SnapshotCreated),
            "running" => Some(ReplayStatus::Running),
            "completed" => Some(ReplayStatus::Completed),
            "failed" => Some(ReplayStatus::Failed),
            "restored" => Some(ReplayStatus::Restored),
            _ => None,
        }
    }

    /// Terminal means the dataset is back in its pre-replay state and the
    /// test will never mutate anything again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplayStatus::Restored)
    }

    /// States from which the Restore Executor may run.
    pub fn can_restore(&self) -> bool {
        matches!(
            self,
            ReplayStatus::SnapshotCreated | ReplayStatus::Completed | ReplayStatus::Failed
        )
    }

    /// Legal direct transitions. `failed` is reachable from every
    /// non-terminal, non-failed state.
    pub fn can_transition_to(&self, next: ReplayStatus) -> bool {
        use ReplayStatus::*;
        match (self, next) {
            (Pending, SnapshotCreated) => true,
            (SnapshotCreated, Running) => true,
            (Running, Completed) => true,
            (SnapshotCreated, Restored) => true,
            (Completed, Restored) => true,
            (Failed, Restored) => true,
            (s, Failed) => !s.is_terminal() && *s != Failed,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReplayStatus::*;

    #[test]
    fn happy_path_transitions() {
        assert!(Pending.can_transition_to(SnapshotCreated));
        assert!(SnapshotCreated.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Completed.can_transition_to(Restored));
    }

    #[test]
    fn no_skipping_states() {
        assert!(!Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!SnapshotCreated.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Restored));
    }

    #[test]
    fn failed_reachable_from_non_terminal() {
        assert!(Pending.can_transition_to(Failed));
        assert!(SnapshotCreated.can_transition_to(Failed));
        assert!(Running.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Failed));
        assert!(!Restored.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn restore_entry_states() {
        assert!(SnapshotCreated.can_restore());
        assert!(Completed.can_restore());
        assert!(Failed.can_restore());
        assert!(!Pending.can_restore());
        assert!(!Running.can_restore());
        assert!(!Restored.can_restore());
    }

    #[test]
    fn status_string_round_trip() {
        for s in [Pending, SnapshotCreated, Running, Completed, Failed, Restored] {
            assert_eq!(ReplayStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ReplayStatus::parse("bogus"), None);
    }
}
