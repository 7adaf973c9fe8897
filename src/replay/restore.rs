//! Restore Executor.
//!
//! Reinserts every captured row, bringing the dataset back to its pre-replay
//! state, and marks the test terminal. Restore undoes a destructive
//! operation, so it must stay retryable indefinitely: a failed restore
//! leaves the test in its prior state, and `restored` is only reached once
//! every snapshot row is confirmed reinserted.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::replay::error::Result;
use crate::replay::lifecycle::ReplayStatus;
use crate::replay::store::ReplayStore;

/// Outcome of a restore call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub test_id: String,
    pub rows_restored: usize,
    pub status: ReplayStatus,
    /// True when the test was already `restored` and nothing was done.
    pub already_restored: bool,
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSummary {
    pub test_id: String,
    pub replay_predictions_deleted: usize,
    pub snapshots_deleted: usize,
}

pub struct RestoreExecutor<'a> {
    store: &'a ReplayStore,
}

impl<'a> RestoreExecutor<'a> {
    pub fn new(store: &'a ReplayStore) -> Self {
        Self { store }
    }

    /// Reinsert the test's snapshot set and mark it `restored`. Legal from
    /// `snapshot_created`, `completed`, and `failed`; a second call on a
    /// `restored` test is a no-op.
    pub fn restore(&self, test_id: &str) -> Result<RestoreOutcome> {
        let before = self.store.get_test(test_id)?.status;
        if before == ReplayStatus::Restored {
            return Ok(RestoreOutcome {
                test_id: test_id.to_string(),
                rows_restored: 0,
                status: ReplayStatus::Restored,
                already_restored: true,
            });
        }

        debug!(test_id = %test_id, stage = "restore", "Reinserting captured rows");
        let rows_restored = self.store.restore_and_mark(test_id)?;
        info!(test_id = %test_id, rows = rows_restored, "Replay test restored");
        Ok(RestoreOutcome {
            test_id: test_id.to_string(),
            rows_restored,
            status: ReplayStatus::Restored,
            already_restored: false,
        })
    }

    /// Purge replay-tagged predictions and snapshot payloads once restore is
    /// done. Idempotent: cleaning an already-clean test removes nothing and
    /// does not error.
    pub fn cleanup(&self, test_id: &str) -> Result<CleanupSummary> {
        let test = self.store.get_test(test_id)?;
        if test.status != ReplayStatus::Restored {
            return Err(crate::replay::error::ReplayError::InvalidState {
                test_id: test_id.to_string(),
                expected: "restored",
                actual: test.status,
            });
        }
        let (replay_predictions_deleted, snapshots_deleted) = self.store.cleanup(test_id)?;
        Ok(CleanupSummary {
            test_id: test_id.to_string(),
            replay_predictions_deleted,
            snapshots_deleted,
        })
    }
}
