//! Rollback Executor.
//!
//! Deletes the captured "future" rows from the live tables, exposing the
//! historical state as of the cutoff. Deletion is by primary-key match
//! against the snapshotted id sets only, never by predicate, so nothing
//! outside the captured set can be deleted and the snapshot covers every
//! deleted row by construction.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::replay::error::Result;
use crate::replay::locator::AffectedTable;
use crate::replay::store::ReplayStore;
use crate::replay::types::ReplayTest;

/// Per-table deletion count, for auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRollback {
    pub table: AffectedTable,
    pub rows_deleted: usize,
}

pub struct RollbackExecutor<'a> {
    store: &'a ReplayStore,
}

impl<'a> RollbackExecutor<'a> {
    pub fn new(store: &'a ReplayStore) -> Self {
        Self { store }
    }

    /// Delete the snapshotted rows. The test must be `snapshot_created`; on
    /// success it is `running` with `started_at` stamped. If this fails
    /// partway the transaction rolls back, no replay is attempted, and
    /// restore from the already-complete snapshot is the recovery path.
    pub fn execute(&self, test: &ReplayTest) -> Result<Vec<TableRollback>> {
        debug!(test_id = %test.id, stage = "rollback", "Deleting captured rows");
        let counts = self.store.rollback_and_mark(&test.id)?;
        Ok(counts
            .into_iter()
            .map(|(table, rows_deleted)| TableRollback {
                table,
                rows_deleted,
            })
            .collect())
    }
}
