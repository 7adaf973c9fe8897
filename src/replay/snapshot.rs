//! Snapshot Capture stage.
//!
//! Durably copies every row the locator selected, grouped per table, before
//! any deletion occurs. Capture for all tables and the `pending →
//! snapshot_created` transition commit together: either the whole snapshot
//! set exists, or the test is still `pending` and nothing has been touched.

use tracing::debug;

use crate::replay::error::Result;
use crate::replay::locator::AffectedRecordSet;
use crate::replay::store::ReplayStore;
use crate::replay::types::{ReplayTest, ReplayTestSnapshot};

pub struct SnapshotCapture<'a> {
    store: &'a ReplayStore,
}

impl<'a> SnapshotCapture<'a> {
    pub fn new(store: &'a ReplayStore) -> Self {
        Self { store }
    }

    /// Capture the located record sets for this test. The test must be
    /// `pending`; on success it is `snapshot_created`. Tables with no
    /// affected rows produce no snapshot.
    pub fn capture(
        &self,
        test: &ReplayTest,
        located: &[AffectedRecordSet],
    ) -> Result<Vec<ReplayTestSnapshot>> {
        debug!(
            test_id = %test.id,
            stage = "capture",
            tables = located.len(),
            "Capturing pre-rollback snapshot"
        );
        self.store.capture_and_mark(&test.id, located)
    }
}
