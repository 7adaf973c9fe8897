//! Historical Replay Engine
//!
//! Rewinds a production prediction dataset to an earlier point in time,
//! reruns the prediction pipeline against that historical state in isolation,
//! statistically compares the replayed outcome against what actually
//! happened, and losslessly restores the original production state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ReplayEngine                          │
//! │  (drives the stage sequence, records failures, exposes API)  │
//! └──────────────────────────────────────────────────────────────┘
//!        │
//!        ▼
//!   RecordLocator ─▶ SnapshotCapture ─▶ RollbackExecutor
//!        │                                     │
//!        │                                     ▼
//!        │                               ReplayDriver ──▶ PredictionPipeline
//!        │                                     │              (external)
//!        │                                     ▼
//!        │                        Comparator ─▶ aggregate()
//!        │                                     │
//!        ▼                                     ▼
//!   ReplayStore  ◀────────────────────── RestoreExecutor
//!   (SQLite: tests, snapshots, results, domain tables)
//! ```
//!
//! # Safety Guarantees
//!
//! - **Capture before delete**: every record the rollback deletes is copied
//!   into a snapshot first, inside the same transaction that advances the
//!   test to `snapshot_created`. Rollback deletes only the snapshotted ids.
//! - **Primary-key deletes**: rollback never deletes by predicate.
//! - **Retryable restore**: restore reinserts captured payloads verbatim and
//!   only marks the test `restored` once every snapshot row is confirmed
//!   back in its table. A failed restore can be retried indefinitely.
//! - **Lifecycle gating**: `pending → snapshot_created → running →
//!   {completed | failed} → restored`; each stage asserts its entry state
//!   atomically with its writes.

pub mod aggregator;
pub mod comparator;
pub mod driver;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod locator;
pub mod restore;
pub mod rollback;
pub mod snapshot;
pub mod store;
pub mod types;

pub use aggregator::{aggregate, ReplaySummaryStats};
pub use comparator::Comparator;
pub use driver::{PredictionPipeline, ReplayContext, ReplayDriver};
pub use engine::{CreateTestRequest, ReplayEngine};
pub use error::{ReplayError, Result};
pub use lifecycle::ReplayStatus;
pub use locator::{AffectedRecordSet, AffectedTable, RecordLocator, RollbackDepth};
pub use restore::{CleanupSummary, RestoreExecutor, RestoreOutcome};
pub use rollback::{RollbackExecutor, TableRollback};
pub use snapshot::SnapshotCapture;
pub use store::ReplayStore;
pub use types::{
    ReplayConfig, ReplayTest, ReplayTestResult, ReplayTestSnapshot, ReplayTestSummary,
    ResultStatus,
};
