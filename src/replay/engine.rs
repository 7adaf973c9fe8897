//! Replay engine orchestration.
//!
//! Drives one test through the linear stage sequence
//! locate → capture → rollback → replay → compare → aggregate,
//! with restore and cleanup as separate operations. Any stage failure is
//! recorded on the test (`status = failed`, `error_message`) so an operator
//! can inspect and restore; precondition rejections leave the test
//! untouched.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info};

use crate::replay::aggregator::aggregate;
use crate::replay::comparator::Comparator;
use crate::replay::driver::{PredictionPipeline, ReplayDriver};
use crate::replay::error::{ReplayError, Result};
use crate::replay::lifecycle::ReplayStatus;
use crate::replay::locator::{AffectedRecordSet, AffectedTable, RecordLocator, RollbackDepth};
use crate::replay::restore::{CleanupSummary, RestoreExecutor, RestoreOutcome};
use crate::replay::snapshot::SnapshotCapture;
use crate::replay::rollback::RollbackExecutor;
use crate::replay::store::ReplayStore;
use crate::replay::types::{
    ReplayConfig, ReplayTest, ReplayTestResult, ReplayTestSnapshot, ReplayTestSummary,
};

/// Parameters for creating a replay test.
#[derive(Debug, Clone)]
pub struct CreateTestRequest {
    pub org_id: String,
    pub name: String,
    pub description: Option<String>,
    pub rollback_depth: RollbackDepth,
    pub rollback_to: DateTime<Utc>,
    pub universe_id: String,
    pub target_ids: Option<Vec<String>>,
    pub config: Option<ReplayConfig>,
}

pub struct ReplayEngine {
    store: Arc<ReplayStore>,
    pipeline: Arc<dyn PredictionPipeline>,
}

impl ReplayEngine {
    pub fn new(store: Arc<ReplayStore>, pipeline: Arc<dyn PredictionPipeline>) -> Self {
        Self { store, pipeline }
    }

    pub fn store(&self) -> &ReplayStore {
        &self.store
    }

    /// Validate and persist a new test in `pending`. Nothing is captured or
    /// deleted until `run`.
    pub fn create_test(&self, req: CreateTestRequest) -> Result<ReplayTest> {
        if req.name.trim().is_empty() {
            return Err(ReplayError::Validation("test name must not be empty".into()));
        }
        if req.universe_id.trim().is_empty() {
            return Err(ReplayError::Validation("universe id must not be empty".into()));
        }
        if req.rollback_to > Utc::now() {
            return Err(ReplayError::Validation(
                "rollback cutoff must not be in the future".into(),
            ));
        }
        if let Some(targets) = &req.target_ids {
            if targets.is_empty() {
                return Err(ReplayError::Validation(
                    "target filter, when given, must not be empty".into(),
                ));
            }
        }
        let config = req.config.unwrap_or_default();
        if config.position_size <= 0.0 || !config.position_size.is_finite() {
            return Err(ReplayError::Validation(
                "position size must be a positive finite number".into(),
            ));
        }

        let mut test = ReplayTest::new(
            req.org_id,
            req.name,
            req.rollback_depth,
            req.rollback_to,
            req.universe_id,
        )
        .with_config(config);
        test.description = req.description;
        test.target_ids = req.target_ids;

        self.store.create_test(&test)?;
        Ok(test)
    }

    pub fn get_test(&self, test_id: &str) -> Result<ReplayTest> {
        self.store.get_test(test_id)
    }

    pub fn list_tests(&self, org_id: &str) -> Result<Vec<ReplayTest>> {
        self.store.list_tests_for_org(org_id)
    }

    /// Preview which rows a run would roll back. Read-only.
    pub fn preview_affected(&self, test_id: &str) -> Result<Vec<AffectedRecordSet>> {
        let test = self.store.get_test(test_id)?;
        RecordLocator::new(&self.store).locate(&test)
    }

    /// Execute the full replay: capture → rollback → replay → compare →
    /// aggregate. The test must be `pending`, and no other non-terminal test
    /// may hold the same universe. Stage failures flip the test to `failed`
    /// with the underlying message; restore remains available.
    pub async fn run(&self, test_id: &str) -> Result<ReplayTest> {
        let test = self.store.get_test(test_id)?;
        if test.status != ReplayStatus::Pending {
            return Err(ReplayError::InvalidState {
                test_id: test_id.to_string(),
                expected: "pending",
                actual: test.status,
            });
        }
        if let Some(holder) = self.store.find_active_test(&test.universe_id, &test.id)? {
            return Err(ReplayError::UniverseBusy {
                universe_id: test.universe_id.clone(),
                test_id: holder,
            });
        }

        match self.run_stages(test).await {
            Ok(completed) => Ok(completed),
            Err(e) => {
                if e.is_fatal_to_test() {
                    if let Err(mark_err) = self.store.mark_failed(test_id, &e.to_string()) {
                        error!(
                            test_id = %test_id,
                            error = %mark_err,
                            "Failed to record test failure"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn run_stages(&self, test: ReplayTest) -> Result<ReplayTest> {
        let located = RecordLocator::new(&self.store).locate(&test)?;
        let snapshots = SnapshotCapture::new(&self.store).capture(&test, &located)?;
        let rollback = RollbackExecutor::new(&self.store).execute(&test)?;
        info!(
            test_id = %test.id,
            rows_deleted = rollback.iter().map(|t| t.rows_deleted).sum::<usize>(),
            "Historical state exposed as of cutoff"
        );

        let targets = affected_targets(&snapshots);
        let test = self.store.get_test(&test.id)?;
        ReplayDriver::new(&self.store, self.pipeline.as_ref())
            .replay(&test, targets)
            .await?;

        let comparator = Comparator::new(test.config.position_size);
        let results = comparator.compare_test(&self.store, &test)?;
        let stats = aggregate(&results);
        self.store.complete_with_results(&test.id, &results, &stats)?;

        self.store.get_test(&test.id)
    }

    pub fn get_results(&self, test_id: &str) -> Result<Vec<ReplayTestResult>> {
        // Distinguish "unknown test" from "no results yet".
        self.store.get_test(test_id)?;
        self.store.get_results(test_id)
    }

    /// Derived, read-only aggregate of one test.
    pub fn get_summary(&self, test_id: &str) -> Result<ReplayTestSummary> {
        let test = self.store.get_test(test_id)?;
        let results = self.store.get_results(test_id)?;
        Ok(ReplayTestSummary {
            test_id: test.id,
            org_id: test.org_id,
            name: test.name,
            status: test.status,
            rollback_depth: test.rollback_depth,
            rollback_to: test.rollback_to,
            universe_id: test.universe_id,
            error_message: test.error_message,
            created_at: test.created_at,
            started_at: test.started_at,
            completed_at: test.completed_at,
            stats: aggregate(&results),
        })
    }

    /// Aggregate statistics across every test of an organization.
    pub fn get_org_summary(&self, org_id: &str) -> Result<crate::replay::aggregator::ReplaySummaryStats> {
        let results = self.store.get_results_for_org(org_id)?;
        Ok(aggregate(&results))
    }

    /// Reinsert the captured rows and mark the test `restored`. Retryable
    /// indefinitely; idempotent once restored.
    pub fn restore(&self, test_id: &str) -> Result<RestoreOutcome> {
        RestoreExecutor::new(&self.store).restore(test_id)
    }

    /// Purge replay-tagged artifacts of a restored test.
    pub fn cleanup(&self, test_id: &str) -> Result<CleanupSummary> {
        RestoreExecutor::new(&self.store).cleanup(test_id)
    }

    /// Delete a test and its artifacts. Only `pending` (never captured) and
    /// `restored` (fully undone) tests may be deleted; anything else still
    /// owns live rollback state.
    pub fn delete_test(&self, test_id: &str) -> Result<()> {
        let test = self.store.get_test(test_id)?;
        match test.status {
            ReplayStatus::Pending | ReplayStatus::Restored => self.store.delete_test(test_id),
            other => Err(ReplayError::InvalidState {
                test_id: test_id.to_string(),
                expected: "pending or restored",
                actual: other,
            }),
        }
    }

    /// Reconciliation for crashes between rollback and replay: any test
    /// stuck in `running` longer than `max_age` is forced to `failed` so
    /// restore becomes reachable. Returns the number of tests flipped.
    pub fn fail_stuck_tests(&self, max_age: Duration) -> Result<usize> {
        self.store.fail_stuck_tests(
            Utc::now() - max_age,
            "replay interrupted mid-run; forced to failed by reconciliation",
        )
    }
}

/// Distinct targets whose original predictions were captured (and then
/// deleted), i.e. the set the pipeline must regenerate.
fn affected_targets(snapshots: &[ReplayTestSnapshot]) -> Vec<String> {
    let mut targets = BTreeSet::new();
    for snapshot in snapshots {
        if snapshot.table != AffectedTable::Predictions {
            continue;
        }
        for row in &snapshot.rows {
            if let Some(target) = row.get("target_id").and_then(|v| v.as_str()) {
                targets.insert(target.to_string());
            }
        }
    }
    targets.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, GroundTruth, Prediction};
    use crate::replay::driver::ReplayContext;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct EchoPipeline {
        direction: Direction,
        confidence: f64,
    }

    #[async_trait]
    impl PredictionPipeline for EchoPipeline {
        async fn generate_predictions(&self, ctx: &ReplayContext) -> Result<Vec<Prediction>> {
            Ok(ctx
                .target_ids
                .iter()
                .map(|t| {
                    Prediction::new(t.clone(), ctx.universe_id.clone(), self.direction, self.confidence, 0.02)
                })
                .collect())
        }
    }

    struct FailingPipeline;

    #[async_trait]
    impl PredictionPipeline for FailingPipeline {
        async fn generate_predictions(&self, _ctx: &ReplayContext) -> Result<Vec<Prediction>> {
            Err(ReplayError::Pipeline("llm ensemble unavailable".into()))
        }
    }

    fn cutoff() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn engine_with(pipeline: Arc<dyn PredictionPipeline>) -> ReplayEngine {
        ReplayEngine::new(Arc::new(ReplayStore::in_memory().unwrap()), pipeline)
    }

    fn request(universe: &str) -> CreateTestRequest {
        CreateTestRequest {
            org_id: "org1".into(),
            name: "weekly replay".into(),
            description: None,
            rollback_depth: RollbackDepth::Predictions,
            rollback_to: cutoff(),
            universe_id: universe.into(),
            target_ids: None,
            config: None,
        }
    }

    fn seed_target(engine: &ReplayEngine, target: &str, direction: Direction, truth: Direction) {
        let after = cutoff() + Duration::hours(2);
        let p = Prediction::new(target, "U1", direction, 0.8, 0.02).with_timestamps(after, after);
        engine.store().insert_prediction(&p).unwrap();
        engine
            .store()
            .upsert_ground_truth(&GroundTruth::new(target, truth, 0.03))
            .unwrap();
    }

    #[test]
    fn create_test_validation() {
        let engine = engine_with(Arc::new(FailingPipeline));

        let mut req = request("U1");
        req.name = "  ".into();
        assert!(matches!(
            engine.create_test(req).unwrap_err(),
            ReplayError::Validation(_)
        ));

        let mut req = request("U1");
        req.rollback_to = Utc::now() + Duration::hours(1);
        assert!(matches!(
            engine.create_test(req).unwrap_err(),
            ReplayError::Validation(_)
        ));

        let mut req = request("U1");
        req.target_ids = Some(vec![]);
        assert!(matches!(
            engine.create_test(req).unwrap_err(),
            ReplayError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn full_run_completes_and_populates_results_once() {
        let engine = engine_with(Arc::new(EchoPipeline {
            direction: Direction::Up,
            confidence: 0.6,
        }));
        seed_target(&engine, "t1", Direction::Up, Direction::Up);
        seed_target(&engine, "t2", Direction::Down, Direction::Up);

        let test = engine.create_test(request("U1")).unwrap();
        let done = engine.run(&test.id).await.unwrap();
        assert_eq!(done.status, ReplayStatus::Completed);
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());

        let stats = done.results.expect("results written at completion");
        assert_eq!(stats.total_comparisons, 2);
        assert_eq!(stats.completed_comparisons, 2);
        // Replay said Up for both; original t2 said Down.
        assert_eq!(stats.direction_matches, 1);
        assert_eq!(stats.improvements, 1);

        // Rerunning a completed test is rejected, results untouched.
        let err = engine.run(&test.id).await.unwrap_err();
        assert!(matches!(err, ReplayError::InvalidState { .. }));
        assert_eq!(engine.get_results(&test.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pipeline_failure_marks_test_failed_but_restorable() {
        let engine = engine_with(Arc::new(FailingPipeline));
        seed_target(&engine, "t1", Direction::Up, Direction::Up);

        let test = engine.create_test(request("U1")).unwrap();
        let err = engine.run(&test.id).await.unwrap_err();
        assert!(matches!(err, ReplayError::Pipeline(_)));

        let failed = engine.get_test(&test.id).unwrap();
        assert_eq!(failed.status, ReplayStatus::Failed);
        assert!(failed
            .error_message
            .as_deref()
            .unwrap()
            .contains("llm ensemble unavailable"));

        // The rolled-back row comes back via restore.
        let outcome = engine.restore(&test.id).unwrap();
        assert_eq!(outcome.status, ReplayStatus::Restored);
        assert_eq!(outcome.rows_restored, 1);
        assert_eq!(engine.store().list_predictions("U1", false).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overlapping_universe_is_a_precondition_failure() {
        let engine = engine_with(Arc::new(EchoPipeline {
            direction: Direction::Up,
            confidence: 0.6,
        }));
        seed_target(&engine, "t1", Direction::Up, Direction::Up);

        let first = engine.create_test(request("U1")).unwrap();
        let second = engine.create_test(request("U1")).unwrap();

        engine.run(&first.id).await.unwrap();
        // First test is completed but not restored: still non-terminal.
        let err = engine.run(&second.id).await.unwrap_err();
        match err {
            ReplayError::UniverseBusy { universe_id, test_id } => {
                assert_eq!(universe_id, "U1");
                assert_eq!(test_id, first.id);
            }
            other => panic!("expected UniverseBusy, got {}", other),
        }
        // Second test was not touched.
        assert_eq!(
            engine.get_test(&second.id).unwrap().status,
            ReplayStatus::Pending
        );

        // Restoring the first frees the universe.
        engine.restore(&first.id).unwrap();
        engine.run(&second.id).await.unwrap();
    }

    #[tokio::test]
    async fn delete_rejected_while_test_owns_rollback_state() {
        let engine = engine_with(Arc::new(FailingPipeline));
        seed_target(&engine, "t1", Direction::Up, Direction::Up);

        let test = engine.create_test(request("U1")).unwrap();
        let _ = engine.run(&test.id).await;
        assert!(matches!(
            engine.delete_test(&test.id).unwrap_err(),
            ReplayError::InvalidState { .. }
        ));

        engine.restore(&test.id).unwrap();
        engine.delete_test(&test.id).unwrap();
        assert!(matches!(
            engine.get_test(&test.id),
            Err(ReplayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn summary_is_derived_from_result_rows() {
        let engine = engine_with(Arc::new(EchoPipeline {
            direction: Direction::Up,
            confidence: 0.5,
        }));
        seed_target(&engine, "t1", Direction::Up, Direction::Up);

        let test = engine.create_test(request("U1")).unwrap();
        engine.run(&test.id).await.unwrap();

        let summary = engine.get_summary(&test.id).unwrap();
        assert_eq!(summary.stats.total_comparisons, 1);
        assert_eq!(summary.status, ReplayStatus::Completed);

        let org = engine.get_org_summary("org1").unwrap();
        assert_eq!(org.total_comparisons, 1);
        assert_eq!(engine.get_org_summary("org2").unwrap().total_comparisons, 0);
    }

    #[tokio::test]
    async fn empty_universe_completes_with_zero_stats() {
        let engine = engine_with(Arc::new(FailingPipeline));
        let test = engine.create_test(request("U_empty")).unwrap();
        // Pipeline never invoked: no affected targets.
        let done = engine.run(&test.id).await.unwrap();
        assert_eq!(done.status, ReplayStatus::Completed);
        let stats = done.results.unwrap();
        assert_eq!(stats.total_comparisons, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.outcome_match_rate, 0.0);
    }

    #[tokio::test]
    async fn stuck_running_tests_can_be_reconciled() {
        let engine = engine_with(Arc::new(FailingPipeline));
        seed_target(&engine, "t1", Direction::Up, Direction::Up);

        let test = engine.create_test(request("U1")).unwrap();
        // Drive to `running` manually, simulating a crash before replay.
        let located = engine.preview_affected(&test.id).unwrap();
        engine.store().capture_and_mark(&test.id, &located).unwrap();
        engine.store().rollback_and_mark(&test.id).unwrap();

        assert_eq!(engine.fail_stuck_tests(Duration::hours(1)).unwrap(), 0);
        assert_eq!(engine.fail_stuck_tests(Duration::seconds(-1)).unwrap(), 1);

        let failed = engine.get_test(&test.id).unwrap();
        assert_eq!(failed.status, ReplayStatus::Failed);
        let outcome = engine.restore(&test.id).unwrap();
        assert_eq!(outcome.rows_restored, 1);
    }
}
