//! End-to-end replay scenario against an in-memory store.
//!
//! Seeds three production predictions created after the cutoff, runs the
//! full capture → rollback → replay → compare → aggregate sequence with a
//! stub pipeline, then restores and verifies the dataset is back to its
//! pre-replay state.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use foresight_replay::models::{Direction, GroundTruth, Prediction};
use foresight_replay::replay::{
    AffectedTable, CreateTestRequest, PredictionPipeline, ReplayContext, ReplayEngine,
    ReplayStatus, ReplayStore, Result, RollbackDepth,
};

struct ContrarianPipeline;

#[async_trait]
impl PredictionPipeline for ContrarianPipeline {
    async fn generate_predictions(&self, ctx: &ReplayContext) -> Result<Vec<Prediction>> {
        // Always predicts Up with lower confidence than the originals.
        Ok(ctx
            .target_ids
            .iter()
            .map(|t| Prediction::new(t.clone(), ctx.universe_id.clone(), Direction::Up, 0.55, 0.02))
            .collect())
    }
}

fn cutoff() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn seed(store: &ReplayStore) -> Vec<Prediction> {
    let after = cutoff() + Duration::days(1);
    let originals = vec![
        Prediction::new("t1", "U1", Direction::Up, 0.9, 0.03).with_timestamps(after, after),
        Prediction::new("t2", "U1", Direction::Down, 0.7, 0.02).with_timestamps(after, after),
        Prediction::new("t3", "U1", Direction::Down, 0.8, 0.01).with_timestamps(after, after),
    ];
    for p in &originals {
        store.insert_prediction(p).unwrap();
    }
    store
        .upsert_ground_truth(&GroundTruth::new("t1", Direction::Up, 0.03))
        .unwrap();
    store
        .upsert_ground_truth(&GroundTruth::new("t2", Direction::Up, 0.02))
        .unwrap();
    store
        .upsert_ground_truth(&GroundTruth::new("t3", Direction::Down, 0.01))
        .unwrap();
    originals
}

#[tokio::test]
async fn replay_round_trip_scenario() {
    let store = Arc::new(ReplayStore::in_memory().unwrap());
    let originals = seed(&store);
    let engine = ReplayEngine::new(store.clone(), Arc::new(ContrarianPipeline));

    let test = engine
        .create_test(CreateTestRequest {
            org_id: "org1".into(),
            name: "2024 rewind".into(),
            description: Some("replay the first January batch".into()),
            rollback_depth: RollbackDepth::Predictions,
            rollback_to: cutoff(),
            universe_id: "U1".into(),
            target_ids: None,
            config: None,
        })
        .unwrap();
    assert_eq!(test.status, ReplayStatus::Pending);

    // Locator preview finds the 3 future predictions.
    let preview = engine.preview_affected(&test.id).unwrap();
    let located = preview
        .iter()
        .find(|s| s.table == AffectedTable::Predictions)
        .unwrap();
    assert_eq!(located.row_count, 3);

    let done = engine.run(&test.id).await.unwrap();
    assert_eq!(done.status, ReplayStatus::Completed);

    // Comparator emitted one row per target; aggregator counted them.
    let results = engine.get_results(&test.id).unwrap();
    assert_eq!(results.len(), 3);
    let stats = done.results.unwrap();
    assert_eq!(stats.total_comparisons, 3);
    assert_eq!(stats.completed_comparisons, 3);
    // Replay always says Up: matches t1 only.
    assert_eq!(stats.direction_matches, 1);
    // t2's original (Down) was wrong, replay (Up) is right.
    assert_eq!(stats.improvements, 1);
    // One direction match over three comparisons.
    assert!((stats.success_rate - 1.0 / 3.0).abs() < 1e-9);
    assert!((stats.outcome_match_rate - 1.0 / 3.0).abs() < 1e-9);

    // While completed (not yet restored), production reads see no originals
    // and no replay output.
    assert!(store.list_predictions("U1", false).unwrap().is_empty());
    let replayed = store.get_replay_predictions(&test.id).unwrap();
    assert_eq!(replayed.len(), 3);

    // Restore brings back exactly the original rows.
    let outcome = engine.restore(&test.id).unwrap();
    assert_eq!(outcome.status, ReplayStatus::Restored);
    assert_eq!(outcome.rows_restored, 3);

    let mut production = store.list_predictions("U1", false).unwrap();
    production.sort_by(|a, b| a.id.cmp(&b.id));
    let mut expected = originals.clone();
    expected.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(production.len(), 3);
    for (got, want) in production.iter().zip(&expected) {
        assert_eq!(got.id, want.id);
        assert_eq!(got.direction, want.direction);
        assert_eq!(got.confidence, want.confidence);
        assert_eq!(got.predicted_at, want.predicted_at);
        assert_eq!(got.created_at, want.created_at);
        assert!(got.replay_test_id.is_none());
    }

    // A fresh locate against the same parameters finds the 3 rows again.
    let relocated = engine.preview_affected(&test.id).unwrap();
    let predictions = relocated
        .iter()
        .find(|s| s.table == AffectedTable::Predictions)
        .unwrap();
    assert_eq!(predictions.row_count, 3);

    // Restore is idempotent.
    let again = engine.restore(&test.id).unwrap();
    assert!(again.already_restored);
    assert_eq!(again.rows_restored, 0);

    // Cleanup purges replay-tagged output; a second cleanup is a no-op.
    let cleaned = engine.cleanup(&test.id).unwrap();
    assert_eq!(cleaned.replay_predictions_deleted, 3);
    assert!(store.get_replay_predictions(&test.id).unwrap().is_empty());
    let cleaned_again = engine.cleanup(&test.id).unwrap();
    assert_eq!(cleaned_again.replay_predictions_deleted, 0);
    assert_eq!(store.list_predictions("U1", false).unwrap().len(), 3);
}

#[tokio::test]
async fn deeper_depth_rolls_back_the_whole_dependency_chain() {
    use foresight_replay::models::{AnalystAssessment, PredictorRecord, SignalRecord};

    let store = Arc::new(ReplayStore::in_memory().unwrap());
    let after = cutoff() + Duration::days(1);

    let mut signal = SignalRecord::new("t1", "U1", "volume_spike", 0.9);
    signal.created_at = after;
    store.insert_signal(&signal).unwrap();
    let mut predictor = PredictorRecord::new("t1", "U1", "momentum", 0.7);
    predictor.created_at = after;
    store.insert_predictor(&predictor).unwrap();
    let mut assessment = AnalystAssessment::new("t1", "U1", "macro_analyst", Direction::Up, 0.8);
    assessment.created_at = after;
    store.insert_assessment(&assessment).unwrap();
    store
        .insert_prediction(
            &Prediction::new("t1", "U1", Direction::Up, 0.8, 0.02).with_timestamps(after, after),
        )
        .unwrap();

    let engine = ReplayEngine::new(store.clone(), Arc::new(ContrarianPipeline));
    let test = engine
        .create_test(CreateTestRequest {
            org_id: "org1".into(),
            name: "deep rewind".into(),
            description: None,
            rollback_depth: RollbackDepth::Signals,
            rollback_to: cutoff(),
            universe_id: "U1".into(),
            target_ids: None,
            config: None,
        })
        .unwrap();

    let preview = engine.preview_affected(&test.id).unwrap();
    assert_eq!(preview.len(), 4);
    assert!(preview.iter().all(|s| s.row_count == 1));

    engine.run(&test.id).await.unwrap();
    for table in [
        AffectedTable::Signals,
        AffectedTable::Predictors,
        AffectedTable::AnalystAssessments,
    ] {
        assert_eq!(store.count_rows(table).unwrap(), 0, "{:?}", table);
    }

    let outcome = engine.restore(&test.id).unwrap();
    assert_eq!(outcome.rows_restored, 4);
    // Drop the replay-tagged prediction so raw row counts mean "production".
    engine.cleanup(&test.id).unwrap();
    for table in [
        AffectedTable::Signals,
        AffectedTable::Predictors,
        AffectedTable::AnalystAssessments,
        AffectedTable::Predictions,
    ] {
        assert_eq!(store.count_rows(table).unwrap(), 1, "{:?}", table);
    }
}

#[tokio::test]
async fn on_disk_store_survives_reopen_between_run_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replay.db");

    let test_id = {
        let store = Arc::new(ReplayStore::new(&path).unwrap());
        seed(&store);
        let engine = ReplayEngine::new(store, Arc::new(ContrarianPipeline));
        let test = engine
            .create_test(CreateTestRequest {
                org_id: "org1".into(),
                name: "durable rewind".into(),
                description: None,
                rollback_depth: RollbackDepth::Predictions,
                rollback_to: cutoff(),
                universe_id: "U1".into(),
                target_ids: None,
                config: None,
            })
            .unwrap();
        engine.run(&test.id).await.unwrap();
        test.id
    };

    // Reopen and restore with a fresh engine: snapshots are durable.
    let store = Arc::new(ReplayStore::new(&path).unwrap());
    let engine = ReplayEngine::new(store.clone(), Arc::new(ContrarianPipeline));
    assert_eq!(
        engine.get_test(&test_id).unwrap().status,
        ReplayStatus::Completed
    );
    let outcome = engine.restore(&test_id).unwrap();
    assert_eq!(outcome.rows_restored, 3);
    assert_eq!(store.list_predictions("U1", false).unwrap().len(), 3);
}
