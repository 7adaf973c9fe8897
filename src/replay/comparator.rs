//! Comparator.
//!
//! Pairs each original (snapshotted) prediction with its freshly regenerated
//! counterpart per target: direction agreement, confidence delta,
//! correctness against recorded ground truth, and a synthesized directional
//! P&L delta. A target with missing data produces a failed result row and
//! never aborts the rest of the batch.

use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Direction, GroundTruth, Prediction};
use crate::replay::error::Result;
use crate::replay::store::ReplayStore;
use crate::replay::types::{ReplayTest, ReplayTestResult, ResultStatus};

/// Simple directional P&L: gain proportional to the configured size when the
/// prediction matches the realized move, the same loss otherwise.
fn directional_pnl(direction: Direction, truth: &GroundTruth, position_size: f64) -> f64 {
    if direction == truth.actual_direction {
        position_size * truth.realized_move
    } else {
        -position_size * truth.realized_move
    }
}

pub struct Comparator {
    position_size: f64,
}

impl Comparator {
    pub fn new(position_size: f64) -> Self {
        Self { position_size }
    }

    /// Compare one target. Either side may be missing (a data-integrity
    /// problem recorded on the result row, not an error).
    pub fn compare(
        &self,
        test_id: &str,
        target_id: &str,
        original: Option<&Prediction>,
        replay: Option<&Prediction>,
        truth: Option<&GroundTruth>,
    ) -> ReplayTestResult {
        let (original, replay) = match (original, replay) {
            (Some(o), Some(r)) => (o, r),
            (None, _) => {
                warn!(test_id, target_id, "Original prediction missing from snapshot");
                return ReplayTestResult::failed(
                    test_id,
                    target_id,
                    "original prediction missing from snapshot",
                );
            }
            (_, None) => {
                warn!(test_id, target_id, "Replay produced no prediction for target");
                return ReplayTestResult::failed(
                    test_id,
                    target_id,
                    "replay produced no prediction for this target",
                );
            }
        };

        let direction_match = original.direction == replay.direction;
        let confidence_diff = (original.confidence - replay.confidence).abs();

        let (original_correct, replay_correct, original_pnl, replay_pnl) = match truth {
            Some(t) => (
                Some(original.direction == t.actual_direction),
                Some(replay.direction == t.actual_direction),
                directional_pnl(original.direction, t, self.position_size),
                directional_pnl(replay.direction, t, self.position_size),
            ),
            None => (None, None, 0.0, 0.0),
        };
        let improvement = replay_correct.unwrap_or(false) && !original_correct.unwrap_or(true);

        ReplayTestResult {
            id: format!("res_{}", Uuid::new_v4()),
            test_id: test_id.to_string(),
            target_id: target_id.to_string(),
            original_prediction_id: Some(original.id.clone()),
            replay_prediction_id: Some(replay.id.clone()),
            original_direction: Some(original.direction),
            replay_direction: Some(replay.direction),
            original_confidence: Some(original.confidence),
            replay_confidence: Some(replay.confidence),
            original_magnitude: Some(original.magnitude),
            replay_magnitude: Some(replay.magnitude),
            original_predicted_at: Some(original.predicted_at),
            replay_predicted_at: Some(replay.predicted_at),
            direction_match,
            confidence_diff,
            evaluation_id: truth.map(|t| t.id.clone()),
            actual_outcome: truth.map(|t| t.actual_direction),
            original_correct,
            replay_correct,
            improvement,
            original_pnl,
            replay_pnl,
            pnl_delta: replay_pnl - original_pnl,
            status: ResultStatus::Completed,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Compare every target of a test: originals from the snapshot payload
    /// (they are gone from the live tables), replays from the tagged rows.
    pub fn compare_test(&self, store: &ReplayStore, test: &ReplayTest) -> Result<Vec<ReplayTestResult>> {
        let originals = original_predictions_from_snapshot(store, &test.id)?;
        let replays: BTreeMap<String, Prediction> = store
            .get_replay_predictions(&test.id)?
            .into_iter()
            .map(|p| (p.target_id.clone(), p))
            .collect();

        // Union of targets on either side, so a target that lost its
        // original or gained no replay still gets a (failed) row.
        let mut targets: Vec<&String> = originals.keys().chain(replays.keys()).collect();
        targets.sort();
        targets.dedup();

        let mut results = Vec::with_capacity(targets.len());
        for target_id in targets {
            let truth = store.get_ground_truth(target_id)?;
            results.push(self.compare(
                &test.id,
                target_id,
                originals.get(target_id),
                replays.get(target_id),
                truth.as_ref(),
            ));
        }
        debug!(
            test_id = %test.id,
            stage = "compare",
            results = results.len(),
            "Compared original vs replay predictions"
        );
        Ok(results)
    }
}

/// Parse the original predictions back out of the snapshot's opaque row
/// payloads.
fn original_predictions_from_snapshot(
    store: &ReplayStore,
    test_id: &str,
) -> Result<BTreeMap<String, Prediction>> {
    use crate::replay::locator::AffectedTable;

    let mut originals = BTreeMap::new();
    for snapshot in store.get_snapshots(test_id)? {
        if snapshot.table != AffectedTable::Predictions {
            continue;
        }
        for row in &snapshot.rows {
            let prediction: Prediction =
                serde_json::from_value(serde_json::Value::Object(row.clone()))?;
            originals.insert(prediction.target_id.clone(), prediction);
        }
    }
    Ok(originals)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn truth(direction: Direction, realized_move: f64) -> GroundTruth {
        GroundTruth::new("t1", direction, realized_move)
    }

    #[test]
    fn matching_directions_and_correctness() {
        let original = Prediction::new("t1", "U1", Direction::Up, 0.8, 0.02);
        let replay = Prediction::new("t1", "U1", Direction::Up, 0.6, 0.02);
        let t = truth(Direction::Up, 0.05);

        let result = Comparator::new(100.0).compare(
            "rt_1",
            "t1",
            Some(&original),
            Some(&replay),
            Some(&t),
        );
        assert_eq!(result.status, ResultStatus::Completed);
        assert!(result.direction_match);
        assert!((result.confidence_diff - 0.2).abs() < 1e-9);
        assert_eq!(result.original_correct, Some(true));
        assert_eq!(result.replay_correct, Some(true));
        assert!(!result.improvement);
        assert!((result.original_pnl - 5.0).abs() < 1e-9);
        assert!((result.replay_pnl - 5.0).abs() < 1e-9);
        assert!(result.pnl_delta.abs() < 1e-9);
    }

    #[test]
    fn improvement_flag_requires_replay_right_original_wrong() {
        let original = Prediction::new("t1", "U1", Direction::Down, 0.8, 0.02);
        let replay = Prediction::new("t1", "U1", Direction::Up, 0.7, 0.02);
        let t = truth(Direction::Up, 0.04);

        let result = Comparator::new(100.0).compare(
            "rt_1",
            "t1",
            Some(&original),
            Some(&replay),
            Some(&t),
        );
        assert!(!result.direction_match);
        assert_eq!(result.original_correct, Some(false));
        assert_eq!(result.replay_correct, Some(true));
        assert!(result.improvement);
        assert!((result.original_pnl + 4.0).abs() < 1e-9);
        assert!((result.replay_pnl - 4.0).abs() < 1e-9);
        assert!((result.pnl_delta - 8.0).abs() < 1e-9);
    }

    #[test]
    fn missing_ground_truth_leaves_correctness_unknown() {
        let original = Prediction::new("t1", "U1", Direction::Up, 0.8, 0.02);
        let replay = Prediction::new("t1", "U1", Direction::Up, 0.8, 0.02);

        let result =
            Comparator::new(100.0).compare("rt_1", "t1", Some(&original), Some(&replay), None);
        assert_eq!(result.status, ResultStatus::Completed);
        assert_eq!(result.original_correct, None);
        assert_eq!(result.replay_correct, None);
        assert!(!result.improvement);
        assert_eq!(result.original_pnl, 0.0);
        assert_eq!(result.replay_pnl, 0.0);
    }

    #[test]
    fn missing_sides_become_failed_rows() {
        let p = Prediction::new("t1", "U1", Direction::Up, 0.8, 0.02);
        let comparator = Comparator::new(100.0);

        let no_original = comparator.compare("rt_1", "t1", None, Some(&p), None);
        assert_eq!(no_original.status, ResultStatus::Failed);
        assert!(no_original.error.as_deref().unwrap().contains("original"));

        let no_replay = comparator.compare("rt_1", "t1", Some(&p), None, None);
        assert_eq!(no_replay.status, ResultStatus::Failed);
        assert!(no_replay.error.as_deref().unwrap().contains("replay"));
    }
}
