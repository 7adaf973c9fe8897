//! Aggregator.
//!
//! Rolls individual comparison rows into summary statistics for a test (and
//! across an organization). Every rate is zero-division-safe: an empty or
//! all-failed result set yields 0.0, never NaN.

use serde::{Deserialize, Serialize};

use crate::replay::types::{ReplayTestResult, ResultStatus};

/// Aggregate statistics over a set of comparison rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaySummaryStats {
    pub total_comparisons: usize,
    pub completed_comparisons: usize,
    pub failed_comparisons: usize,
    pub direction_matches: usize,
    /// Direction matches / all comparisons (failed and running rows count
    /// against it).
    pub success_rate: f64,
    /// direction matches / completed (0 when nothing completed).
    pub outcome_match_rate: f64,
    pub original_correct: usize,
    pub replay_correct: usize,
    /// Correct originals over completed rows with known ground truth.
    pub original_accuracy: f64,
    pub replay_accuracy: f64,
    pub accuracy_delta: f64,
    pub improvements: usize,
    pub original_pnl_total: f64,
    pub replay_pnl_total: f64,
    pub pnl_delta_total: f64,
    pub avg_confidence_diff: f64,
}

fn rate(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Summarize comparison rows. `success_rate` is judged against every row, so
/// failed and still-running comparisons drag it down; the per-completed rates
/// ignore them, and accuracy additionally requires known ground truth.
pub fn aggregate(results: &[ReplayTestResult]) -> ReplaySummaryStats {
    let total = results.len();
    let completed: Vec<&ReplayTestResult> = results
        .iter()
        .filter(|r| r.status == ResultStatus::Completed)
        .collect();
    let failed = results
        .iter()
        .filter(|r| r.status == ResultStatus::Failed)
        .count();

    let direction_matches = completed.iter().filter(|r| r.direction_match).count();
    let with_truth = completed
        .iter()
        .filter(|r| r.original_correct.is_some())
        .count();
    let original_correct = completed
        .iter()
        .filter(|r| r.original_correct == Some(true))
        .count();
    let replay_correct = completed
        .iter()
        .filter(|r| r.replay_correct == Some(true))
        .count();
    let improvements = completed.iter().filter(|r| r.improvement).count();

    let original_accuracy = rate(original_correct, with_truth);
    let replay_accuracy = rate(replay_correct, with_truth);

    let confidence_diff_sum: f64 = completed.iter().map(|r| r.confidence_diff).sum();
    let avg_confidence_diff = if completed.is_empty() {
        0.0
    } else {
        confidence_diff_sum / completed.len() as f64
    };

    ReplaySummaryStats {
        total_comparisons: total,
        completed_comparisons: completed.len(),
        failed_comparisons: failed,
        direction_matches,
        success_rate: rate(direction_matches, total),
        outcome_match_rate: rate(direction_matches, completed.len()),
        original_correct,
        replay_correct,
        original_accuracy,
        replay_accuracy,
        accuracy_delta: replay_accuracy - original_accuracy,
        improvements,
        original_pnl_total: results.iter().map(|r| r.original_pnl).sum(),
        replay_pnl_total: results.iter().map(|r| r.replay_pnl).sum(),
        pnl_delta_total: results.iter().map(|r| r.pnl_delta).sum(),
        avg_confidence_diff,
    }
}
