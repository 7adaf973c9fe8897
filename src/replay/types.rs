//! Persisted replay entities.
//!
//! `ReplayTest` owns one rollback operation. Snapshots are created only
//! during capture and read only during restore; their row payloads are
//! opaque JSON maps preserved verbatim. Results are one row per compared
//! target. The summary is a derived, read-only aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::Direction;
use crate::replay::aggregator::ReplaySummaryStats;
use crate::replay::lifecycle::ReplayStatus;
use crate::replay::locator::{AffectedTable, RollbackDepth};

/// Free-form execution config carried by a test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Position size for the directional P&L model.
    #[serde(default = "default_position_size")]
    pub position_size: f64,
    /// Anything else the caller wants to stash on the test.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

fn default_position_size() -> f64 {
    100.0
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            position_size: default_position_size(),
            extra: Map::new(),
        }
    }
}

/// One historical replay test: identity, rollback parameters, lifecycle
/// status, and (once completed) aggregate results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayTest {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub description: Option<String>,
    pub rollback_depth: RollbackDepth,
    /// Cutoff: records created at/after this instant are "future" and get
    /// rolled back.
    pub rollback_to: DateTime<Utc>,
    pub universe_id: String,
    /// Optional explicit target filter; `None` means the whole universe.
    pub target_ids: Option<Vec<String>>,
    pub config: ReplayConfig,
    pub status: ReplayStatus,
    /// Written exactly once, at the `completed` transition.
    pub results: Option<ReplaySummaryStats>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReplayTest {
    pub fn new(
        org_id: impl Into<String>,
        name: impl Into<String>,
        rollback_depth: RollbackDepth,
        rollback_to: DateTime<Utc>,
        universe_id: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("rt_{}", Uuid::new_v4()),
            org_id: org_id.into(),
            name: name.into(),
            description: None,
            rollback_depth,
            rollback_to,
            universe_id: universe_id.into(),
            target_ids: None,
            config: ReplayConfig::default(),
            status: ReplayStatus::Pending,
            results: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_target_ids(mut self, target_ids: Vec<String>) -> Self {
        self.target_ids = Some(target_ids);
        self
    }

    pub fn with_config(mut self, config: ReplayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Captured rows for one affected table of one test.
///
/// `rows` are the full payloads exactly as read from the live table, one
/// JSON map per row; `record_ids` are the original primary keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayTestSnapshot {
    pub id: String,
    pub test_id: String,
    pub table: AffectedTable,
    pub rows: Vec<Map<String, Value>>,
    pub record_ids: Vec<String>,
    pub row_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Per-result completion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
    Running,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Completed => "completed",
            ResultStatus::Failed => "failed",
            ResultStatus::Running => "running",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(ResultStatus::Completed),
            "failed" => Some(ResultStatus::Failed),
            "running" => Some(ResultStatus::Running),
            _ => None,
        }
    }
}

/// One compared target: the snapshotted original prediction vs the freshly
/// regenerated replay prediction, judged against recorded ground truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayTestResult {
    pub id: String,
    pub test_id: String,
    pub target_id: String,
    pub original_prediction_id: Option<String>,
    pub replay_prediction_id: Option<String>,
    pub original_direction: Option<Direction>,
    pub replay_direction: Option<Direction>,
    pub original_confidence: Option<f64>,
    pub replay_confidence: Option<f64>,
    pub original_magnitude: Option<f64>,
    pub replay_magnitude: Option<f64>,
    pub original_predicted_at: Option<DateTime<Utc>>,
    pub replay_predicted_at: Option<DateTime<Utc>>,
    pub direction_match: bool,
    pub confidence_diff: f64,
    /// Ground-truth evaluation this comparison was judged against.
    pub evaluation_id: Option<String>,
    pub actual_outcome: Option<Direction>,
    pub original_correct: Option<bool>,
    pub replay_correct: Option<bool>,
    /// Replay got it right where the original did not.
    pub improvement: bool,
    pub original_pnl: f64,
    pub replay_pnl: f64,
    pub pnl_delta: f64,
    pub status: ResultStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ReplayTestResult {
    /// A result row recording a per-target data-integrity problem without
    /// poisoning the rest of the batch.
    pub fn failed(
        test_id: impl Into<String>,
        target_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("res_{}", Uuid::new_v4()),
            test_id: test_id.into(),
            target_id: target_id.into(),
            original_prediction_id: None,
            replay_prediction_id: None,
            original_direction: None,
            replay_direction: None,
            original_confidence: None,
            replay_confidence: None,
            original_magnitude: None,
            replay_magnitude: None,
            original_predicted_at: None,
            replay_predicted_at: None,
            direction_match: false,
            confidence_diff: 0.0,
            evaluation_id: None,
            actual_outcome: None,
            original_correct: None,
            replay_correct: None,
            improvement: false,
            original_pnl: 0.0,
            replay_pnl: 0.0,
            pnl_delta: 0.0,
            status: ResultStatus::Failed,
            error: Some(error.into()),
            created_at: Utc::now(),
        }
    }
}

/// Read-only aggregate view of a test joined with statistics computed from
/// its result rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayTestSummary {
    pub test_id: String,
    pub org_id: String,
    pub name: String,
    pub status: ReplayStatus,
    pub rollback_depth: RollbackDepth,
    pub rollback_to: DateTime<Utc>,
    pub universe_id: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: ReplaySummaryStats,
}
