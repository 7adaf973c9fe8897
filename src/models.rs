use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Predicted (or realized) direction of a target's move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Direction::Up),
            "down" => Some(Direction::Down),
            _ => None,
        }
    }
}

/// A prediction emitted by the analyst ensemble for a single target.
///
/// Predictions produced during a historical replay carry `replay_test_id`
/// so production-facing reads can exclude them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub target_id: String,
    pub universe_id: String,
    pub direction: Direction,
    pub confidence: f64,
    pub magnitude: f64,
    pub predicted_at: DateTime<Utc>,
    pub replay_test_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Prediction {
    pub fn new(
        target_id: impl Into<String>,
        universe_id: impl Into<String>,
        direction: Direction,
        confidence: f64,
        magnitude: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("pred_{}", Uuid::new_v4()),
            target_id: target_id.into(),
            universe_id: universe_id.into(),
            direction,
            confidence,
            magnitude,
            predicted_at: now,
            replay_test_id: None,
            created_at: now,
        }
    }

    pub fn with_replay_tag(mut self, test_id: impl Into<String>) -> Self {
        self.replay_test_id = Some(test_id.into());
        self
    }

    pub fn with_timestamps(
        mut self,
        predicted_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        self.predicted_at = predicted_at;
        self.created_at = created_at;
        self
    }
}

/// A raw market/event signal, the deepest tier of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: String,
    pub target_id: String,
    pub universe_id: String,
    pub signal_type: String,
    pub strength: f64,
    pub created_at: DateTime<Utc>,
}

impl SignalRecord {
    pub fn new(
        target_id: impl Into<String>,
        universe_id: impl Into<String>,
        signal_type: impl Into<String>,
        strength: f64,
    ) -> Self {
        Self {
            id: format!("sig_{}", Uuid::new_v4()),
            target_id: target_id.into(),
            universe_id: universe_id.into(),
            signal_type: signal_type.into(),
            strength,
            created_at: Utc::now(),
        }
    }
}

/// An intermediate predictor derived from signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorRecord {
    pub id: String,
    pub target_id: String,
    pub universe_id: String,
    pub name: String,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

impl PredictorRecord {
    pub fn new(
        target_id: impl Into<String>,
        universe_id: impl Into<String>,
        name: impl Into<String>,
        score: f64,
    ) -> Self {
        Self {
            id: format!("pdr_{}", Uuid::new_v4()),
            target_id: target_id.into(),
            universe_id: universe_id.into(),
            name: name.into(),
            score,
            created_at: Utc::now(),
        }
    }
}

/// A single analyst's scored view of a target, feeding the ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalystAssessment {
    pub id: String,
    pub target_id: String,
    pub universe_id: String,
    pub analyst: String,
    pub direction: Direction,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl AnalystAssessment {
    pub fn new(
        target_id: impl Into<String>,
        universe_id: impl Into<String>,
        analyst: impl Into<String>,
        direction: Direction,
        confidence: f64,
    ) -> Self {
        Self {
            id: format!("ana_{}", Uuid::new_v4()),
            target_id: target_id.into(),
            universe_id: universe_id.into(),
            analyst: analyst.into(),
            direction,
            confidence,
            created_at: Utc::now(),
        }
    }
}

/// Recorded ground truth for a target: what actually happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruth {
    pub id: String,
    pub target_id: String,
    pub actual_direction: Direction,
    /// Magnitude of the realized move, as an absolute fraction (e.g. 0.034).
    pub realized_move: f64,
    pub evaluated_at: DateTime<Utc>,
}

impl GroundTruth {
    pub fn new(
        target_id: impl Into<String>,
        actual_direction: Direction,
        realized_move: f64,
    ) -> Self {
        Self {
            id: format!("gt_{}", Uuid::new_v4()),
            target_id: target_id.into(),
            actual_direction,
            realized_move: realized_move.abs(),
            evaluated_at: Utc::now(),
        }
    }
}
