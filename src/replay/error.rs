//! Error taxonomy for the replay engine.
//!
//! Validation errors are rejected before any state mutation. Not-found is a
//! distinct condition, never folded into a generic failure. Store errors are
//! fatal to the current stage and recorded on the test. Pipeline errors come
//! back verbatim from the external prediction pipeline.

use crate::replay::lifecycle::ReplayStatus;

pub type Result<T> = std::result::Result<T, ReplayError>;

#[derive(Debug)]
pub enum ReplayError {
    /// Bad input (unknown rollback depth, missing universe, malformed
    /// cutoff). Raised before anything is written.
    Validation(String),
    /// Unknown test or snapshot id.
    NotFound(String),
    /// A stage was invoked against a test that is not in the state it
    /// requires.
    InvalidState {
        test_id: String,
        expected: &'static str,
        actual: ReplayStatus,
    },
    /// Another non-terminal test already owns this universe's rollback
    /// window.
    UniverseBusy {
        universe_id: String,
        test_id: String,
    },
    /// Persisted state that should be well-formed failed to parse.
    Corrupted(String),
    /// Underlying SQLite failure.
    Store(rusqlite::Error),
    /// Payload (de)serialization failure.
    Serialization(serde_json::Error),
    /// The external prediction pipeline failed; message recorded verbatim.
    Pipeline(String),
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation error: {}", msg),
            Self::NotFound(what) => write!(f, "not found: {}", what),
            Self::InvalidState {
                test_id,
                expected,
                actual,
            } => write!(
                f,
                "test {} is in state '{}', expected {}",
                test_id,
                actual.as_str(),
                expected
            ),
            Self::UniverseBusy {
                universe_id,
                test_id,
            } => write!(
                f,
                "universe {} already has non-terminal replay test {}",
                universe_id, test_id
            ),
            Self::Corrupted(msg) => write!(f, "corrupted stored state: {}", msg),
            Self::Store(e) => write!(f, "store error: {}", e),
            Self::Serialization(e) => write!(f, "serialization error: {}", e),
            Self::Pipeline(msg) => write!(f, "prediction pipeline error: {}", msg),
        }
    }
}

impl std::error::Error for ReplayError {}

impl From<rusqlite::Error> for ReplayError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e)
    }
}

impl From<serde_json::Error> for ReplayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

impl ReplayError {
    /// Whether this error should flip the owning test to `failed`.
    /// Precondition-style rejections leave the test untouched.
    pub fn is_fatal_to_test(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_)
                | Self::NotFound(_)
                | Self::InvalidState { .. }
                | Self::UniverseBusy { .. }
        )
    }
}
