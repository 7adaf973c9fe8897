//! Replay Driver.
//!
//! Triggers the external prediction pipeline against the now-rolled-back
//! historical state and persists its output tagged with the test id, so
//! production-facing reads never see replay predictions. The pipeline is an
//! external collaborator; its failures are recorded verbatim and fail the
//! test, but prior snapshot/rollback work stays valid for restore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::models::Prediction;
use crate::replay::error::{ReplayError, Result};
use crate::replay::store::ReplayStore;
use crate::replay::types::ReplayTest;

/// What the pipeline gets to see: the test identity and the historical
/// vantage point it must predict from.
#[derive(Debug, Clone)]
pub struct ReplayContext {
    pub test_id: String,
    pub universe_id: String,
    /// The pipeline must behave as if "now" were this instant.
    pub as_of: DateTime<Utc>,
    /// Targets whose original predictions were rolled back.
    pub target_ids: Vec<String>,
}

/// Seam to the external prediction pipeline (signal ingestion, analyst
/// ensemble, threshold evaluation). Out of scope for this crate beyond the
/// interface.
#[async_trait]
pub trait PredictionPipeline: Send + Sync {
    /// Generate fresh predictions for the given targets against the current
    /// (historical) dataset state. Implementations report failures through
    /// `ReplayError::Pipeline`.
    async fn generate_predictions(&self, ctx: &ReplayContext) -> Result<Vec<Prediction>>;
}

pub struct ReplayDriver<'a> {
    store: &'a ReplayStore,
    pipeline: &'a dyn PredictionPipeline,
}

impl<'a> ReplayDriver<'a> {
    pub fn new(store: &'a ReplayStore, pipeline: &'a dyn PredictionPipeline) -> Self {
        Self { store, pipeline }
    }

    /// Run the pipeline for the affected targets and persist every produced
    /// prediction tagged with this test's id. The test must be `running`
    /// (rollback already happened). Returns the number of predictions
    /// persisted.
    pub async fn replay(&self, test: &ReplayTest, target_ids: Vec<String>) -> Result<usize> {
        if target_ids.is_empty() {
            debug!(test_id = %test.id, stage = "replay", "No affected targets, skipping pipeline");
            return Ok(0);
        }

        let ctx = ReplayContext {
            test_id: test.id.clone(),
            universe_id: test.universe_id.clone(),
            as_of: test.rollback_to,
            target_ids,
        };

        debug!(
            test_id = %test.id,
            stage = "replay",
            targets = ctx.target_ids.len(),
            "Invoking prediction pipeline against historical state"
        );
        let predictions = self.pipeline.generate_predictions(&ctx).await?;

        let tagged: Vec<Prediction> = predictions
            .into_iter()
            .map(|p| {
                if p.universe_id != test.universe_id {
                    return Err(ReplayError::Pipeline(format!(
                        "pipeline produced prediction for universe {} during replay of {}",
                        p.universe_id, test.universe_id
                    )));
                }
                Ok(p.with_replay_tag(&test.id))
            })
            .collect::<Result<_>>()?;

        self.store.insert_replay_predictions(&tagged)?;
        info!(
            test_id = %test.id,
            stage = "replay",
            predictions = tagged.len(),
            "Persisted replay-tagged predictions"
        );
        Ok(tagged.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use crate::replay::locator::RollbackDepth;
    use parking_lot::Mutex;

    struct ScriptedPipeline {
        predictions: Mutex<Vec<Prediction>>,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl PredictionPipeline for ScriptedPipeline {
        async fn generate_predictions(&self, _ctx: &ReplayContext) -> Result<Vec<Prediction>> {
            if let Some(msg) = &self.fail_with {
                return Err(ReplayError::Pipeline(msg.clone()));
            }
            Ok(self.predictions.lock().drain(..).collect())
        }
    }

    fn make_test() -> ReplayTest {
        ReplayTest::new(
            "org1",
            "drv",
            RollbackDepth::Predictions,
            Utc::now(),
            "U1",
        )
    }

    #[tokio::test]
    async fn replay_tags_and_persists_pipeline_output() {
        let store = ReplayStore::in_memory().unwrap();
        let test = make_test();
        let pipeline = ScriptedPipeline {
            predictions: Mutex::new(vec![
                Prediction::new("t1", "U1", Direction::Up, 0.7, 0.02),
                Prediction::new("t2", "U1", Direction::Down, 0.6, 0.01),
            ]),
            fail_with: None,
        };

        let driver = ReplayDriver::new(&store, &pipeline);
        let n = driver
            .replay(&test, vec!["t1".into(), "t2".into()])
            .await
            .unwrap();
        assert_eq!(n, 2);

        let replayed = store.get_replay_predictions(&test.id).unwrap();
        assert_eq!(replayed.len(), 2);
        assert!(replayed
            .iter()
            .all(|p| p.replay_test_id.as_deref() == Some(test.id.as_str())));

        // Production reads exclude the tagged rows.
        assert!(store.list_predictions("U1", false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn pipeline_failure_comes_back_verbatim() {
        let store = ReplayStore::in_memory().unwrap();
        let test = make_test();
        let pipeline = ScriptedPipeline {
            predictions: Mutex::new(vec![]),
            fail_with: Some("ensemble scoring timed out".to_string()),
        };

        let driver = ReplayDriver::new(&store, &pipeline);
        let err = driver.replay(&test, vec!["t1".into()]).await.unwrap_err();
        match err {
            ReplayError::Pipeline(msg) => assert_eq!(msg, "ensemble scoring timed out"),
            other => panic!("expected pipeline error, got {}", other),
        }
        assert!(store.get_replay_predictions(&test.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_targets_skips_the_pipeline() {
        let store = ReplayStore::in_memory().unwrap();
        let test = make_test();
        let pipeline = ScriptedPipeline {
            predictions: Mutex::new(vec![]),
            fail_with: Some("must not be called".to_string()),
        };

        let driver = ReplayDriver::new(&store, &pipeline);
        assert_eq!(driver.replay(&test, vec![]).await.unwrap(), 0);
    }
}
