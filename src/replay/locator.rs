//! Affected-Record Locator.
//!
//! Given a rollback depth, cutoff timestamp, universe, and optional target
//! filter, determines which rows of each dependent table were created
//! at/after the cutoff. The actual row selection is delegated to the store
//! as one query per table (never row-by-row timestamp comparisons); this
//! module owns the closed set of affected tables and the depth → table
//! mapping.

use serde::{Deserialize, Serialize};

use crate::replay::error::Result;
use crate::replay::store::ReplayStore;
use crate::replay::types::ReplayTest;

/// How far back in the dependency chain (predictions → predictors →
/// signals) to rewind. A deeper depth implies all shallower dependent
/// tables, since predictions depend on predictors depend on signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackDepth {
    Predictions,
    Predictors,
    Signals,
}

impl RollbackDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackDepth::Predictions => "predictions",
            RollbackDepth::Predictors => "predictors",
            RollbackDepth::Signals => "signals",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "predictions" => Some(RollbackDepth::Predictions),
            "predictors" => Some(RollbackDepth::Predictors),
            "signals" => Some(RollbackDepth::Signals),
            _ => None,
        }
    }

    /// Tables affected at this depth, in deletion order (dependents first).
    /// Restore reinserts captured payloads, so order only matters for
    /// deletion.
    pub fn affected_tables(&self) -> &'static [AffectedTable] {
        match self {
            RollbackDepth::Predictions => {
                &[AffectedTable::AnalystAssessments, AffectedTable::Predictions]
            }
            RollbackDepth::Predictors => &[
                AffectedTable::AnalystAssessments,
                AffectedTable::Predictions,
                AffectedTable::Predictors,
            ],
            RollbackDepth::Signals => &[
                AffectedTable::AnalystAssessments,
                AffectedTable::Predictions,
                AffectedTable::Predictors,
                AffectedTable::Signals,
            ],
        }
    }
}

/// The finite set of tables a rollback can touch. A closed enum, so an
/// unsupported table is a compile-time concern rather than a runtime string
/// mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffectedTable {
    Signals,
    Predictors,
    Predictions,
    AnalystAssessments,
}

impl AffectedTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            AffectedTable::Signals => "signals",
            AffectedTable::Predictors => "predictors",
            AffectedTable::Predictions => "predictions",
            AffectedTable::AnalystAssessments => "analyst_assessments",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signals" => Some(AffectedTable::Signals),
            "predictors" => Some(AffectedTable::Predictors),
            "predictions" => Some(AffectedTable::Predictions),
            "analyst_assessments" => Some(AffectedTable::AnalystAssessments),
            _ => None,
        }
    }
}

/// The rows of one table selected for rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffectedRecordSet {
    pub table: AffectedTable,
    pub record_ids: Vec<String>,
    pub row_count: usize,
}

/// Thin front over the store's `locate_affected_records` primitive.
pub struct RecordLocator<'a> {
    store: &'a ReplayStore,
}

impl<'a> RecordLocator<'a> {
    pub fn new(store: &'a ReplayStore) -> Self {
        Self { store }
    }

    /// Locate every row the given test would roll back. Read-only; safe to
    /// call for previews at any time.
    pub fn locate(&self, test: &ReplayTest) -> Result<Vec<AffectedRecordSet>> {
        self.store.locate_affected_records(
            test.rollback_depth,
            test.rollback_to,
            &test.universe_id,
            test.target_ids.as_deref(),
        )
    }
}
