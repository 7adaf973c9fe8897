//! Foresight Replay
//!
//! Historical replay engine for the prediction pipeline: rewinds the
//! production dataset to a cutoff, reruns the (external) prediction pipeline
//! against that state, compares replayed predictions with what actually
//! happened, and losslessly restores the original rows.
//!
//! The prediction pipeline itself, entity CRUD, and the API/CLI layer live
//! elsewhere; this crate owns snapshot/rollback/restore safety and the
//! comparison statistics.

pub mod models;
pub mod replay;

pub use replay::{ReplayEngine, ReplayError, ReplayStatus, ReplayStore};
