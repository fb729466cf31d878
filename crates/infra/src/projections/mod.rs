//! Read-model projections: the engine and replay tooling.
//!
//! Read models are:
//! - **Rebuildable**: derived from entity snapshots, never authoritative
//! - **Idempotent**: projecting the same entity state twice yields the same record value

pub mod engine;
pub mod replay;

pub use engine::{
    EntityRefresh, ProjectionEngine, ProjectionError, ProjectionFailure, ProjectionOutcome, join_key_values,
    snapshot_and_update_read_models,
};
pub use replay::{ReplayError, ReplayHandle, ReplayPhase, ReplayProgress, replay_entities, replay_entity};
