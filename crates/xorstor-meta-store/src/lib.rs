//! Xorstor Metadata Store - durable placement records and run state
//!
//! Every node keeps a full replica of the path to placement map in a local
//! redb database. The slot table that maps physical targets to process
//! ranks is persisted separately as the run-state file.

pub mod run_state;
pub mod store;
pub mod tables;

// Re-exports
pub use run_state::{ReportedTarget, RunState};
pub use store::{MetaStoreError, MetaStoreResult, PlacementStore, FORMAT_VERSION};
