//! Checkpoint persistence for resumable pipeline runs.
//!
//! One record per stage id, written atomically once the stage body has
//! returned successfully. Records are immutable: a fresh run starts by
//! clearing the store, never by overwriting.

mod record;
mod store;

pub use record::{CheckpointRecord, StageId};
pub use store::{CheckpointStore, FsCheckpointStore, MemoryCheckpointStore};
