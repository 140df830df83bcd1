//! Persistence for runs, threads and checkpoints.

pub mod checkpoint;
pub mod providers;
pub mod runs;

pub use checkpoint::{CheckpointStore, MemoryCheckpointStore};
pub use runs::{Admission, CancelOutcome, MemoryRunStore, NewRun, QueueStats, RunStore};
