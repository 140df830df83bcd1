//! Core records shared by the stores, the worker and the HTTP surface.

pub mod assistant;
pub mod checkpoint;
pub mod message;
pub mod run;
pub mod stream;
pub mod thread;

/// Free-form key/value bag attached to runs, threads and checkpoints.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub use assistant::Assistant;
pub use checkpoint::{Checkpoint, CheckpointTask, TaskResult};
pub use message::ChatMessage;
pub use run::{
    CancelAction, IfNotExists, MultitaskStrategy, OnCompletion, Run, RunCreate, RunKwargs,
    RunStatus, RunUser,
};
pub use stream::StreamMode;
pub use thread::{Thread, ThreadStatus};
