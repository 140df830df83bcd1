//! Run execution: admission, the worker pool and the streaming pipeline.
//!
//! - [`engine`]: facade used by the HTTP layer and embedders
//! - [`multitask`]: policy for runs submitted to busy threads
//! - [`queue`]: bounded pool that claims and executes pending runs
//! - [`worker`]: a single attempt and its settlement
//! - [`pipeline`]: graph output to client events
//! - [`cancel`]: per-run cancellation handles
//! - [`context`]: caller identity visible to graphs

pub mod cancel;
pub mod context;
pub mod engine;
pub mod multitask;
pub mod pipeline;
pub mod queue;
pub mod worker;

pub use engine::{Engine, EngineSettings};
pub use queue::{QueueConfig, RunQueue};
pub use worker::{RunOutcome, WorkerError, WorkerResult, WorkerSettings};
