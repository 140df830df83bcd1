//! Run Engine
//!
//! Executes graph runs in the background, streams their output to any
//! number of (re)connecting clients and persists thread state as
//! checkpoints.
//!
//! # Architecture
//!
//! - **Server**: Axum HTTP API with SSE streaming
//! - **Runtime**: admission, queue, worker loop with retries and cancellation
//! - **Stream Manager**: per-run ordered, replayable event log
//! - **Stores**: run/thread and checkpoint persistence, in memory or Postgres
//!
//! # Modules
//!
//! - [`domain`]: runs, threads, checkpoints and their enums
//! - [`graph`]: the computation interface and built-in graphs
//! - [`runtime`]: engine, queue, worker and streaming pipeline
//! - [`store`]: run and checkpoint stores with their providers
//! - [`stream`]: resumable stream manager
//! - [`webhook`]: completion notifications

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod graph;
pub mod runtime;
pub mod server;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod webhook;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::runtime::Engine;

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Run submission, streaming and cancellation.
    pub engine: Engine,
    /// Loaded configuration.
    pub config: Arc<AppConfig>,
}
