//! The seam between the engine and the user computation it executes.
//!
//! A [`Graph`] turns an input plus a [`GraphConfig`] into a stream of
//! [`GraphEvent`]s. Checkpoints and task results travel on the `debug`
//! channel as `{"type": "checkpoint" | "task_result", "payload": ...}`
//! envelopes; the streaming pipeline picks them out.

pub mod echo;
pub mod scripted;

use futures::stream::BoxStream;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{ChatMessage, Checkpoint, Metadata, StreamMode, TaskResult};

pub use echo::EchoGraph;
pub use scripted::ScriptedGraph;

/// One item produced by a graph.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// Output on a named channel, optionally from a nested graph.
    Part {
        namespace: Vec<String>,
        mode: StreamMode,
        payload: Value,
    },
    /// Low-level event forwarded on the `events` channel.
    Raw(Value),
}

impl GraphEvent {
    pub fn part(mode: StreamMode, payload: Value) -> Self {
        Self::Part {
            namespace: Vec::new(),
            mode,
            payload,
        }
    }

    pub fn values(payload: Value) -> Self {
        Self::part(StreamMode::Values, payload)
    }

    pub fn updates(payload: Value) -> Self {
        Self::part(StreamMode::Updates, payload)
    }

    /// A message chunk with its emitting-node metadata.
    pub fn message(message: &ChatMessage, metadata: Value) -> Self {
        Self::part(StreamMode::Messages, json!([message, metadata]))
    }

    pub fn checkpoint(checkpoint: &Checkpoint) -> Self {
        Self::part(
            StreamMode::Debug,
            json!({"type": "checkpoint", "payload": checkpoint}),
        )
    }

    pub fn task_result(result: &TaskResult) -> Self {
        Self::part(
            StreamMode::Debug,
            json!({"type": "task_result", "payload": result}),
        )
    }

    /// Moves the event under a subgraph namespace.
    #[must_use]
    pub fn in_namespace<I, S>(self, ns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self {
            Self::Part { mode, payload, .. } => Self::Part {
                namespace: ns.into_iter().map(Into::into).collect(),
                mode,
                payload,
            },
            raw @ Self::Raw(_) => raw,
        }
    }
}

/// Failures a graph can report.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// Transient failure. The run is re-attempted.
    #[error("retriable failure: {0}")]
    Retriable(String),

    /// The graph asked to stop and keep its state.
    #[error("run interrupted by the graph")]
    Interrupt,

    /// The graph asked to discard everything the run wrote.
    #[error("run rollback requested by the graph")]
    Rollback,

    /// Permanent failure.
    #[error("{0}")]
    Failed(String),
}

/// Per-attempt execution parameters handed to a graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphConfig {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub assistant_id: Uuid,
    pub attempt: u32,
    /// Checkpoint the run starts from; `None` for a fresh thread.
    pub checkpoint: Option<Checkpoint>,
    pub configurable: Metadata,
    /// Channels the pipeline wants produced.
    pub stream_modes: Vec<StreamMode>,
    pub subgraphs: bool,
}

pub type GraphStream = BoxStream<'static, Result<GraphEvent, GraphError>>;

/// A computation the engine can run.
pub trait Graph: Send + Sync + fmt::Debug {
    fn step(&self, input: Value, config: GraphConfig) -> GraphStream;
}

/// Graphs addressable by id.
#[derive(Debug, Default)]
pub struct GraphRegistry {
    graphs: RwLock<HashMap<String, Arc<dyn Graph>>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, graph_id: impl Into<String>, graph: Arc<dyn Graph>) {
        self.graphs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(graph_id.into(), graph);
    }

    pub fn get(&self, graph_id: &str) -> Option<Arc<dyn Graph>> {
        self.graphs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(graph_id)
            .cloned()
    }

    pub fn contains(&self, graph_id: &str) -> bool {
        self.graphs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(graph_id)
    }
}
