//! Turns a graph's raw event stream into the client-facing event sequence.
//!
//! The pipeline always asks the graph for `debug` output so checkpoints
//! and task results can be captured, but only forwards the channels the
//! client requested.

use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::domain::{ChatMessage, Checkpoint, Run, StreamMode, TaskResult};
use crate::graph::{Graph, GraphConfig, GraphError, GraphEvent};

/// One item leaving the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineItem {
    /// A client-visible event on the named mode.
    Part { mode: String, payload: Value },
    Checkpoint(Checkpoint),
    TaskResult(TaskResult),
}

impl PipelineItem {
    fn part(mode: impl Into<String>, payload: Value) -> Self {
        Self::Part {
            mode: mode.into(),
            payload,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageTuple(ChatMessage, #[serde(default)] Value);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
enum DebugEnvelope {
    Checkpoint(Checkpoint),
    TaskResult(TaskResult),
}

/// Stateful translation of graph events for one run attempt.
#[derive(Debug)]
pub struct StreamTranslator {
    requested: BTreeSet<StreamMode>,
    subgraphs: bool,
    messages: HashMap<String, ChatMessage>,
}

impl StreamTranslator {
    pub fn new(requested: &[StreamMode], subgraphs: bool) -> Self {
        Self {
            requested: requested.iter().copied().collect(),
            subgraphs,
            messages: HashMap::new(),
        }
    }

    /// Modes the graph has to produce for this translator.
    pub fn graph_modes(&self) -> Vec<StreamMode> {
        let mut modes: BTreeSet<StreamMode> = self
            .requested
            .iter()
            .map(|mode| match mode {
                StreamMode::MessagesTuple => StreamMode::Messages,
                other => *other,
            })
            .filter(|mode| *mode != StreamMode::Events)
            .collect();
        modes.insert(StreamMode::Debug);
        modes.into_iter().collect()
    }

    fn wants(&self, mode: StreamMode) -> bool {
        self.requested.contains(&mode)
    }

    fn mode_name(&self, mode: &str, namespace: &[String]) -> String {
        if self.subgraphs && !namespace.is_empty() {
            format!("{mode}|{}", namespace.join("|"))
        } else {
            mode.to_string()
        }
    }

    pub fn translate(&mut self, event: GraphEvent) -> Vec<PipelineItem> {
        let (namespace, mode, payload) = match event {
            GraphEvent::Raw(raw) => {
                return if self.wants(StreamMode::Events) {
                    vec![PipelineItem::part("events", raw)]
                } else {
                    Vec::new()
                };
            }
            GraphEvent::Part {
                namespace,
                mode,
                payload,
            } => (namespace, mode, payload),
        };

        match mode {
            StreamMode::Debug => self.debug(&namespace, payload),
            StreamMode::Messages | StreamMode::MessagesTuple => self.messages(&namespace, payload),
            other if self.wants(other) => {
                vec![PipelineItem::part(
                    self.mode_name(other.as_str(), &namespace),
                    payload,
                )]
            }
            _ => Vec::new(),
        }
    }

    fn debug(&self, namespace: &[String], payload: Value) -> Vec<PipelineItem> {
        let mut items = Vec::new();
        // Nested graphs checkpoint into their own namespace; only the root
        // graph's snapshots describe the thread.
        if namespace.is_empty() {
            match DebugEnvelope::deserialize(&payload) {
                Ok(DebugEnvelope::Checkpoint(cp)) => items.push(PipelineItem::Checkpoint(cp)),
                Ok(DebugEnvelope::TaskResult(result)) => {
                    items.push(PipelineItem::TaskResult(result));
                }
                Err(_) => {}
            }
        }
        if self.wants(StreamMode::Debug) {
            items.push(PipelineItem::part(
                self.mode_name("debug", namespace),
                payload,
            ));
        }
        items
    }

    fn messages(&mut self, namespace: &[String], payload: Value) -> Vec<PipelineItem> {
        if self.wants(StreamMode::MessagesTuple) {
            return vec![PipelineItem::part(
                self.mode_name("messages", namespace),
                payload,
            )];
        }
        if !self.wants(StreamMode::Messages) {
            return Vec::new();
        }

        let MessageTuple(chunk, metadata) = match MessageTuple::deserialize(&payload) {
            Ok(tuple) => tuple,
            Err(err) => {
                tracing::warn!(error = %err, "Dropping malformed message chunk");
                return Vec::new();
            }
        };

        let mut items = Vec::new();
        let kind = if chunk.complete {
            self.mode_name("messages/complete", namespace)
        } else {
            self.mode_name("messages/partial", namespace)
        };
        let materialized = match self.messages.get_mut(&chunk.id) {
            Some(existing) => {
                existing.merge(&chunk);
                existing.clone()
            }
            None => {
                let mut by_id = serde_json::Map::new();
                by_id.insert(chunk.id.clone(), json!({"metadata": metadata}));
                items.push(PipelineItem::part(
                    self.mode_name("messages/metadata", namespace),
                    Value::Object(by_id),
                ));
                self.messages.insert(chunk.id.clone(), chunk.clone());
                chunk
            }
        };
        items.push(PipelineItem::part(kind, json!([materialized])));
        items
    }
}

/// Streams one attempt of `run` through `graph`.
///
/// The first attempt opens with a `metadata` part carrying the run id, so
/// clients see it once per run however many attempts follow. Graph errors
/// end the stream after being yielded.
pub fn stream_state(
    graph: Arc<dyn Graph>,
    run: &Run,
    attempt: u32,
    checkpoint: Option<Checkpoint>,
) -> impl Stream<Item = Result<PipelineItem, GraphError>> + Send + 'static {
    let mut translator = StreamTranslator::new(&run.kwargs.stream_mode, run.kwargs.subgraphs);
    let config = GraphConfig {
        run_id: run.run_id,
        thread_id: run.thread_id,
        assistant_id: run.assistant_id,
        attempt,
        checkpoint,
        configurable: run.kwargs.config.clone(),
        stream_modes: translator.graph_modes(),
        subgraphs: run.kwargs.subgraphs,
    };
    let input = run.kwargs.input.clone();
    let run_id = run.run_id;

    async_stream::stream! {
        if attempt == 1 {
            yield Ok(PipelineItem::part(
                "metadata",
                json!({"run_id": run_id, "attempt": attempt}),
            ));
        }

        let mut events = graph.step(input, config);
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    for item in translator.translate(event) {
                        yield Ok(item);
                    }
                }
                Err(err) => {
                    yield Err(err);
                    break;
                }
            }
        }
    }
}
