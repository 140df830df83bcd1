use serde_json::{Value, json};
use uuid::Uuid;

use super::{Graph, GraphConfig, GraphError, GraphEvent, GraphStream};
use crate::domain::{ChatMessage, Checkpoint};

/// Replies with the input message, streamed word by word.
///
/// The thread keeps the full conversation in `values.messages`, so each
/// run continues from the checkpoint the previous one left behind.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoGraph;

fn emit(event: GraphEvent) -> Result<GraphEvent, GraphError> {
    Ok(event)
}

impl Graph for EchoGraph {
    fn step(&self, input: Value, config: GraphConfig) -> GraphStream {
        let text = input
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| input.as_str())
            .unwrap_or_default()
            .to_string();
        let mut history = config
            .checkpoint
            .as_ref()
            .and_then(|cp| cp.values.get("messages"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let parent = config.checkpoint.map(|cp| cp.checkpoint_id);

        Box::pin(async_stream::stream! {
            let reply_id = format!("msg-{}", Uuid::new_v4());
            let node = json!({"langgraph_node": "echo"});

            let words: Vec<String> = text.split_inclusive(' ').map(str::to_string).collect();
            if words.is_empty() {
                yield emit(GraphEvent::message(&ChatMessage::chunk(&reply_id, "").completed(), node.clone()));
            }
            let last = words.len().saturating_sub(1);
            for (i, word) in words.into_iter().enumerate() {
                let mut chunk = ChatMessage::chunk(&reply_id, word);
                if i == last {
                    chunk = chunk.completed();
                }
                yield emit(GraphEvent::message(&chunk, node.clone()));
            }

            let reply = json!({"type": "ai", "id": reply_id, "content": text});
            history.push(json!({"type": "human", "content": text}));
            history.push(reply.clone());
            let values = json!({"messages": history});
            yield emit(GraphEvent::updates(json!({"echo": {"messages": [reply]}})));

            let mut checkpoint = Checkpoint::new(Uuid::new_v4().to_string(), values.clone());
            checkpoint.parent_checkpoint_id = parent;
            yield emit(GraphEvent::checkpoint(&checkpoint));
            yield emit(GraphEvent::values(values));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StreamMode;
    use futures::StreamExt;

    fn config(checkpoint: Option<Checkpoint>) -> GraphConfig {
        GraphConfig {
            run_id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            assistant_id: Uuid::new_v4(),
            attempt: 1,
            checkpoint,
            configurable: crate::domain::Metadata::new(),
            stream_modes: vec![StreamMode::Values],
            subgraphs: false,
        }
    }

    #[tokio::test]
    async fn echoes_and_extends_history() {
        let previous = Checkpoint::new(
            "cp-0",
            json!({"messages": [{"type": "human", "content": "earlier"}]}),
        );
        let events: Vec<_> = EchoGraph
            .step(json!({"message": "hi there"}), config(Some(previous)))
            .collect()
            .await;
        let events: Vec<GraphEvent> = events.into_iter().map(Result::unwrap).collect();

        let messages = events
            .iter()
            .filter(|e| matches!(e, GraphEvent::Part { mode: StreamMode::Messages, .. }))
            .count();
        assert_eq!(messages, 2);

        let Some(GraphEvent::Part { payload, .. }) = events.last() else {
            panic!("expected values last");
        };
        assert_eq!(payload["messages"].as_array().map(Vec::len), Some(3));
        assert_eq!(payload["messages"][2]["content"], "hi there");
    }
}
