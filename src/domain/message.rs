use serde::{Deserialize, Serialize};

use super::Metadata;

/// A chat message, or a chunk of one, emitted by a graph.
///
/// Chunks sharing an `id` are reassembled by concatenating `content`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    #[serde(rename = "type", default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub content: String,
    /// Set on the chunk that completes the message.
    #[serde(default)]
    pub complete: bool,
    #[serde(flatten)]
    pub extra: Metadata,
}

fn default_role() -> String {
    "ai".to_string()
}

impl ChatMessage {
    pub fn chunk(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: default_role(),
            content: content.into(),
            complete: false,
            extra: Metadata::new(),
        }
    }

    #[must_use]
    pub fn completed(mut self) -> Self {
        self.complete = true;
        self
    }

    /// Folds a later chunk of the same message into this one.
    pub fn merge(&mut self, chunk: &ChatMessage) {
        self.content.push_str(&chunk.content);
        self.complete = chunk.complete;
        for (key, value) in &chunk.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}
