use serde::{Deserialize, Serialize};
use std::fmt;

/// Output channels a client can request from a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum StreamMode {
    Values,
    Updates,
    Messages,
    MessagesTuple,
    Events,
    Debug,
    Custom,
}

impl StreamMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamMode::Values => "values",
            StreamMode::Updates => "updates",
            StreamMode::Messages => "messages",
            StreamMode::MessagesTuple => "messages-tuple",
            StreamMode::Events => "events",
            StreamMode::Debug => "debug",
            StreamMode::Custom => "custom",
        }
    }

    /// Modes used when a request does not name any.
    pub fn defaults() -> Vec<StreamMode> {
        vec![StreamMode::Values]
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
