use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::Metadata;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    #[default]
    Idle,
    Busy,
    Interrupted,
    Error,
}

/// A persistent conversation/state container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub thread_id: Uuid,
    pub status: ThreadStatus,
    /// Values of the latest checkpoint, if any.
    #[serde(default)]
    pub values: Option<Value>,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    /// Pending interrupts keyed by task id.
    #[serde(default)]
    pub interrupts: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(thread_id: Uuid, metadata: Metadata) -> Self {
        let now = Utc::now();
        Self {
            thread_id,
            status: ThreadStatus::Idle,
            values: None,
            checkpoint_id: None,
            interrupts: BTreeMap::new(),
            error: None,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }
}
