use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::Metadata;

/// Durable snapshot of a thread's state at a step boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    #[serde(default)]
    pub checkpoint_ns: String,
    #[serde(default)]
    pub parent_checkpoint_id: Option<String>,
    #[serde(default)]
    pub values: Value,
    /// Nodes scheduled to run next. Non-empty means the graph paused.
    #[serde(default)]
    pub next: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<CheckpointTask>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// A task scheduled by a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointTask {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub interrupts: Vec<Value>,
}

/// Outcome of a task, reported after the checkpoint that scheduled it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub interrupts: Vec<Value>,
}

impl Checkpoint {
    pub fn new(checkpoint_id: impl Into<String>, values: Value) -> Self {
        Self {
            checkpoint_id: checkpoint_id.into(),
            checkpoint_ns: String::new(),
            parent_checkpoint_id: None,
            values,
            next: Vec::new(),
            tasks: Vec::new(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    /// Merges a task result into the matching task.
    ///
    /// Returns `false` when no task with that id is scheduled here.
    pub fn apply_task_result(&mut self, result: TaskResult) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == result.id) else {
            return false;
        };
        if result.error.is_some() {
            task.error = result.error;
        }
        if result.result.is_some() {
            task.result = result.result;
        }
        if !result.interrupts.is_empty() {
            task.interrupts = result.interrupts;
        }
        true
    }

    pub fn is_paused(&self) -> bool {
        !self.next.is_empty()
    }

    pub fn interrupts(&self) -> BTreeMap<String, Vec<Value>> {
        self.tasks
            .iter()
            .filter(|t| !t.interrupts.is_empty())
            .map(|t| (t.id.clone(), t.interrupts.clone()))
            .collect()
    }

    /// Id of the run that wrote this checkpoint, if recorded.
    pub fn run_id(&self) -> Option<&str> {
        self.metadata.get("run_id").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_task() -> Checkpoint {
        let mut cp = Checkpoint::new("cp-1", json!({"n": 1}));
        cp.next = vec!["ask".into()];
        cp.tasks.push(CheckpointTask {
            id: "t1".into(),
            name: "ask".into(),
            error: None,
            result: None,
            interrupts: Vec::new(),
        });
        cp
    }

    #[test]
    fn task_result_merges_into_matching_task() {
        let mut cp = with_task();
        let applied = cp.apply_task_result(TaskResult {
            id: "t1".into(),
            name: "ask".into(),
            error: None,
            result: Some(json!({"answer": 42})),
            interrupts: vec![json!({"value": "confirm?"})],
        });
        assert!(applied);
        assert_eq!(cp.tasks[0].result, Some(json!({"answer": 42})));
        assert_eq!(cp.interrupts().get("t1").map(Vec::len), Some(1));
        assert!(cp.is_paused());
    }

    #[test]
    fn unknown_task_result_is_ignored() {
        let mut cp = with_task();
        let applied = cp.apply_task_result(TaskResult {
            id: "nope".into(),
            name: String::new(),
            error: Some("boom".into()),
            result: None,
            interrupts: Vec::new(),
        });
        assert!(!applied);
        assert!(cp.tasks[0].error.is_none());
    }
}
