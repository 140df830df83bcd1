use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::{Metadata, StreamMode};

/// Lifecycle state of a run.
///
/// `Pending` and `Running` are the in-flight states; everything else is
/// terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Error,
    Success,
    Timeout,
    Interrupted,
    Rollback,
}

impl RunStatus {
    pub fn is_inflight(self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// Status recorded for a run stopped by `action`.
    pub fn cancelled_by(action: CancelAction) -> Self {
        match action {
            CancelAction::Interrupt => RunStatus::Interrupted,
            CancelAction::Rollback => RunStatus::Rollback,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Error => "error",
            RunStatus::Success => "success",
            RunStatus::Timeout => "timeout",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Rollback => "rollback",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy applied when a run is submitted to a thread that already has
/// in-flight work.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MultitaskStrategy {
    #[default]
    Reject,
    Rollback,
    Interrupt,
    Enqueue,
}

/// What happens to a thread created implicitly for a thread-less run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnCompletion {
    #[default]
    Delete,
    Keep,
}

/// Behaviour when the named thread does not exist.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IfNotExists {
    Create,
    #[default]
    Reject,
}

/// How an in-flight run should be stopped.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelAction {
    #[default]
    Interrupt,
    Rollback,
}

impl CancelAction {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelAction::Interrupt => "interrupt",
            CancelAction::Rollback => "rollback",
        }
    }
}

/// Caller identity captured at submission and replayed into the execution
/// context of every attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RunUser {
    pub identity: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Execution parameters frozen at submission time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunKwargs {
    pub graph_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default = "StreamMode::defaults")]
    pub stream_mode: Vec<StreamMode>,
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default)]
    pub temporary: bool,
    #[serde(default)]
    pub subgraphs: bool,
    #[serde(default)]
    pub resumable: bool,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub config: Metadata,
    #[serde(default, skip_serializing)]
    pub user: Option<RunUser>,
}

/// A single execution request against a thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub assistant_id: Uuid,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub kwargs: RunKwargs,
    pub multitask_strategy: MultitaskStrategy,
    #[serde(default)]
    pub metadata: Metadata,
    /// Number of attempts started so far.
    #[serde(default)]
    pub attempt: u32,
}

/// Submission payload accepted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunCreate {
    pub assistant_id: Uuid,
    #[serde(default)]
    pub thread_id: Option<Uuid>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub stream_mode: Option<Vec<StreamMode>>,
    #[serde(default)]
    pub multitask_strategy: MultitaskStrategy,
    #[serde(default)]
    pub on_completion: Option<OnCompletion>,
    #[serde(default)]
    pub if_not_exists: IfNotExists,
    /// Delay before the run becomes claimable.
    #[serde(default)]
    pub after_seconds: u64,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default)]
    pub stream_subgraphs: bool,
    #[serde(default)]
    pub stream_resumable: Option<bool>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub config: Metadata,
    #[serde(skip)]
    pub user: Option<RunUser>,
}

impl RunCreate {
    pub fn new(assistant_id: Uuid) -> Self {
        Self {
            assistant_id,
            ..Self::default()
        }
    }

    /// A run without a thread whose implicit thread is discarded afterwards.
    pub fn is_temporary(&self) -> bool {
        self.thread_id.is_none() && self.on_completion.unwrap_or_default() == OnCompletion::Delete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_create_defaults() {
        let create: RunCreate =
            serde_json::from_str(&format!(r#"{{"assistant_id":"{}"}}"#, Uuid::nil())).unwrap();
        assert_eq!(create.multitask_strategy, MultitaskStrategy::Reject);
        assert_eq!(create.if_not_exists, IfNotExists::Reject);
        assert!(create.stream_mode.is_none());
        assert!(create.is_temporary());
    }

    #[test]
    fn keep_on_completion_is_not_temporary() {
        let mut create = RunCreate::new(Uuid::nil());
        create.on_completion = Some(OnCompletion::Keep);
        assert!(!create.is_temporary());

        let mut threaded = RunCreate::new(Uuid::nil());
        threaded.thread_id = Some(Uuid::new_v4());
        assert!(!threaded.is_temporary());
    }

    #[test]
    fn inflight_states() {
        assert!(RunStatus::Pending.is_inflight());
        assert!(RunStatus::Running.is_inflight());
        assert!(!RunStatus::Interrupted.is_inflight());
        assert!(!RunStatus::Rollback.is_inflight());
        assert_eq!(
            serde_json::to_value(RunStatus::Timeout).unwrap(),
            serde_json::json!("timeout")
        );
        assert_eq!(
            serde_json::from_value::<RunStatus>(serde_json::json!("rollback")).unwrap(),
            RunStatus::Rollback
        );
        assert_eq!(
            RunStatus::cancelled_by(CancelAction::Rollback).as_str(),
            "rollback"
        );
    }
}
