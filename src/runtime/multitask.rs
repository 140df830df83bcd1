//! Decides what happens when a run is submitted to a thread that already
//! has in-flight work.
//!
//! | strategy    | new run            | in-flight runs         |
//! |-------------|--------------------|------------------------|
//! | `reject`    | refused (conflict) | untouched              |
//! | `enqueue`   | queued behind them | untouched              |
//! | `interrupt` | queued             | interrupted, state kept |
//! | `rollback`  | queued             | cancelled and erased   |

use uuid::Uuid;

use crate::domain::{CancelAction, MultitaskStrategy, Run, RunCreate, RunKwargs, StreamMode};
use crate::error::EngineError;
use crate::store::{Admission, NewRun};

/// In-flight runs to cancel after the new run was admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supersede {
    pub action: CancelAction,
    pub run_ids: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Accepted {
        run: Run,
        supersede: Option<Supersede>,
    },
    Rejected {
        thread_id: Uuid,
    },
}

/// Builds the store insert for a submission.
pub fn prepare(request: RunCreate, resumable_by_default: bool) -> Result<NewRun, EngineError> {
    if let Some(webhook) = &request.webhook {
        if !webhook.starts_with('/') {
            url::Url::parse(webhook)
                .map_err(|err| EngineError::Validation(format!("invalid webhook url: {err}")))?;
        }
    }

    let temporary = request.is_temporary();
    let stream_mode = match request.stream_mode {
        Some(modes) if !modes.is_empty() => modes,
        _ => StreamMode::defaults(),
    };

    Ok(NewRun {
        run_id: Uuid::new_v4(),
        assistant_id: request.assistant_id,
        thread_id: request.thread_id,
        kwargs: RunKwargs {
            graph_id: String::new(),
            input: request.input,
            stream_mode,
            webhook: request.webhook,
            temporary,
            subgraphs: request.stream_subgraphs,
            resumable: request.stream_resumable.unwrap_or(resumable_by_default),
            checkpoint_id: request.checkpoint_id,
            config: request.config,
            user: request.user,
        },
        metadata: request.metadata,
        multitask_strategy: request.multitask_strategy,
        prevent_insert_if_inflight: request.multitask_strategy == MultitaskStrategy::Reject,
        if_not_exists: request.if_not_exists,
        after_seconds: request.after_seconds,
    })
}

/// Applies the strategy to the store's admission result.
pub fn resolve(strategy: MultitaskStrategy, admission: Admission) -> Resolution {
    match admission {
        Admission::Refused { thread_id, .. } => Resolution::Rejected { thread_id },
        Admission::Created { run, inflight } => {
            let action = match strategy {
                MultitaskStrategy::Interrupt => Some(CancelAction::Interrupt),
                MultitaskStrategy::Rollback => Some(CancelAction::Rollback),
                MultitaskStrategy::Reject | MultitaskStrategy::Enqueue => None,
            };
            let supersede = action
                .filter(|_| !inflight.is_empty())
                .map(|action| Supersede {
                    action,
                    run_ids: inflight.iter().map(|r| r.run_id).collect(),
                });
            Resolution::Accepted { run, supersede }
        }
    }
}
