//! Executes one attempt of a claimed run and settles its outcome.
//!
//! An attempt ends in exactly one way: success, timeout, interrupt,
//! rollback, a retriable failure, a permanent failure, or process
//! shutdown. Retriable failures and shutdown hand the run back to the
//! queue as `pending`; every other outcome is final and concludes the
//! run's stream.

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{CancelAction, Checkpoint, Metadata, Run, RunStatus};
use crate::error::StoreError;
use crate::graph::{GraphError, GraphRegistry};
use crate::runtime::cancel::{CancelRegistry, RunCancellation};
use crate::runtime::context;
use crate::runtime::pipeline::{self, PipelineItem};
use crate::store::{CheckpointStore, RunStore};
use crate::stream::StreamManager;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_attempts: u32,
    pub job_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }
}

/// Everything a worker needs to execute runs.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub runs: Arc<dyn RunStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub streams: StreamManager,
    pub graphs: Arc<GraphRegistry>,
    pub cancels: Arc<CancelRegistry>,
    pub settings: WorkerSettings,
    /// Fired when the process is going away.
    pub shutdown: CancellationToken,
}

/// Final outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Error,
    Timeout,
    Interrupted,
    Rollback,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Error => "error",
            RunOutcome::Timeout => "timeout",
            RunOutcome::Interrupted => "interrupted",
            RunOutcome::Rollback => "rollback",
        }
    }

    /// Terminal status recorded on the run.
    pub fn status(self) -> RunStatus {
        match self {
            RunOutcome::Success => RunStatus::Success,
            RunOutcome::Error => RunStatus::Error,
            RunOutcome::Timeout => RunStatus::Timeout,
            RunOutcome::Interrupted => RunStatus::Interrupted,
            RunOutcome::Rollback => RunStatus::Rollback,
        }
    }
}

/// What a concluded run produced. Feeds the webhook.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub run: Run,
    pub outcome: RunOutcome,
    pub checkpoint: Option<Checkpoint>,
    pub error: Option<String>,
    pub run_started_at: DateTime<Utc>,
    pub run_ended_at: DateTime<Utc>,
}

/// Ways an attempt can end without concluding the run.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("run {run_id} attempt {attempt} will be retried: {reason}")]
    Retry {
        run_id: Uuid,
        attempt: u32,
        reason: String,
    },

    #[error("run {run_id} was stopped by shutdown")]
    Shutdown { run_id: Uuid },
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error("run timed out")]
    Timeout,
    #[error("run interrupted")]
    Interrupted,
    #[error("run rolled back")]
    RolledBack,
    #[error("{0}")]
    Retriable(String),
    #[error("worker shutting down")]
    Shutdown,
    #[error("{0}")]
    Fatal(String),
}

impl From<GraphError> for AttemptError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Retriable(reason) => Self::Retriable(reason),
            GraphError::Interrupt => Self::Interrupted,
            GraphError::Rollback => Self::RolledBack,
            GraphError::Failed(message) => Self::Fatal(message),
        }
    }
}

impl From<StoreError> for AttemptError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => Self::Retriable(err.to_string()),
            other => Self::Fatal(other.to_string()),
        }
    }
}

fn exceeded_attempts_message(run: &Run, max_attempts: u32) -> String {
    format!(
        "Run {} exceeded max attempts ({max_attempts}).\n\n\
         This may happen if your code blocks the runtime with synchronous I/O bound calls \
         (network requests, database queries, etc.).\n\n\
         If that is the case, your issues may be resolved by converting blocking operations \
         to async ones.",
        run.run_id
    )
}

fn run_metadata(run: &Run) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert("run_id".into(), json!(run.run_id.to_string()));
    meta.insert("run_attempt".into(), json!(run.attempt));
    meta
}

/// Executes the run's current attempt (`run.attempt`, as set by the claim).
#[instrument(
    name = "run",
    skip_all,
    fields(
        run_id = %run.run_id,
        thread_id = %run.thread_id,
        graph_id = %run.kwargs.graph_id,
        run_attempt = run.attempt,
    )
)]
pub async fn execute(ctx: &WorkerContext, run: Run) -> Result<WorkerResult, WorkerError> {
    let run_started_at = Utc::now();
    if run.attempt == 1 {
        metrics::counter!("runs_started_total").increment(1);
    }
    let cancellation = ctx.cancels.handle(run.run_id);
    info!(
        run_queue_ms = (run_started_at - run.created_at).num_milliseconds(),
        "Starting background run"
    );

    let mut checkpoint = None;
    let result = if run.attempt > ctx.settings.max_attempts {
        Err(AttemptError::Fatal(exceeded_attempts_message(
            &run,
            ctx.settings.max_attempts,
        )))
    } else {
        context::with_run_user(
            run.kwargs.user.clone(),
            attempt_run(ctx, &run, &cancellation, &mut checkpoint),
        )
        .await
    };

    let elapsed_ms = (Utc::now() - run_started_at).num_milliseconds();
    let (outcome, error) = match result {
        Ok(()) => {
            if checkpoint.is_none() && !run.kwargs.temporary {
                info!("No checkpoint emitted for successful run; fetching latest");
                match ctx.checkpoints.get(run.thread_id, None).await {
                    Ok(latest) => checkpoint = latest,
                    Err(err) => error!(error = %err, "Failed to fetch latest checkpoint"),
                }
            }
            info!(run_exec_ms = elapsed_ms, "Background run succeeded");
            (RunOutcome::Success, None)
        }
        Err(AttemptError::Timeout) => {
            warn!(run_exec_ms = elapsed_ms, "Background run timed out");
            (RunOutcome::Timeout, None)
        }
        Err(AttemptError::Interrupted) => {
            info!(run_exec_ms = elapsed_ms, "Background run interrupted");
            (RunOutcome::Interrupted, None)
        }
        Err(AttemptError::RolledBack) => {
            info!(run_exec_ms = elapsed_ms, "Background run rolled back");
            checkpoint = rollback(ctx, &run).await;
            (RunOutcome::Rollback, None)
        }
        Err(AttemptError::Retriable(reason)) => {
            warn!(run_exec_ms = elapsed_ms, %reason, "Background run failed, will retry");
            if let Err(err) = ctx.runs.set_status(run.run_id, RunStatus::Pending).await {
                error!(error = %err, "Failed to requeue run");
            }
            metrics::counter!("runs_retried_total").increment(1);
            return Err(WorkerError::Retry {
                run_id: run.run_id,
                attempt: run.attempt,
                reason,
            });
        }
        Err(AttemptError::Shutdown) => {
            warn!("Background run stopped by shutdown, returning it to the queue");
            if let Err(err) = ctx.runs.set_status(run.run_id, RunStatus::Pending).await {
                error!(error = %err, "Failed to requeue run");
            }
            return Err(WorkerError::Shutdown { run_id: run.run_id });
        }
        Err(AttemptError::Fatal(message)) => {
            error!(run_exec_ms = elapsed_ms, error = %message, "Background run failed");
            ctx.streams.publish(
                run.run_id,
                "error",
                json!({"error": "RunError", "message": message}),
                run.kwargs.resumable,
            );
            (RunOutcome::Error, Some(message))
        }
    };

    settle(ctx, &run, outcome, checkpoint.as_ref(), error.as_deref()).await;

    Ok(WorkerResult {
        run,
        outcome,
        checkpoint,
        error,
        run_started_at,
        run_ended_at: Utc::now(),
    })
}

async fn attempt_run(
    ctx: &WorkerContext,
    run: &Run,
    cancellation: &RunCancellation,
    checkpoint: &mut Option<Checkpoint>,
) -> Result<(), AttemptError> {
    let graph = ctx.graphs.get(&run.kwargs.graph_id).ok_or_else(|| {
        AttemptError::Fatal(format!("Graph '{}' is not registered", run.kwargs.graph_id))
    })?;
    let start = if run.kwargs.temporary {
        None
    } else {
        ctx.checkpoints
            .get(run.thread_id, run.kwargs.checkpoint_id.as_deref())
            .await?
    };
    let stream = pipeline::stream_state(graph, run, run.attempt, start);

    tokio::select! {
        biased;
        () = ctx.shutdown.cancelled() => Err(AttemptError::Shutdown),
        () = cancellation.cancelled() => Err(match cancellation.action() {
            Some(CancelAction::Rollback) => AttemptError::RolledBack,
            _ => AttemptError::Interrupted,
        }),
        result = tokio::time::timeout(ctx.settings.job_timeout, consume(ctx, run, stream, checkpoint)) => {
            result.unwrap_or(Err(AttemptError::Timeout))
        }
    }
}

/// Drains the pipeline: parts go to the stream manager, checkpoints to
/// the checkpoint store.
async fn consume<S>(
    ctx: &WorkerContext,
    run: &Run,
    stream: S,
    checkpoint: &mut Option<Checkpoint>,
) -> Result<(), AttemptError>
where
    S: Stream<Item = Result<PipelineItem, GraphError>>,
{
    let mut stream = std::pin::pin!(stream);
    let persist = !run.kwargs.temporary;
    let meta = run_metadata(run);

    while let Some(item) = stream.next().await {
        match item? {
            PipelineItem::Part { mode, payload } => {
                ctx.streams
                    .publish(run.run_id, &mode, payload, run.kwargs.resumable);
            }
            PipelineItem::Checkpoint(mut cp) => {
                if persist {
                    ctx.checkpoints.put(run.thread_id, &cp, &meta).await?;
                }
                cp.metadata.extend(meta.clone());
                *checkpoint = Some(cp);
            }
            PipelineItem::TaskResult(result) => {
                if let Some(cp) = checkpoint.as_mut() {
                    if cp.apply_task_result(result) && persist {
                        ctx.checkpoints.put(run.thread_id, cp, &meta).await?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Drops the run's checkpoints and returns the one the thread falls back to.
async fn rollback(ctx: &WorkerContext, run: &Run) -> Option<Checkpoint> {
    if run.kwargs.temporary {
        return None;
    }
    match ctx
        .checkpoints
        .delete_for_run(run.thread_id, run.run_id)
        .await
    {
        Ok(removed) => info!(removed, "Discarded checkpoints of rolled back run"),
        Err(err) => error!(error = %err, "Failed to discard checkpoints of rolled back run"),
    }
    match ctx.checkpoints.get(run.thread_id, None).await {
        Ok(restored) => restored,
        Err(err) => {
            error!(error = %err, "Failed to load checkpoint to restore");
            None
        }
    }
}

async fn settle(
    ctx: &WorkerContext,
    run: &Run,
    outcome: RunOutcome,
    checkpoint: Option<&Checkpoint>,
    error: Option<&str>,
) {
    match ctx
        .runs
        .set_joint_status(run.thread_id, run.run_id, outcome.status(), checkpoint, error)
        .await
    {
        Ok(()) => {}
        Err(StoreError::NotFound { kind, id }) => {
            info!(kind, %id, "Run or thread removed before its status was recorded");
        }
        Err(err) => error!(error = %err, "Failed to record run status"),
    }

    if run.kwargs.temporary {
        if let Err(err) = ctx.runs.delete_thread(run.thread_id).await {
            info!(error = %err, "Temporary thread already removed");
        }
        if let Err(err) = ctx.checkpoints.delete_thread(run.thread_id).await {
            error!(error = %err, "Failed to delete checkpoints of temporary thread");
        }
    }

    ctx.streams.conclude(run.run_id);
    ctx.cancels.release(run.run_id);
    metrics::counter!("runs_finished_total", "status" => outcome.as_str()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Assistant, IfNotExists, MultitaskStrategy, RunKwargs, StreamMode};
    use crate::graph::ScriptedGraph;
    use crate::store::{Admission, MemoryCheckpointStore, MemoryRunStore, NewRun};

    fn context(graph: ScriptedGraph) -> WorkerContext {
        let graphs = GraphRegistry::new();
        graphs.register("scripted", Arc::new(graph));
        WorkerContext {
            runs: Arc::new(MemoryRunStore::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            streams: StreamManager::new(),
            graphs: Arc::new(graphs),
            cancels: Arc::new(CancelRegistry::new()),
            settings: WorkerSettings::default(),
            shutdown: CancellationToken::new(),
        }
    }

    async fn claimed_run(ctx: &WorkerContext) -> Run {
        let assistant = Assistant::system("scripted");
        let assistant_id = assistant.assistant_id;
        ctx.runs.put_assistant(assistant).await.unwrap();
        let thread_id = ctx
            .runs
            .create_thread(Uuid::new_v4(), Metadata::new())
            .await
            .unwrap()
            .thread_id;
        let admission = ctx
            .runs
            .put(NewRun {
                run_id: Uuid::new_v4(),
                assistant_id,
                thread_id: Some(thread_id),
                kwargs: RunKwargs {
                    graph_id: String::new(),
                    input: json!({}),
                    stream_mode: vec![StreamMode::Values],
                    webhook: None,
                    temporary: false,
                    subgraphs: false,
                    resumable: true,
                    checkpoint_id: None,
                    config: Metadata::new(),
                    user: None,
                },
                metadata: Metadata::new(),
                multitask_strategy: MultitaskStrategy::Reject,
                prevent_insert_if_inflight: true,
                if_not_exists: IfNotExists::Reject,
                after_seconds: 0,
            })
            .await
            .unwrap();
        assert!(matches!(admission, Admission::Created { .. }));
        ctx.runs.next(1).await.unwrap().pop().expect("claimed")
    }

    #[tokio::test]
    async fn shutdown_hands_the_run_back_without_concluding_it() {
        let ctx = context(ScriptedGraph::new().hang());
        let run = claimed_run(&ctx).await;
        let (run_id, thread_id) = (run.run_id, run.thread_id);

        let worker = {
            let ctx = ctx.clone();
            tokio::spawn(async move { execute(&ctx, run).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.shutdown.cancel();

        let result = worker.await.unwrap();
        assert!(matches!(result, Err(WorkerError::Shutdown { run_id: id }) if id == run_id));

        let stored = ctx.runs.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Pending);
        let thread = ctx.runs.get_thread(thread_id).await.unwrap().unwrap();
        assert_eq!(thread.status, crate::domain::ThreadStatus::Busy);
        assert!(ctx.streams.is_tracked(run_id), "stream is not concluded");

        let reclaimed = ctx.runs.next(1).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].run_id, run_id);
        assert_eq!(reclaimed[0].attempt, 2);
    }

    #[tokio::test]
    async fn graph_rollback_without_prior_checkpoint_clears_the_thread() {
        let ctx = context(
            ScriptedGraph::new()
                .emit(crate::graph::GraphEvent::checkpoint(&Checkpoint::new(
                    "cp-1",
                    json!({"step": 1}),
                )))
                .fail(GraphError::Rollback),
        );
        let run = claimed_run(&ctx).await;
        let thread_id = run.thread_id;

        let result = execute(&ctx, run).await.unwrap();
        assert_eq!(result.outcome, RunOutcome::Rollback);
        assert!(result.checkpoint.is_none());

        let stored = ctx.runs.get_run(result.run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Rollback);
        let thread = ctx.runs.get_thread(thread_id).await.unwrap().unwrap();
        assert!(thread.values.is_none());
        assert!(ctx.checkpoints.list(thread_id).await.unwrap().is_empty());
    }
}
