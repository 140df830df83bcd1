use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{Assistant, CancelAction, Metadata, Run, RunCreate, Thread};
use crate::error::{EngineError, StoreError};
use crate::graph::GraphRegistry;
use crate::runtime::cancel::CancelRegistry;
use crate::runtime::multitask::{self, Resolution};
use crate::runtime::queue::{QueueConfig, RunQueue};
use crate::runtime::worker::{WorkerContext, WorkerSettings};
use crate::store::{CheckpointStore, QueueStats, RunStore};
use crate::stream::{ControlSignal, StreamManager, StreamMessage};
use crate::webhook::WebhookDispatcher;

/// How often a quiet stream re-checks that its run is still in flight.
const LIVENESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub queue: QueueConfig,
    pub worker: WorkerSettings,
    /// Whether runs keep a replayable log unless the request says otherwise.
    pub resumable_by_default: bool,
}

/// Entry point for submitting, observing and cancelling runs.
#[derive(Debug, Clone)]
pub struct Engine {
    ctx: WorkerContext,
    queue: QueueConfig,
    resumable_by_default: bool,
    wake: Arc<Notify>,
    webhooks: Option<Arc<WebhookDispatcher>>,
}

fn control_for(action: CancelAction) -> ControlSignal {
    match action {
        CancelAction::Interrupt => ControlSignal::Interrupt,
        CancelAction::Rollback => ControlSignal::Rollback,
    }
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        runs: Arc<dyn RunStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        graphs: Arc<GraphRegistry>,
    ) -> Self {
        Self {
            ctx: WorkerContext {
                runs,
                checkpoints,
                streams: StreamManager::new(),
                graphs,
                cancels: Arc::new(CancelRegistry::new()),
                settings: settings.worker,
                shutdown: CancellationToken::new(),
            },
            queue: settings.queue,
            resumable_by_default: settings.resumable_by_default,
            wake: Arc::new(Notify::new()),
            webhooks: None,
        }
    }

    #[must_use]
    pub fn with_webhooks(mut self, webhooks: WebhookDispatcher) -> Self {
        self.webhooks = Some(Arc::new(webhooks));
        self
    }

    pub fn runs(&self) -> &Arc<dyn RunStore> {
        &self.ctx.runs
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.ctx.checkpoints
    }

    pub fn streams(&self) -> &StreamManager {
        &self.ctx.streams
    }

    /// Starts the background queue. Runs submitted before this call wait
    /// in `pending`.
    pub fn start(&self) -> RunQueue {
        RunQueue::start(
            self.queue.clone(),
            self.ctx.clone(),
            Arc::clone(&self.wake),
            self.webhooks.clone(),
        )
    }

    pub async fn register_assistant(&self, assistant: Assistant) -> Result<Assistant, EngineError> {
        if !self.ctx.graphs.contains(&assistant.graph_id) {
            return Err(EngineError::Validation(format!(
                "graph '{}' is not registered",
                assistant.graph_id
            )));
        }
        self.ctx.runs.put_assistant(assistant.clone()).await?;
        Ok(assistant)
    }

    pub async fn create_thread(
        &self,
        thread_id: Option<Uuid>,
        metadata: Metadata,
    ) -> Result<Thread, EngineError> {
        Ok(self
            .ctx
            .runs
            .create_thread(thread_id.unwrap_or_else(Uuid::new_v4), metadata)
            .await?)
    }

    pub async fn get_thread(&self, thread_id: Uuid) -> Result<Thread, EngineError> {
        self.ctx
            .runs
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| StoreError::not_found("thread", thread_id).into())
    }

    pub async fn get_run(&self, thread_id: Uuid, run_id: Uuid) -> Result<Run, EngineError> {
        self.ctx
            .runs
            .get_thread_run(thread_id, run_id)
            .await?
            .ok_or_else(|| StoreError::not_found("run", run_id).into())
    }

    pub async fn list_runs(
        &self,
        thread_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Run>, EngineError> {
        self.get_thread(thread_id).await?;
        Ok(self.ctx.runs.search(thread_id, None, limit, offset).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats, EngineError> {
        Ok(self.ctx.runs.stats().await?)
    }

    /// Admits a run according to its multitask strategy.
    #[instrument(
        skip_all,
        fields(
            assistant_id = %request.assistant_id,
            thread_id = ?request.thread_id,
            strategy = ?request.multitask_strategy,
            run_id = tracing::field::Empty,
        )
    )]
    pub async fn submit(&self, request: RunCreate) -> Result<Run, EngineError> {
        let strategy = request.multitask_strategy;
        let new = multitask::prepare(request, self.resumable_by_default)?;
        let admission = self.ctx.runs.put(new).await?;

        match multitask::resolve(strategy, admission) {
            Resolution::Rejected { thread_id } => {
                info!(%thread_id, "Rejected run: thread is busy");
                Err(EngineError::Conflict { thread_id })
            }
            Resolution::Accepted { run, supersede } => {
                tracing::Span::current().record("run_id", tracing::field::display(run.run_id));
                if let Some(supersede) = supersede {
                    match self
                        .cancel(Some(run.thread_id), &supersede.run_ids, supersede.action)
                        .await
                    {
                        Ok(()) => {}
                        Err(EngineError::NotFound(reason)) => {
                            debug!(%reason, "Superseded runs already finished");
                        }
                        Err(err) => warn!(error = %err, "Failed to cancel superseded runs"),
                    }
                }
                info!("Created run");
                self.wake.notify_one();
                Ok(run)
            }
        }
    }

    /// Cancels in-flight runs of a thread (or of any thread when
    /// `thread_id` is `None`).
    #[instrument(skip(self, run_ids), fields(runs = run_ids.len()))]
    pub async fn cancel(
        &self,
        thread_id: Option<Uuid>,
        run_ids: &[Uuid],
        action: CancelAction,
    ) -> Result<(), EngineError> {
        let outcome = self.ctx.runs.cancel(thread_id, run_ids, action).await?;

        for run_id in &outcome.signal {
            self.ctx.cancels.signal(*run_id, action);
            // The worker may have concluded in the meantime and will not
            // release the handle again.
            if self.ctx.runs.is_inflight(*run_id).await? {
                if self.ctx.streams.control(*run_id, control_for(action)).is_none() {
                    debug!(%run_id, "No stream state to signal");
                }
            } else {
                self.ctx.cancels.release(*run_id);
            }
        }
        for run_id in &outcome.finalized {
            self.ctx.streams.conclude(*run_id);
            self.ctx.cancels.release(*run_id);
        }
        for thread_id in &outcome.deleted_threads {
            self.ctx.checkpoints.delete_thread(*thread_id).await?;
        }

        info!(
            action = action.as_str(),
            signalled = outcome.signal.len(),
            finalized = outcome.finalized.len(),
            "Cancelled runs"
        );
        Ok(())
    }

    /// Output of a run until it concludes. With `last_event_id`, stored
    /// events after that id are replayed first.
    pub fn stream(
        &self,
        run_id: Uuid,
        last_event_id: Option<u64>,
    ) -> impl Stream<Item = StreamMessage> + Send + 'static {
        let runs = Arc::clone(&self.ctx.runs);
        let mut messages = Box::pin(self.ctx.streams.join(run_id, last_event_id));

        async_stream::stream! {
            loop {
                match tokio::time::timeout(LIVENESS_INTERVAL, messages.next()).await {
                    Ok(Some(message)) => yield message,
                    Ok(None) => break,
                    Err(_) => {
                        // Concluded before we subscribed, or its state is gone.
                        match runs.is_inflight(run_id).await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(err) => {
                                warn!(%run_id, error = %err, "Liveness check failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Waits for a run to conclude and returns its final values.
    ///
    /// A failed run yields `{"__error__": ...}` instead.
    pub async fn join(&self, thread_id: Uuid, run_id: Uuid) -> Result<Value, EngineError> {
        self.get_run(thread_id, run_id).await?;

        let mut last_values = None;
        let mut error = None;
        let mut messages = std::pin::pin!(self.stream(run_id, None));
        while let Some(message) = messages.next().await {
            match message.mode() {
                Some("values") => last_values = Some(message.payload),
                Some("error") => error = Some(message.payload),
                _ => {}
            }
        }

        if let Some(error) = error {
            return Ok(json!({ "__error__": error }));
        }
        if let Some(values) = last_values {
            return Ok(values);
        }

        // Nothing observed: the run finished before we subscribed.
        let Some(thread) = self.ctx.runs.get_thread(thread_id).await? else {
            return Ok(Value::Null);
        };
        Ok(match thread.error {
            Some(message) => json!({"__error__": {"error": "RunError", "message": message}}),
            None => thread.values.unwrap_or(Value::Null),
        })
    }

    /// Deletes a thread, cancelling whatever still runs on it.
    pub async fn delete_thread(&self, thread_id: Uuid) -> Result<(), EngineError> {
        let inflight = self.ctx.runs.delete_thread(thread_id).await?;
        for run_id in inflight {
            // Running workers hold their own handle and still observe the signal.
            self.ctx.cancels.signal(run_id, CancelAction::Interrupt);
            self.ctx.cancels.release(run_id);
            self.ctx.streams.conclude(run_id);
        }
        self.ctx.checkpoints.delete_thread(thread_id).await?;
        Ok(())
    }
}
