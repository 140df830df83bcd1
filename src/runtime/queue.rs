use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{Run, RunStatus};
use crate::runtime::worker::{self, WorkerContext, WorkerError};
use crate::webhook::WebhookDispatcher;

/// Concurrent runs per process.
pub const DEFAULT_WORKERS: usize = 10;

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    /// How long in-flight runs may keep going after shutdown starts.
    pub shutdown_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            poll_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(180),
        }
    }
}

/// Background loop that claims pending runs and executes them on a
/// bounded pool of tasks.
#[derive(Debug)]
pub struct RunQueue {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunQueue {
    pub fn start(
        config: QueueConfig,
        ctx: WorkerContext,
        wake: Arc<Notify>,
        webhooks: Option<Arc<WebhookDispatcher>>,
    ) -> Self {
        let stop = CancellationToken::new();
        let task = QueueTask {
            config,
            ctx,
            wake,
            webhooks,
            stop: stop.clone(),
        };
        let handle = tokio::spawn(task.run());
        Self { stop, handle }
    }

    pub fn trigger_shutdown(&self) {
        self.stop.cancel();
    }

    /// Stops claiming, lets in-flight runs finish within the grace period
    /// and cancels the rest.
    pub async fn shutdown(self) {
        self.trigger_shutdown();
        if let Err(err) = self.handle.await {
            error!(?err, "run queue task panicked");
        }
    }
}

struct QueueTask {
    config: QueueConfig,
    ctx: WorkerContext,
    wake: Arc<Notify>,
    webhooks: Option<Arc<WebhookDispatcher>>,
    stop: CancellationToken,
}

impl QueueTask {
    async fn run(self) {
        info!(
            workers = self.config.workers,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            max_attempts = self.ctx.settings.max_attempts,
            "starting run queue",
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                () = self.stop.cancelled() => {
                    info!("run queue shutting down");
                    break;
                }
                _ = ticker.tick() => {}
                () = self.wake.notified() => {}
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(err) = joined {
                    error!(?err, "run task panicked");
                }
            }
            self.claim_and_dispatch(&semaphore, &mut tasks).await;
            self.record_stats().await;
        }

        self.drain(tasks).await;
    }

    async fn claim_and_dispatch(&self, semaphore: &Arc<Semaphore>, tasks: &mut JoinSet<()>) {
        let available = semaphore.available_permits();
        if available == 0 {
            return;
        }

        let runs = match self.ctx.runs.next(available).await {
            Ok(runs) => runs,
            Err(err) => {
                error!(error = %err, "failed to claim runs");
                return;
            }
        };
        if runs.is_empty() {
            return;
        }
        debug!(count = runs.len(), "dispatching runs");

        for run in runs {
            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                warn!(run_id = %run.run_id, "no worker slot left, returning run to the queue");
                if let Err(err) = self.ctx.runs.set_status(run.run_id, RunStatus::Pending).await {
                    error!(error = %err, "failed to requeue run");
                }
                continue;
            };
            let ctx = self.ctx.clone();
            let wake = Arc::clone(&self.wake);
            let webhooks = self.webhooks.clone();
            tasks.spawn(Self::dispatch(ctx, wake, webhooks, run, permit));
        }
    }

    async fn dispatch(
        ctx: WorkerContext,
        wake: Arc<Notify>,
        webhooks: Option<Arc<WebhookDispatcher>>,
        run: Run,
        permit: OwnedSemaphorePermit,
    ) {
        let outcome = worker::execute(&ctx, run).await;
        drop(permit);
        // A slot is free and the thread may have queued work behind this run.
        wake.notify_one();

        match outcome {
            Ok(result) => {
                if let Some(webhooks) = webhooks {
                    if result.run.kwargs.webhook.is_some() {
                        webhooks.dispatch(&result).await;
                    }
                }
            }
            Err(WorkerError::Retry { .. }) => {}
            Err(err @ WorkerError::Shutdown { .. }) => info!(%err),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    async fn record_stats(&self) {
        let stats = match self.ctx.runs.stats().await {
            Ok(stats) => stats,
            Err(err) => {
                debug!(error = %err, "failed to read queue stats");
                return;
            }
        };
        metrics::gauge!("run_queue_pending").set(stats.n_pending as f64);
        metrics::gauge!("run_queue_running").set(stats.n_running as f64);
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        info!(
            inflight = tasks.len(),
            grace_secs = self.config.shutdown_grace.as_secs(),
            "waiting for in-flight runs"
        );

        let finished = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    error!(?err, "run task panicked");
                }
            }
        })
        .await;

        if finished.is_err() {
            warn!(
                inflight = tasks.len(),
                "grace period elapsed, cancelling in-flight runs"
            );
            self.ctx.shutdown.cancel();
            while tasks.join_next().await.is_some() {}
        }
    }
}
