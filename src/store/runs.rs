//! Run, thread and assistant records.
//!
//! [`RunStore`] is the contract; [`MemoryRunStore`] keeps the tables in
//! process and `providers::PostgresRunStore` keeps them in Postgres. Both
//! make admission, claims and status transitions atomic with respect to
//! each other.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::domain::{
    Assistant, CancelAction, Checkpoint, IfNotExists, Metadata, MultitaskStrategy, Run, RunKwargs,
    RunStatus, Thread, ThreadStatus,
};
use crate::error::StoreError;

/// Insert request for [`RunStore::put`].
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: Uuid,
    pub assistant_id: Uuid,
    pub thread_id: Option<Uuid>,
    pub kwargs: RunKwargs,
    pub metadata: Metadata,
    pub multitask_strategy: MultitaskStrategy,
    /// Refuse the insert when the thread already has in-flight runs.
    pub prevent_insert_if_inflight: bool,
    pub if_not_exists: IfNotExists,
    pub after_seconds: u64,
}

/// Result of an atomic admission attempt.
#[derive(Debug, Clone)]
pub enum Admission {
    /// The run was stored. `inflight` lists runs that were already
    /// pending or running on the thread.
    Created { run: Run, inflight: Vec<Run> },
    /// Nothing was stored because the thread had in-flight runs.
    Refused { thread_id: Uuid, inflight: Vec<Run> },
}

/// Effects of [`RunStore::cancel`] the caller still has to carry out.
#[derive(Debug, Clone, Default)]
pub struct CancelOutcome {
    /// Running runs whose workers must be signalled.
    pub signal: Vec<Uuid>,
    /// Pending runs that were finalized in the store.
    pub finalized: Vec<Uuid>,
    /// Temporary threads removed because their only run was cancelled.
    pub deleted_threads: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub n_pending: usize,
    pub n_running: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
}

/// Durable records for runs, the threads they execute on and the
/// assistants that name their graphs.
#[async_trait]
pub trait RunStore: Send + Sync + std::fmt::Debug {
    async fn put_assistant(&self, assistant: Assistant) -> Result<(), StoreError>;

    async fn get_assistant(&self, assistant_id: Uuid) -> Result<Option<Assistant>, StoreError>;

    /// Creates the thread, or returns it unchanged when it already exists.
    async fn create_thread(&self, thread_id: Uuid, metadata: Metadata)
    -> Result<Thread, StoreError>;

    async fn get_thread(&self, thread_id: Uuid) -> Result<Option<Thread>, StoreError>;

    /// Removes a thread and all of its runs. Returns the ids of runs that
    /// were still in flight.
    async fn delete_thread(&self, thread_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    /// Atomically admits a run.
    ///
    /// Resolves (or creates) the thread, marks it busy, checks for
    /// in-flight runs and inserts, as one step.
    async fn put(&self, new: NewRun) -> Result<Admission, StoreError>;

    /// Claims up to `limit` due pending runs, oldest first.
    ///
    /// A run is skipped while another run on its thread is running. Each
    /// claimed run moves to `running` with its attempt counter bumped.
    async fn next(&self, limit: usize) -> Result<Vec<Run>, StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError>;

    async fn get_thread_run(&self, thread_id: Uuid, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self
            .get_run(run_id)
            .await?
            .filter(|r| r.thread_id == thread_id))
    }

    async fn is_inflight(&self, run_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .get_run(run_id)
            .await?
            .is_some_and(|r| r.status.is_inflight()))
    }

    /// Runs of a thread, newest first.
    async fn search(
        &self,
        thread_id: Uuid,
        status: Option<RunStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Run>, StoreError>;

    async fn set_status(&self, run_id: Uuid, status: RunStatus) -> Result<(), StoreError>;

    /// Records a run's terminal status and derives the thread's state from
    /// it in one transaction.
    async fn set_joint_status(
        &self,
        thread_id: Uuid,
        run_id: Uuid,
        status: RunStatus,
        checkpoint: Option<&Checkpoint>,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Cancels in-flight runs.
    ///
    /// Pending runs are finalized here as `interrupted` or `rollback`.
    /// Running runs are reported back for signalling; their workers record
    /// the final status.
    async fn cancel(
        &self,
        thread_id: Option<Uuid>,
        run_ids: &[Uuid],
        action: CancelAction,
    ) -> Result<CancelOutcome, StoreError>;

    async fn stats(&self) -> Result<QueueStats, StoreError>;
}

/// The run record created by a successful admission.
pub(crate) fn admitted_run(
    new: NewRun,
    assistant: &Assistant,
    thread_id: Uuid,
    now: DateTime<Utc>,
) -> Run {
    let mut kwargs = new.kwargs;
    kwargs.graph_id.clone_from(&assistant.graph_id);
    let mut config = assistant.config.clone();
    config.extend(kwargs.config);
    kwargs.config = config;

    let delay = i64::try_from(new.after_seconds)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX);
    let created_at = now
        .checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    Run {
        run_id: new.run_id,
        thread_id,
        assistant_id: assistant.assistant_id,
        status: RunStatus::Pending,
        created_at,
        updated_at: now,
        kwargs,
        multitask_strategy: new.multitask_strategy,
        metadata: new.metadata,
        attempt: 0,
    }
}

/// Marks a thread busy for a newly admitted run.
pub(crate) fn admit_to_thread(thread: &mut Thread, run: &Run, now: DateTime<Utc>) {
    thread.status = ThreadStatus::Busy;
    thread.updated_at = now;
    for (key, value) in &run.metadata {
        thread.metadata.insert(key.clone(), value.clone());
    }
}

/// Derives a thread's state from the conclusion of one of its runs.
///
/// The thread takes the checkpoint's values; a rollback without a
/// checkpoint to fall back to clears them. Its base status is `error` for
/// failed runs, `interrupted` when the checkpoint has pending nodes and
/// `idle` otherwise; any other in-flight run makes it `busy`.
pub(crate) fn conclude_thread(
    thread: &mut Thread,
    status: RunStatus,
    checkpoint: Option<&Checkpoint>,
    error: Option<&str>,
    others_inflight: bool,
    now: DateTime<Utc>,
) {
    match checkpoint {
        Some(cp) => {
            thread.values = Some(cp.values.clone());
            thread.checkpoint_id = Some(cp.checkpoint_id.clone());
            thread.interrupts = cp.interrupts();
        }
        None if status == RunStatus::Rollback => {
            thread.values = None;
            thread.checkpoint_id = None;
            thread.interrupts.clear();
        }
        None => {}
    }

    thread.error = match status {
        RunStatus::Error => error.map(str::to_string),
        _ => None,
    };
    thread.status = if others_inflight {
        ThreadStatus::Busy
    } else if status == RunStatus::Error {
        ThreadStatus::Error
    } else if checkpoint.is_some_and(Checkpoint::is_paused) {
        ThreadStatus::Interrupted
    } else {
        ThreadStatus::Idle
    };
    thread.updated_at = now;
}

/// Busy while anything is in flight, otherwise back to idle.
pub(crate) fn refresh_busy(thread: &mut Thread, busy: bool, now: DateTime<Utc>) {
    if busy {
        thread.status = ThreadStatus::Busy;
    } else if thread.status == ThreadStatus::Busy {
        thread.status = ThreadStatus::Idle;
    }
    thread.updated_at = now;
}

pub(crate) fn no_inflight_runs(run_ids: &[Uuid]) -> StoreError {
    let id = run_ids
        .iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    StoreError::not_found("in-flight run", id)
}

#[derive(Debug, Default)]
struct Tables {
    assistants: HashMap<Uuid, Assistant>,
    threads: HashMap<Uuid, Thread>,
    runs: Vec<Run>,
}

impl Tables {
    fn run_mut(&mut self, run_id: Uuid) -> Option<&mut Run> {
        self.runs.iter_mut().find(|r| r.run_id == run_id)
    }

    fn inflight(&self, thread_id: Uuid) -> Vec<Run> {
        self.runs
            .iter()
            .filter(|r| r.thread_id == thread_id && r.status.is_inflight())
            .cloned()
            .collect()
    }

    fn has_inflight(&self, thread_id: Uuid) -> bool {
        self.runs
            .iter()
            .any(|r| r.thread_id == thread_id && r.status.is_inflight())
    }
}

/// In-process run store. Every operation takes the table lock exactly
/// once and never holds it across an `.await`.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    tables: Mutex<Tables>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn put_assistant(&self, assistant: Assistant) -> Result<(), StoreError> {
        self.tables()
            .assistants
            .insert(assistant.assistant_id, assistant);
        Ok(())
    }

    async fn get_assistant(&self, assistant_id: Uuid) -> Result<Option<Assistant>, StoreError> {
        Ok(self.tables().assistants.get(&assistant_id).cloned())
    }

    async fn create_thread(
        &self,
        thread_id: Uuid,
        metadata: Metadata,
    ) -> Result<Thread, StoreError> {
        Ok(self
            .tables()
            .threads
            .entry(thread_id)
            .or_insert_with(|| Thread::new(thread_id, metadata))
            .clone())
    }

    async fn get_thread(&self, thread_id: Uuid) -> Result<Option<Thread>, StoreError> {
        Ok(self.tables().threads.get(&thread_id).cloned())
    }

    async fn delete_thread(&self, thread_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let mut tables = self.tables();
        if tables.threads.remove(&thread_id).is_none() {
            return Err(StoreError::not_found("thread", thread_id));
        }
        let inflight = tables
            .inflight(thread_id)
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        tables.runs.retain(|r| r.thread_id != thread_id);
        Ok(inflight)
    }

    async fn put(&self, new: NewRun) -> Result<Admission, StoreError> {
        let now = Utc::now();
        let mut tables = self.tables();

        let assistant = tables
            .assistants
            .get(&new.assistant_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("assistant", new.assistant_id))?;

        let thread_id = match new.thread_id {
            Some(id) if tables.threads.contains_key(&id) => id,
            Some(id) if new.if_not_exists == IfNotExists::Create => {
                tables.threads.insert(id, Thread::new(id, Metadata::new()));
                id
            }
            Some(id) => return Err(StoreError::not_found("thread", id)),
            None => {
                let id = Uuid::new_v4();
                tables.threads.insert(id, Thread::new(id, Metadata::new()));
                id
            }
        };

        let inflight = tables.inflight(thread_id);
        if new.prevent_insert_if_inflight && !inflight.is_empty() {
            return Ok(Admission::Refused {
                thread_id,
                inflight,
            });
        }

        let run = admitted_run(new, &assistant, thread_id, now);
        if let Some(thread) = tables.threads.get_mut(&thread_id) {
            admit_to_thread(thread, &run, now);
        }
        tables.runs.push(run.clone());

        Ok(Admission::Created { run, inflight })
    }

    async fn next(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let now = Utc::now();
        let mut tables = self.tables();

        let mut busy: HashSet<Uuid> = tables
            .runs
            .iter()
            .filter(|r| r.status == RunStatus::Running)
            .map(|r| r.thread_id)
            .collect();

        // Insertion order breaks ties between equal timestamps.
        let mut due: Vec<(DateTime<Utc>, usize)> = tables
            .runs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == RunStatus::Pending && r.created_at <= now)
            .map(|(idx, r)| (r.created_at, idx))
            .collect();
        due.sort_unstable();

        let mut claimed = Vec::new();
        for (_, idx) in due {
            if claimed.len() >= limit {
                break;
            }
            let (run_id, thread_id) = (tables.runs[idx].run_id, tables.runs[idx].thread_id);
            if busy.contains(&thread_id) {
                continue;
            }
            if !tables.threads.contains_key(&thread_id) {
                tracing::warn!(%run_id, %thread_id, "Skipping run whose thread no longer exists");
                continue;
            }
            let run = &mut tables.runs[idx];
            run.status = RunStatus::Running;
            run.attempt += 1;
            run.updated_at = now;
            busy.insert(thread_id);
            claimed.push(run.clone());
        }
        Ok(claimed)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self
            .tables()
            .runs
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned())
    }

    async fn search(
        &self,
        thread_id: Uuid,
        status: Option<RunStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Run>, StoreError> {
        let tables = self.tables();
        let mut runs: Vec<Run> = tables
            .runs
            .iter()
            .filter(|r| r.thread_id == thread_id && status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs.into_iter().skip(offset).take(limit).collect())
    }

    async fn set_status(&self, run_id: Uuid, status: RunStatus) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let run = tables
            .run_mut(run_id)
            .ok_or_else(|| StoreError::not_found("run", run_id))?;
        run.status = status;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn set_joint_status(
        &self,
        thread_id: Uuid,
        run_id: Uuid,
        status: RunStatus,
        checkpoint: Option<&Checkpoint>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tables = self.tables();
        if !tables.threads.contains_key(&thread_id) {
            return Err(StoreError::not_found("thread", thread_id));
        }

        let run = tables
            .run_mut(run_id)
            .ok_or_else(|| StoreError::not_found("run", run_id))?;
        run.status = status;
        run.updated_at = now;

        let others_inflight = tables.has_inflight(thread_id);
        let Some(thread) = tables.threads.get_mut(&thread_id) else {
            return Err(StoreError::not_found("thread", thread_id));
        };
        conclude_thread(thread, status, checkpoint, error, others_inflight, now);
        Ok(())
    }

    async fn cancel(
        &self,
        thread_id: Option<Uuid>,
        run_ids: &[Uuid],
        action: CancelAction,
    ) -> Result<CancelOutcome, StoreError> {
        let now = Utc::now();
        let mut tables = self.tables();
        let targets: Vec<Run> = tables
            .runs
            .iter()
            .filter(|r| {
                run_ids.contains(&r.run_id)
                    && thread_id.is_none_or(|t| r.thread_id == t)
                    && r.status.is_inflight()
            })
            .cloned()
            .collect();

        if targets.is_empty() {
            return Err(no_inflight_runs(run_ids));
        }

        let mut outcome = CancelOutcome::default();
        let mut touched = HashSet::new();
        for run in targets {
            touched.insert((run.thread_id, run.kwargs.temporary));
            if run.status == RunStatus::Running {
                outcome.signal.push(run.run_id);
                continue;
            }
            if let Some(stored) = tables.run_mut(run.run_id) {
                stored.status = RunStatus::cancelled_by(action);
                stored.updated_at = now;
            }
            outcome.finalized.push(run.run_id);
        }

        for (thread_id, temporary) in touched {
            let busy = tables.has_inflight(thread_id);
            if temporary && !busy {
                tables.threads.remove(&thread_id);
                tables.runs.retain(|r| r.thread_id != thread_id);
                outcome.deleted_threads.push(thread_id);
            } else if let Some(thread) = tables.threads.get_mut(&thread_id) {
                refresh_busy(thread, busy, now);
            }
        }
        Ok(outcome)
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let tables = self.tables();
        let mut stats = QueueStats::default();
        for run in &tables.runs {
            match run.status {
                RunStatus::Pending => {
                    stats.n_pending += 1;
                    if stats.oldest_pending.is_none_or(|t| run.created_at < t) {
                        stats.oldest_pending = Some(run.created_at);
                    }
                }
                RunStatus::Running => stats.n_running += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StreamMode;
    use serde_json::json;
    use std::sync::Arc;

    async fn store_with_assistant() -> (MemoryRunStore, Uuid) {
        let store = MemoryRunStore::new();
        let assistant = Assistant::system("echo");
        let id = assistant.assistant_id;
        store.put_assistant(assistant).await.unwrap();
        (store, id)
    }

    async fn thread(store: &MemoryRunStore) -> Uuid {
        store
            .create_thread(Uuid::new_v4(), Metadata::new())
            .await
            .unwrap()
            .thread_id
    }

    fn new_run(assistant_id: Uuid, thread_id: Option<Uuid>, prevent: bool) -> NewRun {
        NewRun {
            run_id: Uuid::new_v4(),
            assistant_id,
            thread_id,
            kwargs: RunKwargs {
                graph_id: String::new(),
                input: json!({}),
                stream_mode: vec![StreamMode::Values],
                webhook: None,
                temporary: false,
                subgraphs: false,
                resumable: false,
                checkpoint_id: None,
                config: Metadata::new(),
                user: None,
            },
            metadata: Metadata::new(),
            multitask_strategy: MultitaskStrategy::Reject,
            prevent_insert_if_inflight: prevent,
            if_not_exists: IfNotExists::Reject,
            after_seconds: 0,
        }
    }

    fn created(admission: Admission) -> (Run, Vec<Run>) {
        match admission {
            Admission::Created { run, inflight } => (run, inflight),
            Admission::Refused { .. } => panic!("expected created"),
        }
    }

    async fn status(store: &MemoryRunStore, run_id: Uuid) -> RunStatus {
        store.get_run(run_id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn put_creates_busy_thread_and_fills_graph() {
        let (store, assistant) = store_with_assistant().await;
        let (run, inflight) = created(store.put(new_run(assistant, None, true)).await.unwrap());
        assert!(inflight.is_empty());
        assert_eq!(run.kwargs.graph_id, "echo");
        assert_eq!(run.status, RunStatus::Pending);
        let thread = store.get_thread(run.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Busy);
    }

    #[tokio::test]
    async fn put_rejects_unknown_thread_unless_create() {
        let (store, assistant) = store_with_assistant().await;
        let missing = Uuid::new_v4();
        let err = store
            .put(new_run(assistant, Some(missing), true))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "thread", .. }));

        let mut create = new_run(assistant, Some(missing), true);
        create.if_not_exists = IfNotExists::Create;
        let (run, _) = created(store.put(create).await.unwrap());
        assert_eq!(run.thread_id, missing);
    }

    #[tokio::test]
    async fn put_refuses_when_thread_has_inflight_runs() {
        let (store, assistant) = store_with_assistant().await;
        let thread = thread(&store).await;
        let (first, _) = created(store.put(new_run(assistant, Some(thread), true)).await.unwrap());

        match store.put(new_run(assistant, Some(thread), true)).await.unwrap() {
            Admission::Refused { inflight, .. } => {
                assert_eq!(inflight.len(), 1);
                assert_eq!(inflight[0].run_id, first.run_id);
            }
            Admission::Created { .. } => panic!("expected refusal"),
        }

        let (_, inflight) =
            created(store.put(new_run(assistant, Some(thread), false)).await.unwrap());
        assert_eq!(inflight.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admission_creates_one_run() {
        let (store, assistant) = store_with_assistant().await;
        let store = Arc::new(store);
        let thread = thread(&store).await;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .put(new_run(assistant, Some(thread), true))
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut created = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Admission::Created { .. }) {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn next_claims_one_run_per_thread_in_order() {
        let (store, assistant) = store_with_assistant().await;
        let thread = thread(&store).await;
        let (first, _) = created(store.put(new_run(assistant, Some(thread), false)).await.unwrap());
        let (second, _) =
            created(store.put(new_run(assistant, Some(thread), false)).await.unwrap());
        let (other, _) = created(store.put(new_run(assistant, None, false)).await.unwrap());

        let claimed = store.next(10).await.unwrap();
        let ids: Vec<Uuid> = claimed.iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![first.run_id, other.run_id]);
        assert!(claimed.iter().all(|r| r.attempt == 1));
        assert!(store.next(10).await.unwrap().is_empty());

        store
            .set_joint_status(thread, first.run_id, RunStatus::Success, None, None)
            .await
            .unwrap();
        let busy = store.get_thread(thread).await.unwrap().unwrap();
        assert_eq!(busy.status, ThreadStatus::Busy);
        let claimed = store.next(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].run_id, second.run_id);
    }

    #[tokio::test]
    async fn delayed_runs_wait_until_due() {
        let (store, assistant) = store_with_assistant().await;
        let mut delayed = new_run(assistant, None, false);
        delayed.after_seconds = 3600;
        store.put(delayed).await.unwrap();
        assert!(store.next(10).await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().n_pending, 1);
    }

    #[tokio::test]
    async fn retry_reset_bumps_attempt_on_next_claim() {
        let (store, assistant) = store_with_assistant().await;
        let (run, _) = created(store.put(new_run(assistant, None, false)).await.unwrap());
        assert_eq!(store.next(1).await.unwrap()[0].attempt, 1);
        store
            .set_status(run.run_id, RunStatus::Pending)
            .await
            .unwrap();
        assert_eq!(store.next(1).await.unwrap()[0].attempt, 2);
    }

    #[tokio::test]
    async fn joint_status_derives_thread_status() {
        let (store, assistant) = store_with_assistant().await;
        let (run, _) = created(store.put(new_run(assistant, None, false)).await.unwrap());
        store.next(1).await.unwrap();

        let mut paused = Checkpoint::new("cp", json!({"x": 1}));
        paused.next = vec!["approve".into()];
        store
            .set_joint_status(
                run.thread_id,
                run.run_id,
                RunStatus::Success,
                Some(&paused),
                None,
            )
            .await
            .unwrap();
        let thread = store.get_thread(run.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Interrupted);
        assert_eq!(thread.values, Some(json!({"x": 1})));
        assert_eq!(status(&store, run.run_id).await, RunStatus::Success);
    }

    #[tokio::test]
    async fn joint_status_error_and_rollback() {
        let (store, assistant) = store_with_assistant().await;
        let (run, _) = created(store.put(new_run(assistant, None, false)).await.unwrap());
        store
            .set_joint_status(
                run.thread_id,
                run.run_id,
                RunStatus::Error,
                None,
                Some("boom"),
            )
            .await
            .unwrap();
        let thread = store.get_thread(run.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Error);
        assert_eq!(thread.error.as_deref(), Some("boom"));

        let (second, _) = created(
            store
                .put(new_run(assistant, Some(run.thread_id), false))
                .await
                .unwrap(),
        );
        store
            .set_joint_status(run.thread_id, second.run_id, RunStatus::Rollback, None, None)
            .await
            .unwrap();
        assert_eq!(status(&store, second.run_id).await, RunStatus::Rollback);
        let thread = store.get_thread(run.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Idle);
        assert!(thread.values.is_none());
        assert!(thread.error.is_none());
    }

    #[tokio::test]
    async fn cancel_finalizes_pending_and_signals_running() {
        let (store, assistant) = store_with_assistant().await;
        let thread = thread(&store).await;
        let (running, _) =
            created(store.put(new_run(assistant, Some(thread), false)).await.unwrap());
        store.next(1).await.unwrap();
        let (pending, _) =
            created(store.put(new_run(assistant, Some(thread), false)).await.unwrap());

        let outcome = store
            .cancel(
                Some(thread),
                &[running.run_id, pending.run_id],
                CancelAction::Interrupt,
            )
            .await
            .unwrap();
        assert_eq!(outcome.signal, vec![running.run_id]);
        assert_eq!(outcome.finalized, vec![pending.run_id]);
        assert_eq!(status(&store, pending.run_id).await, RunStatus::Interrupted);
        assert_eq!(status(&store, running.run_id).await, RunStatus::Running);
        let thread = store.get_thread(thread).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Busy);
    }

    #[tokio::test]
    async fn cancel_rollback_of_pending_records_rollback() {
        let (store, assistant) = store_with_assistant().await;
        let thread = thread(&store).await;
        let (pending, _) =
            created(store.put(new_run(assistant, Some(thread), false)).await.unwrap());
        store
            .cancel(None, &[pending.run_id], CancelAction::Rollback)
            .await
            .unwrap();
        assert_eq!(status(&store, pending.run_id).await, RunStatus::Rollback);
        let thread = store.get_thread(thread).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Idle);
    }

    #[tokio::test]
    async fn cancel_of_finished_run_is_not_found() {
        let (store, assistant) = store_with_assistant().await;
        let (run, _) = created(store.put(new_run(assistant, None, false)).await.unwrap());
        store
            .set_status(run.run_id, RunStatus::Success)
            .await
            .unwrap();
        let err = store
            .cancel(None, &[run.run_id], CancelAction::Interrupt)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
