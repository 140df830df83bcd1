//! Postgres run store integration tests.
//!
//! Covers:
//! - Atomic admission under concurrent submission
//! - Runs and threads outliving the store instance that wrote them
//! - Claiming and the recorded `rollback` status
//!
//! Requires: DATABASE_URL environment variable pointing to a Postgres instance.

use run_engine::domain::{
    Assistant, CancelAction, IfNotExists, Metadata, MultitaskStrategy, RunKwargs, RunStatus,
    StreamMode, ThreadStatus,
};
use run_engine::store::providers::{PostgresRunStore, connect};
use run_engine::store::{Admission, NewRun, RunStore};
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use uuid::Uuid;

async fn setup_store() -> Option<PostgresRunStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = connect(&url, 8).await.ok()?;
    Some(PostgresRunStore::new(pool))
}

fn new_run(assistant_id: Uuid, thread_id: Uuid) -> NewRun {
    NewRun {
        run_id: Uuid::new_v4(),
        assistant_id,
        thread_id: Some(thread_id),
        kwargs: RunKwargs {
            graph_id: String::new(),
            input: json!({"message": "hi"}),
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
        prevent_insert_if_inflight: true,
        if_not_exists: IfNotExists::Create,
        after_seconds: 0,
    }
}

async fn assistant(store: &PostgresRunStore) -> Uuid {
    let assistant = Assistant::system("echo");
    let id = assistant.assistant_id;
    store
        .put_assistant(assistant)
        .await
        .expect("Failed to save assistant");
    id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn concurrent_admission_creates_one_run() {
    let Some(store) = setup_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let store = Arc::new(store);
    let assistant_id = assistant(&store).await;
    let thread_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.put(new_run(assistant_id, thread_id)).await
        }));
    }
    let mut created = 0;
    for handle in handles {
        if let Admission::Created { .. } = handle.await.unwrap().expect("admission") {
            created += 1;
        }
    }
    assert_eq!(created, 1);

    let runs = store.search(thread_id, None, 100, 0).await.unwrap();
    assert_eq!(runs.len(), 1);
    store.delete_thread(thread_id).await.unwrap();
}

#[tokio::test]
#[serial]
async fn runs_survive_a_new_store_instance() {
    let Some(store) = setup_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let assistant_id = assistant(&store).await;
    let thread_id = Uuid::new_v4();
    let Admission::Created { run, .. } = store.put(new_run(assistant_id, thread_id)).await.unwrap()
    else {
        panic!("expected the run to be admitted");
    };

    let reopened = setup_store().await.expect("store");
    let stored = reopened.get_run(run.run_id).await.unwrap().expect("run");
    assert_eq!(stored.status, RunStatus::Pending);
    assert_eq!(stored.kwargs.graph_id, "echo");
    let thread = reopened.get_thread(thread_id).await.unwrap().expect("thread");
    assert_eq!(thread.status, ThreadStatus::Busy);

    reopened.delete_thread(thread_id).await.unwrap();
}

#[tokio::test]
#[serial]
async fn claimed_run_is_running_and_pending_rollback_is_recorded() {
    let Some(store) = setup_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let assistant_id = assistant(&store).await;
    let thread_id = Uuid::new_v4();

    let Admission::Created { run: first, .. } =
        store.put(new_run(assistant_id, thread_id)).await.unwrap()
    else {
        panic!("expected the run to be admitted");
    };
    let mut queued = new_run(assistant_id, thread_id);
    queued.prevent_insert_if_inflight = false;
    queued.multitask_strategy = MultitaskStrategy::Enqueue;
    let Admission::Created { run: second, .. } = store.put(queued).await.unwrap() else {
        panic!("expected the run to be admitted");
    };

    let claimed = store.next(100).await.unwrap();
    let claimed: Vec<Uuid> = claimed
        .into_iter()
        .filter(|run| run.thread_id == thread_id)
        .map(|run| {
            assert_eq!(run.status, RunStatus::Running);
            assert_eq!(run.attempt, 1);
            run.run_id
        })
        .collect();
    assert_eq!(claimed, vec![first.run_id]);

    let outcome = store
        .cancel(Some(thread_id), &[second.run_id], CancelAction::Rollback)
        .await
        .unwrap();
    assert_eq!(outcome.finalized, vec![second.run_id]);
    let second = store.get_run(second.run_id).await.unwrap().expect("run");
    assert_eq!(second.status, RunStatus::Rollback);

    store.delete_thread(thread_id).await.unwrap();
}
