use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use std::collections::HashSet;
use uuid::Uuid;

use crate::domain::{
    Assistant, CancelAction, Checkpoint, IfNotExists, Metadata, Run, RunStatus, RunUser, Thread,
};
use crate::error::StoreError;
use crate::store::checkpoint::{CheckpointStore, stamped};
use crate::store::runs::{
    Admission, CancelOutcome, NewRun, QueueStats, RunStore, admit_to_thread, admitted_run,
    conclude_thread, no_inflight_runs, refresh_busy,
};

/// Opens a pool and brings the schema up to date.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Checkpoints persisted in a Postgres `checkpoints` table.
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<Checkpoint, StoreError> {
    let Json(checkpoint): Json<Checkpoint> = row.try_get("data")?;
    Ok(checkpoint)
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn get(
        &self,
        thread_id: Uuid,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let row = match checkpoint_id {
            Some(id) => {
                sqlx::query(
                    "SELECT data FROM checkpoints WHERE thread_id = $1 AND checkpoint_id = $2 LIMIT 1",
                )
                .bind(thread_id)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r"
                    SELECT data FROM checkpoints
                    WHERE thread_id = $1 AND checkpoint_ns = ''
                    ORDER BY seq DESC
                    LIMIT 1
                    ",
                )
                .bind(thread_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.as_ref().map(decode).transpose()
    }

    async fn put(
        &self,
        thread_id: Uuid,
        checkpoint: &Checkpoint,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let stored = stamped(checkpoint, metadata);
        let run_id = stored.run_id().and_then(|id| Uuid::parse_str(id).ok());

        sqlx::query(
            r"
            INSERT INTO checkpoints
                (thread_id, checkpoint_ns, checkpoint_id, parent_checkpoint_id, run_id, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (thread_id, checkpoint_ns, checkpoint_id) DO UPDATE SET
                data = EXCLUDED.data,
                run_id = EXCLUDED.run_id
            ",
        )
        .bind(thread_id)
        .bind(&stored.checkpoint_ns)
        .bind(&stored.checkpoint_id)
        .bind(&stored.parent_checkpoint_id)
        .bind(run_id)
        .bind(Json(&stored))
        .bind(stored.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self, thread_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        let rows = sqlx::query("SELECT data FROM checkpoints WHERE thread_id = $1 ORDER BY seq")
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(decode).collect()
    }

    async fn delete_for_run(&self, thread_id: Uuid, run_id: Uuid) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE thread_id = $1 AND run_id = $2")
            .bind(thread_id)
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn delete_thread(&self, thread_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Runs, threads and assistants persisted in Postgres.
///
/// Every write runs in a transaction. Thread rows are locked before run
/// rows, so admission, claiming and cancellation of runs on one thread
/// serialize on that thread's row.
#[derive(Debug, Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const CLAIM_CANDIDATES: &str = r"
    WITH candidates AS (
        SELECT DISTINCT ON (r.thread_id) r.run_id, r.thread_id, r.created_at, r.seq
        FROM runs r
        WHERE r.status = 'pending'
          AND r.created_at <= $1
          AND NOT EXISTS (
              SELECT 1 FROM runs x WHERE x.thread_id = r.thread_id AND x.status = 'running'
          )
        ORDER BY r.thread_id, r.created_at, r.seq
    )
    SELECT run_id, thread_id FROM candidates
    ORDER BY created_at, seq
    LIMIT $2
";

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn decode_run(row: &PgRow) -> Result<Run, StoreError> {
    let Json(mut run): Json<Run> = row.try_get("data")?;
    let user: Option<Json<RunUser>> = row.try_get("run_user")?;
    run.kwargs.user = user.map(|Json(user)| user);
    Ok(run)
}

fn decode_thread(row: &PgRow) -> Result<Thread, StoreError> {
    let Json(thread): Json<Thread> = row.try_get("data")?;
    Ok(thread)
}

fn decode_assistant(row: &PgRow) -> Result<Assistant, StoreError> {
    let Json(assistant): Json<Assistant> = row.try_get("data")?;
    Ok(assistant)
}

async fn lock_thread(conn: &mut PgConnection, thread_id: Uuid) -> Result<Option<Thread>, StoreError> {
    let row = sqlx::query("SELECT data FROM threads WHERE thread_id = $1 FOR UPDATE")
        .bind(thread_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(decode_thread).transpose()
}

async fn insert_thread(conn: &mut PgConnection, thread: &Thread) -> Result<(), StoreError> {
    sqlx::query(
        r"
        INSERT INTO threads (thread_id, data, created_at, updated_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (thread_id) DO NOTHING
        ",
    )
    .bind(thread.thread_id)
    .bind(Json(thread))
    .bind(thread.created_at)
    .bind(thread.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn save_thread(conn: &mut PgConnection, thread: &Thread) -> Result<(), StoreError> {
    sqlx::query("UPDATE threads SET data = $2, updated_at = $3 WHERE thread_id = $1")
        .bind(thread.thread_id)
        .bind(Json(thread))
        .bind(thread.updated_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_run(conn: &mut PgConnection, run: &Run) -> Result<(), StoreError> {
    sqlx::query(
        r"
        INSERT INTO runs (run_id, thread_id, status, created_at, updated_at, data, run_user)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ",
    )
    .bind(run.run_id)
    .bind(run.thread_id)
    .bind(run.status.as_str())
    .bind(run.created_at)
    .bind(run.updated_at)
    .bind(Json(run))
    .bind(run.kwargs.user.as_ref().map(Json))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn save_run(conn: &mut PgConnection, run: &Run) -> Result<(), StoreError> {
    sqlx::query("UPDATE runs SET status = $2, updated_at = $3, data = $4 WHERE run_id = $1")
        .bind(run.run_id)
        .bind(run.status.as_str())
        .bind(run.updated_at)
        .bind(Json(run))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn lock_run(conn: &mut PgConnection, run_id: Uuid) -> Result<Option<Run>, StoreError> {
    let row = sqlx::query("SELECT data, run_user FROM runs WHERE run_id = $1 FOR UPDATE")
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(decode_run).transpose()
}

async fn inflight(conn: &mut PgConnection, thread_id: Uuid) -> Result<Vec<Run>, StoreError> {
    let rows = sqlx::query(
        r"
        SELECT data, run_user FROM runs
        WHERE thread_id = $1 AND status IN ('pending', 'running')
        ORDER BY created_at, seq
        ",
    )
    .bind(thread_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(decode_run).collect()
}

async fn has_status(
    conn: &mut PgConnection,
    thread_id: Uuid,
    statuses: &[&str],
) -> Result<bool, StoreError> {
    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM runs WHERE thread_id = $1 AND status = ANY($2))",
    )
    .bind(thread_id)
    .bind(statuses)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn put_assistant(&self, assistant: Assistant) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO assistants (assistant_id, data, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (assistant_id) DO UPDATE SET data = EXCLUDED.data
            ",
        )
        .bind(assistant.assistant_id)
        .bind(Json(&assistant))
        .bind(assistant.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_assistant(&self, assistant_id: Uuid) -> Result<Option<Assistant>, StoreError> {
        let row = sqlx::query("SELECT data FROM assistants WHERE assistant_id = $1")
            .bind(assistant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_assistant).transpose()
    }

    async fn create_thread(
        &self,
        thread_id: Uuid,
        metadata: Metadata,
    ) -> Result<Thread, StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_thread(&mut tx, &Thread::new(thread_id, metadata)).await?;
        let thread = lock_thread(&mut tx, thread_id)
            .await?
            .ok_or_else(|| StoreError::not_found("thread", thread_id))?;
        tx.commit().await?;
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: Uuid) -> Result<Option<Thread>, StoreError> {
        let row = sqlx::query("SELECT data FROM threads WHERE thread_id = $1")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_thread).transpose()
    }

    async fn delete_thread(&self, thread_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let mut tx = self.pool.begin().await?;
        if lock_thread(&mut tx, thread_id).await?.is_none() {
            return Err(StoreError::not_found("thread", thread_id));
        }
        let inflight = inflight(&mut tx, thread_id)
            .await?
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        // Runs go with the thread through the foreign key.
        sqlx::query("DELETE FROM threads WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(inflight)
    }

    async fn put(&self, new: NewRun) -> Result<Admission, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let assistant = sqlx::query("SELECT data FROM assistants WHERE assistant_id = $1")
            .bind(new.assistant_id)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(decode_assistant)
            .transpose()?
            .ok_or_else(|| StoreError::not_found("assistant", new.assistant_id))?;

        let thread_id = new.thread_id.unwrap_or_else(Uuid::new_v4);
        let mut thread = match lock_thread(&mut tx, thread_id).await? {
            Some(thread) => thread,
            None if new.thread_id.is_none() || new.if_not_exists == IfNotExists::Create => {
                insert_thread(&mut tx, &Thread::new(thread_id, Metadata::new())).await?;
                lock_thread(&mut tx, thread_id)
                    .await?
                    .ok_or_else(|| StoreError::not_found("thread", thread_id))?
            }
            None => return Err(StoreError::not_found("thread", thread_id)),
        };

        let inflight = inflight(&mut tx, thread_id).await?;
        if new.prevent_insert_if_inflight && !inflight.is_empty() {
            tx.commit().await?;
            return Ok(Admission::Refused {
                thread_id,
                inflight,
            });
        }

        let run = admitted_run(new, &assistant, thread_id, now);
        admit_to_thread(&mut thread, &run, now);
        save_thread(&mut tx, &thread).await?;
        insert_run(&mut tx, &run).await?;
        tx.commit().await?;

        Ok(Admission::Created { run, inflight })
    }

    async fn next(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let candidates: Vec<(Uuid, Uuid)> = sqlx::query_as(CLAIM_CANDIDATES)
            .bind(now)
            .bind(to_i64(limit))
            .fetch_all(&mut *tx)
            .await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // Threads locked by another claimer or an admission are left for
        // the next poll.
        let thread_ids: Vec<Uuid> = candidates.iter().map(|(_, thread_id)| *thread_id).collect();
        let locked: HashSet<Uuid> = sqlx::query_scalar::<_, Uuid>(
            "SELECT thread_id FROM threads WHERE thread_id = ANY($1) ORDER BY thread_id FOR UPDATE SKIP LOCKED",
        )
        .bind(&thread_ids)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .collect();

        let mut claimed = Vec::new();
        for (run_id, thread_id) in candidates {
            if !locked.contains(&thread_id) || has_status(&mut tx, thread_id, &["running"]).await? {
                continue;
            }
            let Some(mut run) = lock_run(&mut tx, run_id).await? else {
                continue;
            };
            if run.status != RunStatus::Pending {
                continue;
            }
            run.status = RunStatus::Running;
            run.attempt += 1;
            run.updated_at = now;
            save_run(&mut tx, &run).await?;
            claimed.push(run);
        }
        tx.commit().await?;
        Ok(claimed)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query("SELECT data, run_user FROM runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_run).transpose()
    }

    async fn search(
        &self,
        thread_id: Uuid,
        status: Option<RunStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT data, run_user FROM runs
            WHERE thread_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, seq DESC
            LIMIT $3 OFFSET $4
            ",
        )
        .bind(thread_id)
        .bind(status.map(RunStatus::as_str))
        .bind(to_i64(limit))
        .bind(to_i64(offset))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_run).collect()
    }

    async fn set_status(&self, run_id: Uuid, status: RunStatus) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut run = lock_run(&mut tx, run_id)
            .await?
            .ok_or_else(|| StoreError::not_found("run", run_id))?;
        run.status = status;
        run.updated_at = Utc::now();
        save_run(&mut tx, &run).await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let mut thread = lock_thread(&mut tx, thread_id)
            .await?
            .ok_or_else(|| StoreError::not_found("thread", thread_id))?;
        let mut run = lock_run(&mut tx, run_id)
            .await?
            .ok_or_else(|| StoreError::not_found("run", run_id))?;

        run.status = status;
        run.updated_at = now;
        save_run(&mut tx, &run).await?;

        let others_inflight = has_status(&mut tx, thread_id, &["pending", "running"]).await?;
        conclude_thread(&mut thread, status, checkpoint, error, others_inflight, now);
        save_thread(&mut tx, &thread).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn cancel(
        &self,
        thread_id: Option<Uuid>,
        run_ids: &[Uuid],
        action: CancelAction,
    ) -> Result<CancelOutcome, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let thread_ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT DISTINCT thread_id FROM runs
            WHERE run_id = ANY($1) AND ($2::uuid IS NULL OR thread_id = $2)
            ",
        )
        .bind(run_ids)
        .bind(thread_id)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("SELECT thread_id FROM threads WHERE thread_id = ANY($1) ORDER BY thread_id FOR UPDATE")
            .bind(&thread_ids)
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(
            r"
            SELECT data, run_user FROM runs
            WHERE run_id = ANY($1)
              AND ($2::uuid IS NULL OR thread_id = $2)
              AND status IN ('pending', 'running')
            ORDER BY created_at, seq
            FOR UPDATE
            ",
        )
        .bind(run_ids)
        .bind(thread_id)
        .fetch_all(&mut *tx)
        .await?;
        let targets = rows.iter().map(decode_run).collect::<Result<Vec<_>, _>>()?;
        if targets.is_empty() {
            return Err(no_inflight_runs(run_ids));
        }

        let mut outcome = CancelOutcome::default();
        let mut touched = HashSet::new();
        for mut run in targets {
            touched.insert((run.thread_id, run.kwargs.temporary));
            if run.status == RunStatus::Running {
                outcome.signal.push(run.run_id);
                continue;
            }
            run.status = RunStatus::cancelled_by(action);
            run.updated_at = now;
            save_run(&mut tx, &run).await?;
            outcome.finalized.push(run.run_id);
        }

        for (thread_id, temporary) in touched {
            let busy = has_status(&mut tx, thread_id, &["pending", "running"]).await?;
            if temporary && !busy {
                sqlx::query("DELETE FROM threads WHERE thread_id = $1")
                    .bind(thread_id)
                    .execute(&mut *tx)
                    .await?;
                outcome.deleted_threads.push(thread_id);
            } else if let Some(mut thread) = lock_thread(&mut tx, thread_id).await? {
                refresh_busy(&mut thread, busy, now);
                save_thread(&mut tx, &thread).await?;
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let row = sqlx::query(
            r"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS n_pending,
                COUNT(*) FILTER (WHERE status = 'running') AS n_running,
                MIN(created_at) FILTER (WHERE status = 'pending') AS oldest_pending
            FROM runs
            ",
        )
        .fetch_one(&self.pool)
        .await?;

        let n_pending: i64 = row.try_get("n_pending")?;
        let n_running: i64 = row.try_get("n_running")?;
        let oldest_pending: Option<DateTime<Utc>> = row.try_get("oldest_pending")?;
        Ok(QueueStats {
            n_pending: usize::try_from(n_pending).unwrap_or_default(),
            n_running: usize::try_from(n_running).unwrap_or_default(),
            oldest_pending,
        })
    }
}
