//! Postgres-backed task store.
//!
//! The poll step runs inside a single transaction: due rows are claimed
//! with `FOR UPDATE SKIP LOCKED`, handed to the batch runner, and their
//! outcomes are written back before the commit releases the row locks.
//! Competing workers therefore partition the eligible set among themselves
//! without a broker, and a claimed row receives exactly the state
//! transition its executing worker decided on, even if another worker
//! polls the same queue concurrently.
//!
//! ## Thread Safety
//!
//! `PostgresTaskStore` is `Send + Sync` and can be shared across tasks.
//! All operations go through the sqlx connection pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, instrument};
use uuid::Uuid;

use drudge_core::{Disposition, Task, TaskId, TaskStatus};
use drudge_observability::metrics::TASKS_SUBMIT_TOTAL;

use crate::error::StoreError;
use crate::store::{
    BatchRunner, NewTask, PollOutcome, QueueStats, ScheduledFiring, TaskStore,
};

const TASK_COLUMNS: &str = "id, name, props, queue, priority, max_retries, retry_num, \
     status, error, scheduled_at, modified_at, completed_at";

const INSERT_TASK: &str = "\
    INSERT INTO task (id, name, props, queue, priority, max_retries, retry_num, status, \
                      scheduled_at, modified_at) \
    VALUES ($1, $2, $3, $4, $5, $6, 0, 'new', \
            clock_timestamp() + ($7 || ' milliseconds')::interval, clock_timestamp())";

const CLAIM_DUE: &str = "\
    SELECT id, name, props, queue, priority, max_retries, retry_num, \
           status, error, scheduled_at, modified_at, completed_at \
    FROM task \
    WHERE scheduled_at <= now() \
      AND queue = $1 \
      AND status IN ('new', 'retry') \
    ORDER BY priority DESC, scheduled_at ASC \
    LIMIT $2 \
    FOR UPDATE SKIP LOCKED";

const MARK_RETRY: &str = "\
    UPDATE task \
    SET scheduled_at = clock_timestamp() + ($2 || ' milliseconds')::interval, \
        modified_at = clock_timestamp(), \
        error = $3, \
        status = 'retry', \
        retry_num = retry_num + $4 \
    WHERE id = $1";

const MARK_FAILED: &str =
    "UPDATE task SET error = $2, modified_at = now(), status = 'failed' WHERE id = $1";

const MARK_COMPLETED: &str = "\
    UPDATE task SET completed_at = now(), modified_at = now(), status = 'completed' \
    WHERE id = $1";

const UPSERT_SCHEDULE: &str = "\
    INSERT INTO scheduled_task (id, cron_expr) VALUES ($1, $2) \
    ON CONFLICT (id) DO UPDATE SET cron_expr = EXCLUDED.cron_expr";

const LOCK_SCHEDULE: &str =
    "SELECT id FROM scheduled_task WHERE id = $1 FOR UPDATE SKIP LOCKED";

#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a task as part of the caller's transaction.
    ///
    /// The row becomes visible to workers only when the caller commits,
    /// which makes task submission atomic with the caller's own writes.
    pub async fn submit_in(
        conn: &mut PgConnection,
        new_task: &NewTask,
    ) -> Result<TaskId, StoreError> {
        new_task.validate()?;

        let id = TaskId::new();
        sqlx::query(INSERT_TASK)
            .bind(id.as_uuid())
            .bind(&new_task.name)
            .bind(&new_task.props)
            .bind(&new_task.queue)
            .bind(new_task.priority)
            .bind(new_task.max_retries)
            .bind(new_task.delay.as_millis().to_string())
            .execute(conn)
            .await?;

        counter!(TASKS_SUBMIT_TOTAL, "name" => new_task.name.clone()).increment(1);
        Ok(id)
    }

    async fn apply(
        tx: &mut PgConnection,
        id: TaskId,
        disposition: Disposition,
    ) -> Result<(), StoreError> {
        match disposition {
            Disposition::Completed => {
                sqlx::query(MARK_COMPLETED)
                    .bind(id.as_uuid())
                    .execute(tx)
                    .await?;
            }
            Disposition::Retry {
                delay,
                increment,
                error,
            } => {
                sqlx::query(MARK_RETRY)
                    .bind(id.as_uuid())
                    .bind(delay.as_millis().to_string())
                    .bind(error)
                    .bind(increment)
                    .execute(tx)
                    .await?;
            }
            Disposition::Failed { error } => {
                sqlx::query(MARK_FAILED)
                    .bind(id.as_uuid())
                    .bind(error)
                    .execute(tx)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn submit(&self, new_task: NewTask) -> Result<TaskId, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::submit_in(&mut conn, &new_task).await
    }

    async fn fetch(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM task WHERE id = $1");
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    #[instrument(skip_all, fields(queue = %queue))]
    async fn poll(
        &self,
        queue: &str,
        batch_size: i64,
        runner: &dyn BatchRunner,
    ) -> Result<PollOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<TaskRow> = sqlx::query_as(CLAIM_DUE)
            .bind(queue)
            .bind(batch_size)
            .fetch_all(&mut *tx)
            .await?;
        if rows.is_empty() {
            tx.commit().await?;
            return Ok(PollOutcome::Empty);
        }
        debug!(claimed = rows.len(), "claimed batch");

        let mut batch = Vec::with_capacity(rows.len());
        for row in rows {
            batch.push(Task::try_from(row)?);
        }
        let claimed = batch.len();

        // The row locks are held across handler execution so that outcome
        // persistence and the claim are one atomic step.
        let outcomes = runner.run_batch(batch).await;
        for (id, disposition) in outcomes {
            Self::apply(&mut *tx, id, disposition).await?;
        }

        tx.commit().await?;
        Ok(PollOutcome::Handled(claimed))
    }

    async fn upsert_schedule(&self, id: &str, cron_expr: &str) -> Result<(), StoreError> {
        sqlx::query(UPSERT_SCHEDULE)
            .bind(id)
            .bind(cron_expr)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fire_scheduled(
        &self,
        id: &str,
        firing: &dyn ScheduledFiring,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<String> = sqlx::query_scalar(LOCK_SCHEDULE)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let fired = locked.is_some();
        if fired {
            // If several nodes armed this entry, only the lock winner gets
            // here; the rest observe a locked row and skip this window.
            firing.fire().await;
        }

        tx.commit().await?;
        Ok(fired)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM task WHERE queue = $1 GROUP BY status")
                .bind(queue)
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.parse::<TaskStatus>() {
                Ok(TaskStatus::New) => stats.new = count,
                Ok(TaskStatus::Retry) => stats.retry = count,
                Ok(TaskStatus::Completed) => stats.completed = count,
                Ok(TaskStatus::Failed) => stats.failed = count,
                Err(_) => {}
            }
        }
        Ok(stats)
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    name: String,
    props: serde_json::Value,
    queue: String,
    priority: i32,
    max_retries: i32,
    retry_num: i32,
    status: String,
    error: Option<String>,
    scheduled_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<TaskStatus>()
            .map_err(|err| StoreError::Validation(format!("corrupt task row: {err}")))?;
        Ok(Task {
            id: TaskId::from_uuid(row.id),
            name: row.name,
            props: row.props,
            queue: row.queue,
            priority: row.priority,
            max_retries: row.max_retries,
            retry_num: row.retry_num,
            status,
            error: row.error,
            scheduled_at: row.scheduled_at,
            modified_at: row.modified_at,
            completed_at: row.completed_at,
        })
    }
}
