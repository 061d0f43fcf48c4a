//! Postgres-backed job store.
//!
//! ## Locking
//!
//! Every session runs `SET LOCAL lock_timeout` right after `BEGIN`, so a
//! `SELECT ... FOR UPDATE` on a row held by another worker fails after the
//! configured wait instead of blocking the execution slot indefinitely.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (lock not available, "lock timeout") | `55P03` | `LockWaitTimeout` | `lock_timeout` expired on a locking read |
//! | Database (lock not available, other) | `55P03` | `RowLocked` | `NOWAIT` read on a locked row |
//! | Database (unique violation) | `23505` | `AlreadyExists` | Duplicate job id on insert |
//! | Database (check constraint violation) | `23514` | `Constraint` | e.g. `trys > try_max` |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / Io / Tls / other | N/A | `Storage` | Connection failures |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgExecutor, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use cirrus_core::{Job, JobChanges, JobId, JobStatus, ProjectId};

use super::store::{JobPage, JobQuery, JobStore, JobTransaction, StoreError};
use crate::config::DatabaseSettings;

const JOB_COLUMNS: &str = "id, project_id, action, status, params, result, error, run_at, \
                           try_period, try_max, trys, created, updated";

const FILTER_CLAUSE: &str = r#"
    WHERE ($1::uuid[] IS NULL OR id = ANY($1))
      AND ($2::text[] IS NULL OR project_id = ANY($2))
      AND ($3::text[] IS NULL OR status = ANY($3))
      AND ($4::timestamptz IS NULL OR run_at <= $4)
"#;

/// Postgres-backed job store.
///
/// `Send + Sync`; all access goes through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    lock_timeout: Duration,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            lock_timeout,
        }
    }

    /// Open a pool from settings.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
            .connect(&settings.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Duration::from_millis(settings.lock_timeout_ms)))
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), err)]
    async fn begin(&self) -> Result<Box<dyn JobTransaction>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // SET does not take bind parameters; the value is an integer we own.
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        Ok(Box::new(PostgresJobTransaction { tx }))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        fetch_job(&*self.pool, id, false).await
    }

    #[instrument(skip(self, changes), fields(job_id = %id), err)]
    async fn update(&self, id: JobId, changes: &JobChanges) -> Result<u64, StoreError> {
        update_job(&*self.pool, id, changes).await
    }

    #[instrument(skip(self), fields(total = tracing::field::Empty), err)]
    async fn list(&self, query: &JobQuery) -> Result<JobPage, StoreError> {
        let filter = &query.filter;
        let ids: Option<Vec<Uuid>> = filter
            .ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| *id.as_uuid()).collect());
        let projects: Option<Vec<String>> = filter
            .project_ids
            .as_ref()
            .map(|ps| ps.iter().map(|p| p.as_str().to_string()).collect());
        let statuses: Option<Vec<String>> = filter
            .status
            .as_ref()
            .map(|ss| ss.iter().map(|s| s.as_str().to_string()).collect());

        let count_row = sqlx::query(&format!("SELECT COUNT(*) AS total FROM jobs {FILTER_CLAUSE}"))
            .bind(&ids)
            .bind(&projects)
            .bind(&statuses)
            .bind(filter.due_by)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;
        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| StoreError::Corrupt(format!("failed to read count: {e}")))?;

        let direction = query.order.as_sql();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs {FILTER_CLAUSE} \
             ORDER BY created {direction}, id {direction} LIMIT $5 OFFSET $6"
        );
        let rows = sqlx::query(&sql)
            .bind(&ids)
            .bind(&projects)
            .bind(&statuses)
            .bind(filter.due_by)
            .bind(query.limit.map(|l| l as i64))
            .bind(query.offset as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let items = rows
            .iter()
            .map(|row| JobRow::from_row(row).map_err(corrupt).and_then(Job::try_from))
            .collect::<Result<Vec<_>, _>>()?;

        Span::current().record("total", total);
        Ok(JobPage {
            items,
            total: total.max(0) as u64,
            offset: query.offset,
            limit: query.limit,
        })
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, action = %job.action), err)]
    async fn insert(&self, job: &Job) -> Result<JobId, StoreError> {
        sqlx::query(&format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(job.id.as_uuid())
        .bind(job.project_id.as_str())
        .bind(&job.action)
        .bind(job.status.as_str())
        .bind(&job.params)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.run_at)
        .bind(to_int("try_period", job.try_period)?)
        .bind(to_int("try_max", job.try_max)?)
        .bind(to_int("trys", job.trys)?)
        .bind(job.created)
        .bind(job.updated)
        .execute(&*self.pool)
        .await
        .map_err(|e| match db_code(&e).as_deref() {
            Some("23505") => StoreError::AlreadyExists(job.id),
            _ => map_sqlx_error("insert_job", e),
        })?;

        Ok(job.id)
    }
}

/// Session on a [`PostgresJobStore`].
///
/// Dropping it without commit lets SQLx roll the transaction back when the
/// connection returns to the pool.
#[derive(Debug)]
pub struct PostgresJobTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl JobTransaction for PostgresJobTransaction {
    async fn get(&mut self, id: JobId, lock: bool) -> Result<Option<Job>, StoreError> {
        fetch_job(&mut *self.tx, id, lock).await
    }

    async fn update(&mut self, id: JobId, changes: &JobChanges) -> Result<u64, StoreError> {
        update_job(&mut *self.tx, id, changes).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

async fn fetch_job<'e, E>(executor: E, id: JobId, lock: bool) -> Result<Option<Job>, StoreError>
where
    E: PgExecutor<'e>,
{
    let lock_clause = if lock { "FOR UPDATE" } else { "" };
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 {lock_clause}"))
        .bind(id.as_uuid())
        .fetch_optional(executor)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

    row.map(|row| JobRow::from_row(&row).map_err(corrupt).and_then(Job::try_from))
        .transpose()
}

/// Narrow a counter to the `INTEGER` column type.
fn to_int(column: &str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Constraint(format!("{column} ({value}) exceeds the column range")))
}

async fn update_job<'e, E>(executor: E, id: JobId, changes: &JobChanges) -> Result<u64, StoreError>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE jobs SET
            status  = COALESCE($2, status),
            run_at  = COALESCE($3, run_at),
            trys    = COALESCE($4, trys),
            error   = CASE WHEN $5 THEN $6 ELSE error END,
            params  = COALESCE($7, params),
            result  = CASE WHEN $8 THEN $9 ELSE result END,
            updated = COALESCE($10, updated)
        WHERE id = $1
        "#,
    )
    .bind(id.as_uuid())
    .bind(changes.status.map(|s| s.as_str()))
    .bind(changes.run_at)
    .bind(changes.trys.map(|t| to_int("trys", t)).transpose()?)
    .bind(changes.error.is_some())
    .bind(changes.error.clone().flatten())
    .bind(changes.params.as_ref())
    .bind(changes.result.is_some())
    .bind(changes.result.clone().flatten())
    .bind(changes.updated)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("update_job", e))?;

    Ok(result.rows_affected())
}

fn db_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn corrupt(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(format!("failed to deserialize job row: {err}"))
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("55P03") if db_err.message().contains("lock timeout") => {
                    StoreError::LockWaitTimeout
                }
                Some("55P03") => StoreError::RowLocked,
                Some("23514") => StoreError::Constraint(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        other => StoreError::Storage(format!("{} failed: {}", operation, other)),
    }
}

/// Raw `jobs` row.
#[derive(Debug)]
struct JobRow {
    id: Uuid,
    project_id: String,
    action: String,
    status: String,
    params: Value,
    result: Option<Value>,
    error: Option<String>,
    run_at: DateTime<Utc>,
    try_period: i32,
    try_max: i32,
    trys: i32,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            action: row.try_get("action")?,
            status: row.try_get("status")?,
            params: row.try_get("params")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            run_at: row.try_get("run_at")?,
            try_period: row.try_get("try_period")?,
            try_max: row.try_get("try_max")?,
            trys: row.try_get("trys")?,
            created: row.try_get("created")?,
            updated: row.try_get("updated")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let non_negative = |field: &str, value: i32| {
            u32::try_from(value)
                .map_err(|_| StoreError::Corrupt(format!("{field} is negative: {value}")))
        };

        Ok(Job {
            id: JobId::from_uuid(row.id),
            project_id: ProjectId::new(row.project_id)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            action: row.action,
            status: row
                .status
                .parse::<JobStatus>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            params: row.params,
            result: row.result,
            error: row.error,
            run_at: row.run_at,
            try_period: non_negative("try_period", row.try_period)?,
            try_max: non_negative("try_max", row.try_max)?,
            trys: non_negative("trys", row.trys)?,
            created: row.created,
            updated: row.updated,
        })
    }
}
