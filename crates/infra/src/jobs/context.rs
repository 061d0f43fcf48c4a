//! Per-execution context and the transaction / row-lock discipline.
//!
//! Every concurrently running unit of work (one per in-flight job) owns an
//! [`ExecutionContext`]. It carries the unit's correlation id and the two
//! discipline flags:
//!
//! - *in transaction*: a store session is open; reads and writes go through
//!   it and land together on commit
//! - *in lock*: reads request the row lock; a lock-wait expiry surfaces as
//!   [`JobError::LockTimeout`] instead of a storage fault
//!
//! Both flags are scoped by RAII guards and die with the context, so nothing
//! leaks between jobs.

use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::time::Instant;

use tracing::{Span, debug, info_span, warn};
use uuid::Uuid;

use cirrus_core::{Job, JobChanges, JobId};

use super::error::JobError;
use super::store::{JobStore, JobTransaction, StoreError};

/// State of one execution unit.
pub struct ExecutionContext {
    correlation_id: String,
    job_id: Option<JobId>,
    transaction: Option<Box<dyn JobTransaction>>,
    in_lock: bool,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::with_correlation_id(format!("ctx-{}", random_tag()))
    }

    /// Context for executing one job; the id ends with the job's short suffix.
    pub fn for_job(job_id: JobId) -> Self {
        let mut ctx =
            Self::with_correlation_id(format!("ctx-{}-{}", random_tag(), job_id.short()));
        ctx.job_id = Some(job_id);
        ctx
    }

    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            job_id: None,
            transaction: None,
            in_lock: false,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn in_lock(&self) -> bool {
        self.in_lock
    }

    /// Span that tags every log line of this unit with its correlation id.
    pub fn span(&self) -> Span {
        match self.job_id {
            Some(job_id) => info_span!("execution", ctx = %self.correlation_id, job_id = %job_id),
            None => info_span!("execution", ctx = %self.correlation_id),
        }
    }

    /// Enter a transaction scope.
    ///
    /// The outermost scope opens a store session; nested scopes reuse it and
    /// leave commit/rollback to the outermost one.
    pub async fn transaction(
        &mut self,
        store: &dyn JobStore,
    ) -> Result<TransactionScope<'_>, JobError> {
        let owner = if self.transaction.is_some() {
            debug!("joining open transaction");
            false
        } else {
            self.transaction = Some(store.begin().await?);
            debug!("transaction opened");
            true
        };

        Ok(TransactionScope {
            ctx: self,
            owner,
            finished: false,
        })
    }

    /// Mark reads in this scope as row-locking.
    pub fn lock_for_update(&mut self) -> LockScope<'_> {
        let previous = self.in_lock;
        self.in_lock = true;
        LockScope {
            ctx: self,
            previous,
            started: Instant::now(),
        }
    }

    /// Read a job through the open session, or autocommit when there is none.
    pub(crate) async fn load(
        &mut self,
        store: &dyn JobStore,
        id: JobId,
    ) -> Result<Option<Job>, JobError> {
        let lock = self.in_lock;
        let result = match self.transaction.as_mut() {
            Some(tx) => tx.get(id, lock).await,
            None => store.get(id).await,
        };
        result.map_err(|err| self.classify(id, err))
    }

    /// Write a job through the open session, or autocommit when there is none.
    pub(crate) async fn write(
        &mut self,
        store: &dyn JobStore,
        id: JobId,
        changes: &JobChanges,
    ) -> Result<u64, JobError> {
        let result = match self.transaction.as_mut() {
            Some(tx) => tx.update(id, changes).await,
            None => store.update(id, changes).await,
        };
        result.map_err(|err| self.classify(id, err))
    }

    fn classify(&self, id: JobId, err: StoreError) -> JobError {
        match err {
            StoreError::LockWaitTimeout if self.in_lock => JobError::LockTimeout(id),
            StoreError::RowLocked if self.in_lock => JobError::LockBusy(id),
            other => JobError::Store(other),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("correlation_id", &self.correlation_id)
            .field("job_id", &self.job_id)
            .field("in_transaction", &self.in_transaction())
            .field("in_lock", &self.in_lock)
            .finish()
    }
}

fn random_tag() -> String {
    // The tail of a v7 uuid is random.
    let simple = Uuid::now_v7().simple().to_string();
    simple[simple.len() - 6..].to_string()
}

/// An entered transaction scope. Derefs to the context it guards.
///
/// Close it with [`TransactionScope::finish`]. A scope dropped without
/// finishing discards the session, which rolls it back.
pub struct TransactionScope<'a> {
    ctx: &'a mut ExecutionContext,
    owner: bool,
    finished: bool,
}

impl TransactionScope<'_> {
    /// Whether this scope opened the session (as opposed to joining one).
    pub fn is_outermost(&self) -> bool {
        self.owner
    }

    /// Commit on `Ok`, roll back on `Err`, and pass the result through.
    ///
    /// A failed commit turns an `Ok` into the commit error.
    pub async fn finish<T>(mut self, result: Result<T, JobError>) -> Result<T, JobError> {
        self.finished = true;
        if !self.owner {
            return result;
        }
        let Some(tx) = self.ctx.transaction.take() else {
            return result;
        };

        match result {
            Ok(value) => {
                tx.commit().await?;
                debug!("transaction committed");
                Ok(value)
            }
            Err(err) => {
                match tx.rollback().await {
                    Ok(()) => debug!(error = %err, "transaction rolled back"),
                    Err(rollback) => warn!(error = %err, rollback_error = %rollback, "rollback failed"),
                }
                Err(err)
            }
        }
    }
}

impl Deref for TransactionScope<'_> {
    type Target = ExecutionContext;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl DerefMut for TransactionScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if self.owner && !self.finished && self.ctx.transaction.take().is_some() {
            warn!("transaction scope left without finishing; session discarded");
        }
    }
}

/// An entered row-lock scope. Derefs to the context it guards.
pub struct LockScope<'a> {
    ctx: &'a mut ExecutionContext,
    previous: bool,
    started: Instant,
}

impl Deref for LockScope<'_> {
    type Target = ExecutionContext;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl DerefMut for LockScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for LockScope<'_> {
    fn drop(&mut self) {
        self.ctx.in_lock = self.previous;
        debug!(elapsed_ms = self.started.elapsed().as_millis() as u64, "lock scope closed");
    }
}

/// Log start, completion and failure of `operation`, with its duration.
pub async fn footprint<T, E, F>(operation: &'static str, work: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let started = Instant::now();
    debug!(operation, "start");

    let result = work.await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => debug!(operation, elapsed_ms, "done"),
        Err(err) => warn!(operation, elapsed_ms, error = %err, "failed"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cirrus_core::{JobStatus, NewJob};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::jobs::in_memory::InMemoryJobStore;

    async fn seeded() -> (Arc<InMemoryJobStore>, Job) {
        let store = Arc::new(InMemoryJobStore::with_lock_wait(Duration::from_millis(20)));
        let job = NewJob::new("Sync", json!({})).into_job(JobId::new(), Utc::now()).unwrap();
        store.insert(&job).await.unwrap();
        (store, job)
    }

    #[tokio::test]
    async fn commit_on_ok_releases_session() {
        let (store, job) = seeded().await;
        let mut ctx = ExecutionContext::for_job(job.id);

        let mut scope = ctx.transaction(store.as_ref()).await.unwrap();
        assert!(scope.in_transaction());
        let changes = JobChanges::new().status(JobStatus::Running);
        let result = scope.write(store.as_ref(), job.id, &changes).await.map(|_| ());
        scope.finish(result).await.unwrap();

        assert!(!ctx.in_transaction());
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Running);
        assert_eq!(store.locked_rows(), 0);
    }

    #[tokio::test]
    async fn rollback_on_err_discards_writes() {
        let (store, job) = seeded().await;
        let mut ctx = ExecutionContext::new();

        let mut scope = ctx.transaction(store.as_ref()).await.unwrap();
        scope
            .write(store.as_ref(), job.id, &JobChanges::new().trys(1))
            .await
            .unwrap();
        let err = scope
            .finish::<()>(Err(JobError::UnknownAction("Nope".into())))
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::UnknownAction(_)));
        assert!(!ctx.in_transaction());
        assert_eq!(store.get(job.id).await.unwrap().unwrap().trys, 0);
    }

    #[tokio::test]
    async fn nested_scope_reuses_outer_session() {
        let (store, job) = seeded().await;
        let mut ctx = ExecutionContext::new();

        let mut outer = ctx.transaction(store.as_ref()).await.unwrap();
        assert!(outer.is_outermost());
        {
            let mut inner = outer.transaction(store.as_ref()).await.unwrap();
            assert!(!inner.is_outermost());
            let result = inner
                .write(store.as_ref(), job.id, &JobChanges::new().trys(1))
                .await
                .map(|_| ());
            inner.finish(result).await.unwrap();
        }

        // Inner finish does not commit.
        assert!(outer.in_transaction());
        assert_eq!(store.get(job.id).await.unwrap().unwrap().trys, 0);

        outer.finish(Ok(())).await.unwrap();
        assert_eq!(store.get(job.id).await.unwrap().unwrap().trys, 1);
    }

    #[tokio::test]
    async fn dropped_scope_discards_session() {
        let (store, job) = seeded().await;
        let mut ctx = ExecutionContext::new();
        {
            let mut scope = ctx.transaction(store.as_ref()).await.unwrap();
            let mut lock = scope.lock_for_update();
            lock.load(store.as_ref(), job.id).await.unwrap();
        }
        assert!(!ctx.in_transaction());
        assert!(!ctx.in_lock());
        assert_eq!(store.locked_rows(), 0);
    }

    #[tokio::test]
    async fn lock_flag_is_scoped() {
        let mut ctx = ExecutionContext::new();
        {
            let lock = ctx.lock_for_update();
            assert!(lock.in_lock());
        }
        assert!(!ctx.in_lock());
    }

    #[tokio::test]
    async fn lock_wait_expiry_is_distinguished_only_under_lock() {
        let (store, job) = seeded().await;

        let mut holder = ExecutionContext::new();
        let mut held = holder.transaction(store.as_ref()).await.unwrap();
        held.lock_for_update().load(store.as_ref(), job.id).await.unwrap();

        let mut ctx = ExecutionContext::new();
        let mut scope = ctx.transaction(store.as_ref()).await.unwrap();
        let err = scope
            .lock_for_update()
            .load(store.as_ref(), job.id)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::LockTimeout(id) if id == job.id));

        // Writes outside the lock scope surface the raw store error.
        let err = scope
            .write(store.as_ref(), job.id, &JobChanges::new().trys(1))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Store(StoreError::LockWaitTimeout)));

        held.finish(Ok(())).await.unwrap();
    }

    #[test]
    fn correlation_ids_carry_job_suffix() {
        let id = JobId::new();
        let ctx = ExecutionContext::for_job(id);
        assert!(ctx.correlation_id().starts_with("ctx-"));
        assert!(ctx.correlation_id().ends_with(&id.short()));
        assert_ne!(ExecutionContext::new().correlation_id(), ExecutionContext::new().correlation_id());
    }

    #[tokio::test]
    async fn footprint_passes_results_through() {
        let ok: Result<u8, JobError> = footprint("ok", async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u8, JobError> =
            footprint("err", async { Err(JobError::UnknownAction("X".into())) }).await;
        assert!(err.is_err());
    }
}
