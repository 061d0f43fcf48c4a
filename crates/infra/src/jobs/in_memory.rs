//! In-memory job store for tests/dev.
//!
//! Emulates what the worker relies on from a relational store: sessions whose
//! writes land together on commit, and exclusive row locks held until the
//! owning session ends. A locking read that cannot get the row within
//! `lock_wait` fails with [`StoreError::LockWaitTimeout`] (or
//! [`StoreError::RowLocked`] when `lock_wait` is zero).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use cirrus_core::{Job, JobChanges, JobId};

use super::store::{JobPage, JobQuery, JobStore, JobTransaction, SortOrder, StoreError};

/// How long a locking read waits by default.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

const LOCK_RETRY: Duration = Duration::from_millis(5);

type SessionId = u64;

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    locks: HashMap<JobId, SessionId>,
}

/// In-memory job store.
#[derive(Debug)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<State>>,
    lock_wait: Duration,
    sessions: AtomicU64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_lock_wait(DEFAULT_LOCK_WAIT)
    }

    pub fn with_lock_wait(lock_wait: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            lock_wait,
            sessions: AtomicU64::new(1),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of rows currently locked by open sessions.
    pub fn locked_rows(&self) -> usize {
        lock_state(&self.state).map(|s| s.locks.len()).unwrap_or(0)
    }

    fn session(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            id: self.sessions.fetch_add(1, Ordering::Relaxed),
            state: self.state.clone(),
            lock_wait: self.lock_wait,
            staged: HashMap::new(),
            held: Vec::new(),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_state(state: &Mutex<State>) -> Result<MutexGuard<'_, State>, StoreError> {
    state
        .lock()
        .map_err(|_| StoreError::Storage("in-memory store lock poisoned".to_string()))
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn begin(&self) -> Result<Box<dyn JobTransaction>, StoreError> {
        Ok(Box::new(self.session()))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(lock_state(&self.state)?.jobs.get(&id).cloned())
    }

    async fn update(&self, id: JobId, changes: &JobChanges) -> Result<u64, StoreError> {
        let mut session = Box::new(self.session());
        let affected = session.update(id, changes).await?;
        session.commit().await?;
        Ok(affected)
    }

    async fn list(&self, query: &JobQuery) -> Result<JobPage, StoreError> {
        let state = lock_state(&self.state)?;
        let mut matches: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| query.filter.matches(job))
            .collect();

        matches.sort_by_key(|job| (job.created, job.id));
        if query.order == SortOrder::Descending {
            matches.reverse();
        }

        let total = matches.len() as u64;
        let items = matches
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit.map_or(usize::MAX, |l| l as usize))
            .cloned()
            .collect();

        Ok(JobPage {
            items,
            total,
            offset: query.offset,
            limit: query.limit,
        })
    }

    async fn insert(&self, job: &Job) -> Result<JobId, StoreError> {
        let mut state = lock_state(&self.state)?;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(job.id)
    }
}

/// Session on an [`InMemoryJobStore`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    id: SessionId,
    state: Arc<Mutex<State>>,
    lock_wait: Duration,
    staged: HashMap<JobId, Job>,
    held: Vec<JobId>,
}

impl InMemoryTransaction {
    /// Take the row lock on `id`, waiting up to `lock_wait`.
    ///
    /// Returns `false` if the row does not exist.
    async fn acquire(&mut self, id: JobId) -> Result<bool, StoreError> {
        if self.held.contains(&id) {
            return Ok(true);
        }

        let deadline = Instant::now() + self.lock_wait;
        loop {
            {
                let mut state = lock_state(&self.state)?;
                if !state.jobs.contains_key(&id) {
                    return Ok(false);
                }
                if !state.locks.contains_key(&id) {
                    state.locks.insert(id, self.id);
                    self.held.push(id);
                    return Ok(true);
                }
            }

            if self.lock_wait.is_zero() {
                return Err(StoreError::RowLocked);
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockWaitTimeout);
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }
    }

    fn current(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        if let Some(job) = self.staged.get(&id) {
            return Ok(Some(job.clone()));
        }
        Ok(lock_state(&self.state)?.jobs.get(&id).cloned())
    }

    fn release(&mut self) {
        if self.held.is_empty() {
            return;
        }
        // Poisoning only happens after a panic elsewhere; the locks die with the store.
        if let Ok(mut state) = self.state.lock() {
            for id in self.held.drain(..) {
                if state.locks.get(&id) == Some(&self.id) {
                    state.locks.remove(&id);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl JobTransaction for InMemoryTransaction {
    async fn get(&mut self, id: JobId, lock: bool) -> Result<Option<Job>, StoreError> {
        if lock && !self.acquire(id).await? {
            return Ok(None);
        }
        self.current(id)
    }

    async fn update(&mut self, id: JobId, changes: &JobChanges) -> Result<u64, StoreError> {
        if !self.acquire(id).await? {
            return Ok(0);
        }
        let Some(mut job) = self.current(id)? else {
            return Ok(0);
        };
        changes
            .apply_to(&mut job)
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        self.staged.insert(id, job);
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut session = self;
        {
            let mut state = lock_state(&session.state)?;
            for (id, job) in session.staged.drain() {
                state.jobs.insert(id, job);
            }
        }
        session.release();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut session = self;
        session.staged.clear();
        session.release();
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.release();
    }
}
