//! Job storage abstraction.
//!
//! A store offers two ways in:
//!
//! - autocommit calls on [`JobStore`] (each statement is its own unit)
//! - a [`JobTransaction`] session from [`JobStore::begin`], whose writes become
//!   visible together on commit and whose row locks are held until the session
//!   ends
//!
//! Row locks are the only cross-process synchronization point of the job
//! engine. An implementation must bound how long a locking read waits and
//! report the expiry as [`StoreError::LockWaitTimeout`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cirrus_core::{Job, JobChanges, JobId, JobStatus, ProjectId};

/// Default page size for listings.
pub const DEFAULT_PAGE_LIMIT: u64 = 10;

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// A locking read waited longer than the store allows.
    #[error("lock wait timeout exceeded")]
    LockWaitTimeout,
    /// The row is locked and the store was told not to wait.
    #[error("row is locked by another session")]
    RowLocked,
    /// The write would break a record invariant.
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Whether the error means "someone else holds the row".
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, StoreError::LockWaitTimeout | StoreError::RowLocked)
    }
}

/// Sort direction on creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    /// Newest first.
    #[default]
    Descending,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }
}

/// Filter criteria for job listings.
///
/// `None` means "no constraint"; an empty list matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    pub ids: Option<Vec<JobId>>,
    pub project_ids: Option<Vec<ProjectId>>,
    pub status: Option<Vec<JobStatus>>,
    /// Only jobs with `run_at <= due_by`.
    pub due_by: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(mut self, ids: impl IntoIterator<Item = JobId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_projects(mut self, project_ids: impl IntoIterator<Item = ProjectId>) -> Self {
        self.project_ids = Some(project_ids.into_iter().collect());
        self
    }

    pub fn with_status(mut self, status: impl IntoIterator<Item = JobStatus>) -> Self {
        self.status = Some(status.into_iter().collect());
        self
    }

    pub fn due_by(mut self, at: DateTime<Utc>) -> Self {
        self.due_by = Some(at);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.ids.as_ref().is_none_or(|ids| ids.contains(&job.id))
            && self
                .project_ids
                .as_ref()
                .is_none_or(|ps| ps.contains(&job.project_id))
            && self.status.as_ref().is_none_or(|s| s.contains(&job.status))
            && self.due_by.is_none_or(|at| job.run_at <= at)
    }
}

/// A filtered, ordered, paged listing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobQuery {
    pub filter: JobFilter,
    pub order: SortOrder,
    pub offset: u64,
    /// `None` returns every match.
    pub limit: Option<u64>,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            filter: JobFilter::default(),
            order: SortOrder::default(),
            offset: 0,
            limit: Some(DEFAULT_PAGE_LIMIT),
        }
    }
}

impl JobQuery {
    pub fn new(filter: JobFilter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.limit = None;
        self
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    pub items: Vec<Job>,
    /// Matches across all pages.
    pub total: u64,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl JobPage {
    pub fn has_more(&self) -> bool {
        self.offset + (self.items.len() as u64) < self.total
    }
}

/// Durable job persistence.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Open a transactional session.
    async fn begin(&self) -> Result<Box<dyn JobTransaction>, StoreError>;

    /// Non-locking read of the last committed record.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Autocommit partial update. Returns the number of rows touched.
    async fn update(&self, id: JobId, changes: &JobChanges) -> Result<u64, StoreError>;

    async fn list(&self, query: &JobQuery) -> Result<JobPage, StoreError>;

    async fn insert(&self, job: &Job) -> Result<JobId, StoreError>;
}

/// A transactional session on a [`JobStore`].
///
/// Dropping a session without committing discards its writes and releases
/// its locks.
#[async_trait::async_trait]
pub trait JobTransaction: Send {
    /// Read a record, taking its row lock when `lock` is set.
    async fn get(&mut self, id: JobId, lock: bool) -> Result<Option<Job>, StoreError>;

    async fn update(&mut self, id: JobId, changes: &JobChanges) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn JobTransaction>, StoreError> {
        (**self).begin().await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(id).await
    }

    async fn update(&self, id: JobId, changes: &JobChanges) -> Result<u64, StoreError> {
        (**self).update(id, changes).await
    }

    async fn list(&self, query: &JobQuery) -> Result<JobPage, StoreError> {
        (**self).list(query).await
    }

    async fn insert(&self, job: &Job) -> Result<JobId, StoreError> {
        (**self).insert(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::NewJob;
    use serde_json::json;

    fn job(project: &str, status: JobStatus) -> Job {
        let mut job = NewJob::new("Sync", json!({}))
            .for_project(ProjectId::new(project).unwrap())
            .into_job(JobId::new(), Utc::now())
            .unwrap();
        job.status = status;
        job
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(JobFilter::new().matches(&job("p1", JobStatus::Error)));
    }

    #[test]
    fn empty_id_list_matches_nothing() {
        let filter = JobFilter::new().with_ids([]);
        assert!(!filter.matches(&job("p1", JobStatus::Pending)));
    }

    #[test]
    fn filters_combine() {
        let pending = job("p1", JobStatus::Pending);
        let filter = JobFilter::new()
            .with_projects([ProjectId::new("p1").unwrap()])
            .with_status([JobStatus::Pending])
            .due_by(pending.run_at);
        assert!(filter.matches(&pending));
        assert!(!filter.matches(&job("p2", JobStatus::Pending)));
        assert!(!filter.matches(&job("p1", JobStatus::Running)));
        assert!(!filter.clone().due_by(pending.run_at - chrono::Duration::seconds(1)).matches(&pending));
    }

    #[test]
    fn default_query_pages_by_ten_newest_first() {
        let query = JobQuery::default();
        assert_eq!(query.limit, Some(DEFAULT_PAGE_LIMIT));
        assert_eq!(query.offset, 0);
        assert_eq!(query.order, SortOrder::Descending);
        assert_eq!(query.unbounded().limit, None);
    }

    #[test]
    fn page_knows_whether_more_remain() {
        let page = JobPage { items: vec![job("p1", JobStatus::Pending)], total: 3, offset: 1, limit: Some(1) };
        assert!(page.has_more());
        let last = JobPage { offset: 2, ..page };
        assert!(!last.has_more());
    }
}
