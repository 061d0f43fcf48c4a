use cirrus_core::{DomainError, JobId};
use cirrus_events::NotifyError;

use super::store::StoreError;

/// Errors surfaced by the job lifecycle.
///
/// Action failures are not part of this type: they are turned into state
/// transitions inside `execute` and never reach the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("job ({0}) is not found")]
    NotFound(JobId),

    /// Another session holds the row and the store did not wait.
    #[error("job ({0}) is locked by another worker")]
    LockBusy(JobId),

    /// Waiting for another session's row lock took too long.
    #[error("lock wait timeout exceeded on job ({0})")]
    LockTimeout(JobId),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    /// Lock races are expected; callers skip the job instead of failing.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, JobError::LockBusy(_) | JobError::LockTimeout(_))
    }
}
