//! Poll-until-condition helper for actions waiting on external resources.
//!
//! Cloud resources converge asynchronously (an instance becomes `ACTIVE`, a
//! volume disappears). [`Waiter`] re-fetches a snapshot until a predicate
//! holds, sleeping `patience(n)` after the n-th fetch, and gives up at an
//! overall ceiling.

use std::backtrace::Backtrace;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::jobs::JobError;

/// Ceiling applied when no timeout is given.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Sleep between fetches when no patience function is given.
pub const DEFAULT_PATIENCE: Duration = Duration::from_secs(1);

/// Classifies fetch errors that mean "the object does not exist".
pub trait NotFound {
    fn is_not_found(&self) -> bool;
}

impl NotFound for JobError {
    fn is_not_found(&self) -> bool {
        matches!(self, JobError::NotFound(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError<E> {
    #[error("wait interrupted")]
    Interrupted,

    #[error("condition not met after {}s ({fetches} fetches)", .elapsed.as_secs())]
    TimedOut { elapsed: Duration, fetches: u32 },

    #[error("object not found: {source}")]
    NotFound {
        #[source]
        source: E,
        trace: String,
    },

    #[error("fetch failed: {source}")]
    Failed {
        #[source]
        source: E,
        trace: String,
    },
}

type Patience = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Polls a fetch function until a condition holds.
#[derive(Clone)]
pub struct Waiter {
    patience: Patience,
    timeout: Duration,
}

impl Waiter {
    pub fn new() -> Self {
        Self {
            patience: Arc::new(|_| DEFAULT_PATIENCE),
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Sleep `patience(n)` after the n-th fetch (1-based).
    pub fn with_patience(mut self, patience: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.patience = Arc::new(patience);
        self
    }

    /// Overall ceiling; `None` or zero keeps the one-day default.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(DEFAULT_WAIT_TIMEOUT);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Return the first fetched snapshot satisfying `predicate`.
    pub async fn wait_object<T, E, F, Fut, P>(
        &self,
        fetch: F,
        predicate: P,
    ) -> Result<T, WaitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&T) -> bool,
        E: NotFound,
    {
        self.wait_object_interruptible(fetch, predicate, |_| false)
            .await
    }

    /// Like [`Waiter::wait_object`], giving up with [`WaitError::Interrupted`]
    /// when `interrupt` holds for a snapshot that does not satisfy `predicate`.
    pub async fn wait_object_interruptible<T, E, F, Fut, P, I>(
        &self,
        mut fetch: F,
        predicate: P,
        interrupt: I,
    ) -> Result<T, WaitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&T) -> bool,
        I: Fn(&T) -> bool,
        E: NotFound,
    {
        let started = Instant::now();
        let mut fetches = 0u32;
        loop {
            fetches += 1;
            let object = match fetch().await {
                Ok(object) => object,
                Err(source) if source.is_not_found() => {
                    return Err(WaitError::NotFound {
                        source,
                        trace: Backtrace::force_capture().to_string(),
                    });
                }
                Err(source) => {
                    return Err(WaitError::Failed {
                        source,
                        trace: Backtrace::force_capture().to_string(),
                    });
                }
            };

            if predicate(&object) {
                return Ok(object);
            }
            if interrupt(&object) {
                debug!(fetches, "wait interrupted by snapshot");
                return Err(WaitError::Interrupted);
            }
            let elapsed = started.elapsed();
            if elapsed > self.timeout {
                return Err(WaitError::TimedOut { elapsed, fetches });
            }

            tokio::time::sleep((self.patience)(fetches)).await;
        }
    }

    /// Wait until `fetch` reports not-found. Any other error keeps polling.
    pub async fn wait_deleted<T, E, F, Fut>(&self, mut fetch: F) -> Result<(), WaitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: NotFound + fmt::Display,
    {
        let started = Instant::now();
        let mut fetches = 0u32;
        loop {
            let elapsed = started.elapsed();
            if elapsed > self.timeout {
                return Err(WaitError::TimedOut { elapsed, fetches });
            }

            fetches += 1;
            match fetch().await {
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => debug!(error = %err, fetches, "fetch failed while waiting for deletion"),
                Ok(_) => {}
            }

            tokio::time::sleep((self.patience)(fetches)).await;
        }
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
