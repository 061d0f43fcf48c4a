//! Job lifecycle controller.
//!
//! Every mutation of a job record goes through [`JobController`]. The worker
//! only sees the narrow [`Lifecycle`] trait: list what is due or abandoned,
//! and run one execution unit per job id.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{Instrument, debug, info, warn};

use cirrus_core::{Job, JobChanges, JobId, JobStatus, NewJob, RetryDecision, redact};
use cirrus_events::{JobEvent, Notifier, NotifierBus};

use super::action::{ActionContext, ActionError, ActionRegistry};
use super::context::{ExecutionContext, footprint};
use super::error::JobError;
use super::store::{JobFilter, JobPage, JobQuery, JobStore, SortOrder};

/// How an execution attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Finished { attempt: u32 },
    /// Failed, back to pending until `run_at`.
    Rescheduled { attempt: u32, run_at: DateTime<Utc> },
    /// Failed with no attempts left.
    Exhausted { attempt: u32 },
}

/// What the worker pool needs from the job engine.
#[async_trait::async_trait]
pub trait Lifecycle: Send + Sync {
    /// Pending jobs whose `run_at` has passed, at most `limit`.
    async fn due_jobs(&self, limit: u64, order: SortOrder) -> Result<Vec<JobId>, JobError>;

    /// Jobs left running by a worker that went away.
    async fn abandoned_jobs(&self) -> Result<Vec<JobId>, JobError>;

    /// Claim and execute one job. Busy or non-executable jobs are skipped.
    async fn run_job(&self, id: JobId, timeout: Duration) -> Result<(), JobError>;

    /// Put an abandoned job back to pending.
    async fn clean_job(&self, id: JobId) -> Result<(), JobError>;
}

/// The job lifecycle controller.
#[derive(Clone)]
pub struct JobController {
    store: Arc<dyn JobStore>,
    actions: ActionRegistry,
    notifiers: NotifierBus<JobEvent>,
}

impl JobController {
    pub fn new(store: Arc<dyn JobStore>, actions: ActionRegistry) -> Self {
        Self {
            store,
            actions,
            notifiers: NotifierBus::new(),
        }
    }

    /// Subscribe a notifier to lifecycle events. Notified in registration order.
    pub fn with_notifier(mut self, notifier: impl Notifier<JobEvent> + 'static) -> Self {
        self.notifiers.register(notifier);
        self
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    /// Load `id` under its row lock.
    ///
    /// Returns `Ok(None)` when another session holds the lock: the job is
    /// busy and will be retried on a later pass.
    pub async fn fetch(
        &self,
        ctx: &mut ExecutionContext,
        id: JobId,
    ) -> Result<Option<Job>, JobError> {
        let mut lock = ctx.lock_for_update();
        match lock.load(self.store.as_ref(), id).await {
            Ok(Some(job)) => Ok(Some(job)),
            Ok(None) => Err(JobError::NotFound(id)),
            Err(err) if err.is_lock_contention() => {
                info!(job_id = %id, reason = %err, "job is busy, try later");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Mark a fetched job as running. Call inside the fetch transaction.
    pub async fn prepare(&self, ctx: &mut ExecutionContext, job: &Job) -> Result<Job, JobError> {
        let status = job.status.transition_to(JobStatus::Running)?;
        let changes = JobChanges::new().status(status);
        self.update(ctx, job.id, changes.clone()).await?;

        let mut prepared = job.clone();
        changes.apply_to(&mut prepared)?;
        Ok(prepared)
    }

    /// Run the job's action once and record the outcome.
    ///
    /// Action failures (timeouts included) become state transitions and are
    /// never returned. Notifier and store failures are.
    pub async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        job: &Job,
        timeout: Duration,
    ) -> Result<JobOutcome, JobError> {
        // Only a running job can reach a terminal state.
        job.status.transition_to(JobStatus::Finished)?;

        let attempt = job.next_attempt();
        let is_last_chance = job.is_last_chance();
        let params = redact(&job.params);
        info!(
            job_id = %job.id,
            action = %job.action,
            attempt,
            is_last_chance,
            params = %params,
            "executing job"
        );
        self.notifiers.publish(&JobEvent::started(job))?;

        match self.invoke(job, timeout).await {
            Ok(result) => {
                self.notifiers.publish(&JobEvent::finished(job, &result))?;
                let changes = JobChanges::new()
                    .status(job.status.transition_to(JobStatus::Finished)?)
                    .trys(attempt)
                    .clear_error()
                    .params(params)
                    .result(result);
                self.update(ctx, job.id, changes).await?;
                info!(job_id = %job.id, attempt, "job finished");
                Ok(JobOutcome::Finished { attempt })
            }
            Err(err) => {
                let message = err.to_string();
                warn!(job_id = %job.id, attempt, is_last_chance, error = %message, "job attempt failed");
                self.notifiers.publish(&JobEvent::failed(job, message.clone()))?;

                match job.on_failure(Utc::now()) {
                    RetryDecision::Exhausted { attempt } => {
                        let changes = JobChanges::new()
                            .status(job.status.transition_to(JobStatus::Error)?)
                            .trys(attempt)
                            .error(message)
                            .params(params);
                        self.update(ctx, job.id, changes).await?;
                        warn!(job_id = %job.id, attempt, "job out of attempts");
                        Ok(JobOutcome::Exhausted { attempt })
                    }
                    RetryDecision::Retry { attempt, run_at } => {
                        let changes = JobChanges::new()
                            .status(job.status.transition_to(JobStatus::Pending)?)
                            .trys(attempt)
                            .run_at(run_at);
                        self.update(ctx, job.id, changes).await?;
                        info!(job_id = %job.id, attempt, %run_at, "job rescheduled");
                        Ok(JobOutcome::Rescheduled { attempt, run_at })
                    }
                }
            }
        }
    }

    async fn invoke(&self, job: &Job, timeout: Duration) -> Result<Value, ActionError> {
        let action = self
            .actions
            .resolve(&job.action)
            .ok_or_else(|| ActionError::Unsupported(job.action.clone()))?;
        let ctx = ActionContext {
            job_id: job.id,
            project_id: job.project_id.clone(),
            attempt: job.next_attempt(),
            is_last_chance: job.is_last_chance(),
        };

        match tokio::time::timeout(timeout, action.handle(job.params.clone(), ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::TimedOut(timeout)),
        }
    }

    /// Force a running job back to pending.
    pub async fn reset(&self, ctx: &mut ExecutionContext, job: &Job) -> Result<(), JobError> {
        let status = job.status.transition_to(JobStatus::Pending)?;
        self.update(ctx, job.id, JobChanges::new().status(status)).await
    }

    /// Enqueue a new pending job.
    pub async fn create(&self, new_job: NewJob) -> Result<Job, JobError> {
        if !self.actions.contains(&new_job.action) {
            return Err(JobError::UnknownAction(new_job.action));
        }
        let job = new_job.into_job(JobId::new(), Utc::now())?;
        self.store.insert(&job).await?;
        info!(
            job_id = %job.id,
            project_id = %job.project_id,
            action = %job.action,
            run_at = %job.run_at,
            "job created"
        );
        Ok(job)
    }

    /// Partial update; stamps `updated`. Joins the context's transaction if
    /// one is open.
    pub async fn update(
        &self,
        ctx: &mut ExecutionContext,
        id: JobId,
        changes: JobChanges,
    ) -> Result<(), JobError> {
        let changes = changes.touched(Utc::now());
        let mut scope = ctx.transaction(self.store.as_ref()).await?;
        let result = match scope.write(self.store.as_ref(), id, &changes).await {
            Ok(0) => Err(JobError::NotFound(id)),
            Ok(_) => Ok(()),
            Err(err) => Err(err),
        };
        scope.finish(result).await
    }

    pub async fn get(&self, id: JobId) -> Result<Job, JobError> {
        self.store.get(id).await?.ok_or(JobError::NotFound(id))
    }

    /// Paged listing.
    pub async fn limitation(&self, query: &JobQuery) -> Result<JobPage, JobError> {
        Ok(self.store.list(query).await?)
    }

    async fn run_unit(
        &self,
        ctx: &mut ExecutionContext,
        id: JobId,
        timeout: Duration,
    ) -> Result<(), JobError> {
        let mut scope = ctx.transaction(self.store.as_ref()).await?;
        let claimed = self.claim(&mut scope, id).await;
        if scope.finish(claimed).await?.is_none() {
            return Ok(());
        }

        let Some(job) = ctx.load(self.store.as_ref(), id).await? else {
            return Err(JobError::NotFound(id));
        };
        let outcome = self.execute(ctx, &job, timeout).await?;
        debug!(?outcome, "execution unit done");
        Ok(())
    }

    async fn claim(&self, ctx: &mut ExecutionContext, id: JobId) -> Result<Option<Job>, JobError> {
        let job = match self.fetch(ctx, id).await {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(None),
            Err(JobError::NotFound(_)) => {
                warn!(job_id = %id, "job vanished before it could be claimed");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if !job.status.is_executable() {
            info!(job_id = %id, status = %job.status, "job is not executable, skipping");
            return Ok(None);
        }
        self.prepare(ctx, &job).await.map(Some)
    }

    async fn clean_unit(&self, ctx: &mut ExecutionContext, id: JobId) -> Result<(), JobError> {
        let mut scope = ctx.transaction(self.store.as_ref()).await?;
        let result = self.reset_abandoned(&mut scope, id).await;
        scope.finish(result).await
    }

    async fn reset_abandoned(&self, ctx: &mut ExecutionContext, id: JobId) -> Result<(), JobError> {
        let Some(job) = self.fetch(ctx, id).await? else {
            return Ok(());
        };
        if job.status.is_resettable() {
            self.reset(ctx, &job).await?;
            info!(job_id = %id, "abandoned job reset to pending");
        }
        Ok(())
    }

    async fn ids(&self, query: JobQuery) -> Result<Vec<JobId>, JobError> {
        let page = self.store.list(&query).await?;
        Ok(page.items.into_iter().map(|job| job.id).collect())
    }
}

impl std::fmt::Debug for JobController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobController")
            .field("actions", &self.actions)
            .field("notifiers", &self.notifiers)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Lifecycle for JobController {
    async fn due_jobs(&self, limit: u64, order: SortOrder) -> Result<Vec<JobId>, JobError> {
        let filter = JobFilter::new()
            .with_status([JobStatus::Pending])
            .due_by(Utc::now());
        self.ids(JobQuery::new(filter).order(order).limit(limit)).await
    }

    async fn abandoned_jobs(&self) -> Result<Vec<JobId>, JobError> {
        let filter = JobFilter::new().with_status([JobStatus::Running]);
        self.ids(JobQuery::new(filter).unbounded()).await
    }

    async fn run_job(&self, id: JobId, timeout: Duration) -> Result<(), JobError> {
        let mut ctx = ExecutionContext::for_job(id);
        let span = ctx.span();
        footprint("run_job", self.run_unit(&mut ctx, id, timeout))
            .instrument(span)
            .await
    }

    async fn clean_job(&self, id: JobId) -> Result<(), JobError> {
        let mut ctx = ExecutionContext::for_job(id);
        let span = ctx.span();
        footprint("clean_job", self.clean_unit(&mut ctx, id))
            .instrument(span)
            .await
    }
}
