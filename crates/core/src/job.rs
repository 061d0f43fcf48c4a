//! The job record and its state machine.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, ProjectId};

/// Default delay unit between retries, in seconds.
pub const DEFAULT_TRY_PERIOD_SECS: u32 = 600;

/// Default number of attempts before a job is given up.
pub const DEFAULT_TRY_MAX: u32 = 3;

/// Job execution status.
///
/// ```text
/// pending --prepare--> running --success--> finished
///    ^                   |  \
///    +---retry / reset---+   +--exhausted--> error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_at` and a free worker.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Completed successfully.
    Finished,
    /// Attempts exhausted.
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Error => "error",
        }
    }

    /// Whether a worker may claim a job in this status.
    pub fn is_executable(&self) -> bool {
        matches!(self, JobStatus::Pending)
    }

    /// Whether crash recovery may put a job in this status back to pending.
    pub fn is_resettable(&self) -> bool {
        matches!(self, JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Error)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Finished)
                | (JobStatus::Running, JobStatus::Pending)
                | (JobStatus::Running, JobStatus::Error)
        )
    }

    /// Validate a move along the state machine.
    pub fn transition_to(&self, next: JobStatus) -> DomainResult<JobStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::invalid_transition(self, next))
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "finished" => Ok(JobStatus::Finished),
            "error" => Ok(JobStatus::Error),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// A durable unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub project_id: ProjectId,
    /// Symbolic name of the action that performs the work.
    pub action: String,
    pub status: JobStatus,
    pub params: Value,
    /// Set once the job finished.
    pub result: Option<Value>,
    /// Last failure message once the job errored.
    pub error: Option<String>,
    /// Earliest time the job may run.
    pub run_at: DateTime<Utc>,
    /// Retry delay unit, in seconds.
    pub try_period: u32,
    pub try_max: u32,
    /// Attempts consumed so far.
    pub trys: u32,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Job {
    pub fn is_finished(&self) -> bool {
        self.status == JobStatus::Finished
    }

    pub fn is_error(&self) -> bool {
        self.status == JobStatus::Error
    }

    /// Resources this job operates on, as listed under `params.resource_ids`.
    pub fn resource_ids(&self) -> Vec<String> {
        self.params
            .get("resource_ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Client-facing view of the job.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.id,
            project_id: self.project_id.clone(),
            action: self.action.clone(),
            status: self.status,
            resource_ids: self.resource_ids(),
            updated: self.updated,
            created: self.created,
        }
    }
}

/// Serialized shape returned to API clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: JobId,
    pub project_id: ProjectId,
    pub action: String,
    pub status: JobStatus,
    pub resource_ids: Vec<String>,
    pub updated: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

/// Request to enqueue a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub action: String,
    pub project_id: ProjectId,
    pub params: Value,
    pub run_at: Option<DateTime<Utc>>,
    pub try_period: u32,
    pub try_max: u32,
}

impl NewJob {
    /// A system-owned job with default retry settings, due immediately.
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            project_id: ProjectId::system(),
            params,
            run_at: None,
            try_period: DEFAULT_TRY_PERIOD_SECS,
            try_max: DEFAULT_TRY_MAX,
        }
    }

    pub fn for_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = project_id;
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn try_period(mut self, secs: u32) -> Self {
        self.try_period = secs;
        self
    }

    pub fn try_max(mut self, try_max: u32) -> Self {
        self.try_max = try_max;
        self
    }

    /// Build the pending record, validating the retry settings.
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> DomainResult<Job> {
        if self.action.trim().is_empty() {
            return Err(DomainError::validation("action must not be empty"));
        }
        if self.try_max == 0 {
            return Err(DomainError::validation("try_max must be positive"));
        }

        Ok(Job {
            id,
            project_id: self.project_id,
            action: self.action,
            status: JobStatus::Pending,
            params: self.params,
            result: None,
            error: None,
            run_at: self.run_at.unwrap_or(now),
            try_period: self.try_period,
            try_max: self.try_max,
            trys: 0,
            created: now,
            updated: now,
        })
    }
}

/// Partial update of a job record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobChanges {
    pub status: Option<JobStatus>,
    pub run_at: Option<DateTime<Utc>>,
    pub trys: Option<u32>,
    pub error: Option<Option<String>>,
    pub params: Option<Value>,
    pub result: Option<Option<Value>>,
    pub updated: Option<DateTime<Utc>>,
}

impl JobChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn trys(mut self, trys: u32) -> Self {
        self.trys = Some(trys);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(Some(result));
        self
    }

    pub fn touched(mut self, at: DateTime<Utc>) -> Self {
        self.updated = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply onto a record, refusing to break `trys <= try_max`.
    pub fn apply_to(&self, job: &mut Job) -> DomainResult<()> {
        if let Some(trys) = self.trys {
            if trys > job.try_max {
                return Err(DomainError::invariant(format!(
                    "trys ({trys}) exceeds try_max ({})",
                    job.try_max
                )));
            }
            job.trys = trys;
        }
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(run_at) = self.run_at {
            job.run_at = run_at;
        }
        if let Some(error) = &self.error {
            job.error = error.clone();
        }
        if let Some(params) = &self.params {
            job.params = params.clone();
        }
        if let Some(result) = &self.result {
            job.result = result.clone();
        }
        if let Some(updated) = self.updated {
            job.updated = updated;
        }
        Ok(())
    }
}
