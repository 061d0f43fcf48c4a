//! Lifecycle events emitted while a job executes.

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use cirrus_core::Job;

use crate::bus::{Notifier, NotifyError};
use crate::topic::{Topic, Topical};

/// One lifecycle event, carrying the job snapshot taken before the attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "topic")]
pub enum JobEvent {
    #[serde(rename = "job-started")]
    Started {
        job: Job,
        attempt: u32,
        is_last_chance: bool,
    },
    #[serde(rename = "job-failed")]
    Failed {
        job: Job,
        attempt: u32,
        error: String,
        is_last_chance: bool,
    },
    #[serde(rename = "job-finished")]
    Finished { job: Job, attempt: u32, result: Value },
}

impl JobEvent {
    pub fn started(job: &Job) -> Self {
        Self::Started {
            job: job.clone(),
            attempt: job.next_attempt(),
            is_last_chance: job.is_last_chance(),
        }
    }

    pub fn failed(job: &Job, error: impl Into<String>) -> Self {
        Self::Failed {
            job: job.clone(),
            attempt: job.next_attempt(),
            error: error.into(),
            is_last_chance: job.is_last_chance(),
        }
    }

    pub fn finished(job: &Job, result: &Value) -> Self {
        Self::Finished {
            job: job.clone(),
            attempt: job.next_attempt(),
            result: result.clone(),
        }
    }

    pub fn job(&self) -> &Job {
        match self {
            JobEvent::Started { job, .. }
            | JobEvent::Failed { job, .. }
            | JobEvent::Finished { job, .. } => job,
        }
    }

    pub fn attempt(&self) -> u32 {
        match self {
            JobEvent::Started { attempt, .. }
            | JobEvent::Failed { attempt, .. }
            | JobEvent::Finished { attempt, .. } => *attempt,
        }
    }
}

impl Topical for JobEvent {
    fn topic(&self) -> Topic {
        match self {
            JobEvent::Started { .. } => Topic::JobStarted,
            JobEvent::Failed { .. } => Topic::JobFailed,
            JobEvent::Finished { .. } => Topic::JobFinished,
        }
    }
}

/// Writes every lifecycle event to the tracing log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier<JobEvent> for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn cares(&self, _topic: Topic) -> bool {
        true
    }

    fn notify(&self, event: &JobEvent) -> Result<(), NotifyError> {
        let job = event.job();
        match event {
            JobEvent::Failed {
                error,
                is_last_chance,
                ..
            } => warn!(
                job_id = %job.id,
                action = %job.action,
                attempt = event.attempt(),
                is_last_chance,
                error = %error,
                "job attempt failed"
            ),
            _ => info!(
                job_id = %job.id,
                action = %job.action,
                attempt = event.attempt(),
                topic = %event.topic(),
                "job lifecycle event"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cirrus_core::{JobId, NewJob};
    use serde_json::json;

    fn job(trys: u32) -> Job {
        let mut job = NewJob::new("Sync", json!({}))
            .try_max(2)
            .into_job(JobId::new(), Utc::now())
            .unwrap();
        job.trys = trys;
        job
    }

    #[test]
    fn events_carry_attempt_and_last_chance() {
        let first = JobEvent::started(&job(0));
        assert_eq!(first.topic(), Topic::JobStarted);
        assert_eq!(first.attempt(), 1);
        assert!(matches!(first, JobEvent::Started { is_last_chance: false, .. }));

        let last = JobEvent::failed(&job(1), "boom");
        assert_eq!(last.topic(), Topic::JobFailed);
        assert_eq!(last.attempt(), 2);
        assert!(matches!(last, JobEvent::Failed { is_last_chance: true, .. }));
    }

    #[test]
    fn serializes_with_topic_tag() {
        let event = JobEvent::finished(&job(0), &json!({"ok": true}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["topic"], "job-finished");
        assert_eq!(value["result"]["ok"], true);
    }

    #[test]
    fn log_notifier_accepts_everything() {
        let notifier = LogNotifier;
        assert!(Topic::ALL.iter().all(|t| notifier.cares(*t)));
        assert!(notifier.notify(&JobEvent::started(&job(0))).is_ok());
    }
}
