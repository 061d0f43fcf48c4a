//! Retry schedule for failed attempts.
//!
//! Backoff is linear in the attempt number: the n-th failure pushes `run_at`
//! to `now + try_period * n`. The schedule only depends on persisted fields,
//! so any worker process can continue it.

use chrono::{DateTime, Duration, Utc};

use crate::job::Job;

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back to pending, due at `run_at`.
    Retry { attempt: u32, run_at: DateTime<Utc> },
    /// No attempts left.
    Exhausted { attempt: u32 },
}

impl RetryDecision {
    pub fn attempt(&self) -> u32 {
        match self {
            RetryDecision::Retry { attempt, .. } | RetryDecision::Exhausted { attempt } => *attempt,
        }
    }
}

impl Job {
    /// The attempt number the next execution will consume.
    ///
    /// Clamped to `try_max` so a record can never be pushed past its budget.
    pub fn next_attempt(&self) -> u32 {
        self.trys.saturating_add(1).min(self.try_max)
    }

    /// Whether the next execution is the final one.
    pub fn is_last_chance(&self) -> bool {
        self.trys.saturating_add(1) >= self.try_max
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::seconds(i64::from(self.try_period) * i64::from(attempt))
    }

    /// Decide the follow-up of a failed attempt observed at `now`.
    ///
    /// `run_at` never moves backwards, even if the clock does.
    pub fn on_failure(&self, now: DateTime<Utc>) -> RetryDecision {
        let attempt = self.next_attempt();
        if self.is_last_chance() {
            return RetryDecision::Exhausted { attempt };
        }
        let run_at = (now + self.retry_delay(attempt)).max(self.run_at);
        RetryDecision::Retry { attempt, run_at }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::JobId;
    use crate::job::NewJob;
    use proptest::prelude::*;
    use serde_json::json;

    fn job(try_max: u32, try_period: u32) -> Job {
        NewJob::new("Sync", json!({}))
            .try_max(try_max)
            .try_period(try_period)
            .into_job(JobId::new(), Utc::now())
            .unwrap()
    }

    #[test]
    fn first_failure_of_two_reschedules() {
        let job = job(2, 1);
        let now = Utc::now();
        assert!(!job.is_last_chance());
        assert_eq!(
            job.on_failure(now),
            RetryDecision::Retry { attempt: 1, run_at: now + Duration::seconds(1) }
        );
    }

    #[test]
    fn last_failure_is_exhausted() {
        let mut job = job(2, 1);
        job.trys = 1;
        assert!(job.is_last_chance());
        assert_eq!(job.on_failure(Utc::now()), RetryDecision::Exhausted { attempt: 2 });
    }

    #[test]
    fn single_attempt_jobs_never_retry() {
        let job = job(1, 600);
        assert!(job.is_last_chance());
        assert_eq!(job.on_failure(Utc::now()).attempt(), 1);
    }

    #[test]
    fn delay_scales_with_attempt() {
        let job = job(5, 30);
        assert_eq!(job.retry_delay(1), Duration::seconds(30));
        assert_eq!(job.retry_delay(3), Duration::seconds(90));
    }

    #[test]
    fn run_at_does_not_move_backwards() {
        let mut job = job(3, 10);
        let later = Utc::now() + Duration::hours(1);
        job.run_at = later;
        match job.on_failure(Utc::now()) {
            RetryDecision::Retry { run_at, .. } => assert_eq!(run_at, later),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn failing_forever_exhausts_after_try_max(try_max in 1u32..12, try_period in 0u32..5_000) {
            let mut job = job(try_max, try_period);
            let mut now = Utc::now();
            let mut reschedules = 0;

            loop {
                prop_assert!(job.trys <= job.try_max);
                match job.on_failure(now) {
                    RetryDecision::Retry { attempt, run_at } => {
                        prop_assert!(run_at >= job.run_at);
                        prop_assert_eq!(run_at, (now + job.retry_delay(attempt)).max(job.run_at));
                        job.trys = attempt;
                        job.run_at = run_at;
                        reschedules += 1;
                        now = run_at;
                    }
                    RetryDecision::Exhausted { attempt } => {
                        job.trys = attempt;
                        break;
                    }
                }
            }

            prop_assert_eq!(reschedules, try_max - 1);
            prop_assert_eq!(job.trys, try_max);
        }
    }
}
