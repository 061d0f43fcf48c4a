//! Integration tests for the job engine.
//!
//! Tests: create -> worker poll -> run_job -> action -> store + notifiers
//!
//! Verifies:
//! - Failed attempts reschedule with backoff and end in `error`
//! - At most one execution per job under racing workers
//! - Abandoned jobs are recovered before polling
//! - Notifiers observe events in registration order

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::{Value, json};
    use tokio_util::sync::CancellationToken;

    use cirrus_core::{Job, JobChanges, JobId, JobStatus, NewJob, ProjectId};
    use cirrus_events::{JobEvent, RecordingNotifier, Topic, Topical, notifier_fn};

    use crate::jobs::{
        ActionContext, ActionError, ActionRegistry, ExecutionContext, InMemoryJobStore,
        JobController, JobError, JobOutcome, JobStore, Lifecycle, Worker, WorkerConfig,
    };
    use crate::waiter::Waiter;

    fn actions(executions: Arc<AtomicU32>) -> ActionRegistry {
        ActionRegistry::new()
            .register_fn("Sync", |_params, _ctx| async move {
                Err(ActionError::failed("remote endpoint refused the sync"))
            })
            .register_fn("CreateServer", move |params: Value, ctx: ActionContext| {
                let executions = executions.clone();
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    ctx.sleep(Duration::from_millis(50)).await;
                    Ok(json!({ "server": params["name"], "attempt": ctx.attempt }))
                }
            })
    }

    fn setup() -> (Arc<InMemoryJobStore>, Arc<JobController>, Arc<AtomicU32>) {
        let executions = Arc::new(AtomicU32::new(0));
        let store = InMemoryJobStore::arc();
        let controller = JobController::new(store.clone(), actions(executions.clone()));
        (store, Arc::new(controller), executions)
    }

    fn fast_worker(controller: Arc<JobController>) -> Worker {
        let config = WorkerConfig::default()
            .with_name("test-worker")
            .with_poll_interval(Duration::from_millis(10))
            .with_exec_timeout(Duration::from_secs(5));
        Worker::new(controller, config)
    }

    async fn claim(
        controller: &JobController,
        store: &InMemoryJobStore,
        ctx: &mut ExecutionContext,
        id: JobId,
    ) -> Job {
        let mut scope = ctx.transaction(store).await.unwrap();
        let fetched = controller.fetch(&mut scope, id).await.unwrap().unwrap();
        let prepared = controller.prepare(&mut scope, &fetched).await;
        scope.finish(prepared).await.unwrap()
    }

    #[tokio::test]
    async fn failing_job_backs_off_then_errors() {
        let (store, controller, _) = setup();
        let job = controller
            .create(
                NewJob::new("Sync", json!({"target": "p1-mirror"}))
                    .for_project(ProjectId::new("p1").unwrap())
                    .try_max(2)
                    .try_period(1),
            )
            .await
            .unwrap();

        // First failure: back to pending, one period later.
        let started = Utc::now();
        let mut ctx = ExecutionContext::for_job(job.id);
        let running = claim(&controller, &store, &mut ctx, job.id).await;
        let outcome = controller
            .execute(&mut ctx, &running, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Rescheduled { attempt: 1, .. }));

        let after_first = controller.get(job.id).await.unwrap();
        assert_eq!(after_first.status, JobStatus::Pending);
        assert_eq!(after_first.trys, 1);
        assert!(after_first.run_at >= started + chrono::Duration::seconds(1));
        assert!(after_first.run_at <= Utc::now() + chrono::Duration::seconds(1));

        // Not due yet: a worker pass leaves it alone.
        assert!(!controller
            .due_jobs(10, Default::default())
            .await
            .unwrap()
            .contains(&job.id));

        // Second failure: out of attempts, run_at untouched.
        let mut ctx = ExecutionContext::for_job(job.id);
        let running = claim(&controller, &store, &mut ctx, job.id).await;
        let outcome = controller
            .execute(&mut ctx, &running, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Exhausted { attempt: 2 });

        let after_second = controller.get(job.id).await.unwrap();
        assert_eq!(after_second.status, JobStatus::Error);
        assert_eq!(after_second.trys, 2);
        assert_eq!(after_second.run_at, after_first.run_at);
        assert_eq!(
            after_second.error.as_deref(),
            Some("remote endpoint refused the sync")
        );
    }

    #[tokio::test]
    async fn worker_runs_due_jobs_to_completion() {
        let (_, controller, executions) = setup();
        let job = controller
            .create(NewJob::new("CreateServer", json!({"name": "web-1", "password": "s3cret"})))
            .await
            .unwrap();

        let worker = fast_worker(controller.clone());
        let shutdown = CancellationToken::new();
        let waiter = Waiter::new()
            .with_patience(|_| Duration::from_millis(10))
            .with_timeout(Some(Duration::from_secs(5)));

        let lookup = controller.clone();
        let (finished, ()) = tokio::join!(
            async {
                let finished = waiter
                    .wait_object(|| lookup.get(job.id), |job| job.status.is_terminal())
                    .await;
                shutdown.cancel();
                finished
            },
            worker.run(shutdown.clone()),
        );

        let finished = finished.unwrap();
        assert_eq!(finished.status, JobStatus::Finished);
        assert_eq!(finished.trys, 1);
        assert_eq!(finished.error, None);
        assert_eq!(finished.params, json!({"name": "web-1", "password": "********"}));
        assert_eq!(finished.result, Some(json!({"server": "web-1", "attempt": 1})));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(worker.stats().completed, 1);
    }

    #[tokio::test]
    async fn racing_units_execute_a_job_once() {
        let (_, controller, executions) = setup();
        let job = controller
            .create(NewJob::new("CreateServer", json!({"name": "db-1"})))
            .await
            .unwrap();

        let timeout = Duration::from_secs(5);
        let (a, b) = tokio::join!(
            controller.run_job(job.id, timeout),
            controller.run_job(job.id, timeout)
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        let stored = controller.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Finished);
        assert_eq!(stored.trys, 1);
    }

    #[tokio::test]
    async fn abandoned_jobs_are_recovered_then_executed() {
        let (store, controller, executions) = setup();
        let job = controller
            .create(NewJob::new("CreateServer", json!({"name": "cache-1"})))
            .await
            .unwrap();
        // A previous worker died mid-execution.
        store
            .update(job.id, &JobChanges::new().status(JobStatus::Running))
            .await
            .unwrap();
        assert_eq!(controller.abandoned_jobs().await.unwrap(), vec![job.id]);

        let worker = fast_worker(controller.clone());
        let shutdown = CancellationToken::new();
        let waiter = Waiter::new().with_patience(|_| Duration::from_millis(10));

        let lookup = controller.clone();
        let (finished, ()) = tokio::join!(
            async {
                let finished = waiter
                    .wait_object(|| lookup.get(job.id), |job| job.is_finished())
                    .await;
                shutdown.cancel();
                finished
            },
            worker.run(shutdown.clone()),
        );

        assert_eq!(finished.unwrap().trys, 1);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(worker.stats().recovered, 1);
    }

    #[tokio::test]
    async fn notifiers_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        let second = order.clone();
        let recorder = Arc::new(RecordingNotifier::for_topics("finished-only", [Topic::JobFinished]));

        let executions = Arc::new(AtomicU32::new(0));
        let controller = JobController::new(InMemoryJobStore::arc(), actions(executions))
            .with_notifier(notifier_fn("first", Topic::ALL, move |event: &JobEvent| {
                first.lock().unwrap().push(format!("first:{}", event.topic()));
                Ok(())
            }))
            .with_notifier(notifier_fn("second", Topic::ALL, move |event: &JobEvent| {
                second.lock().unwrap().push(format!("second:{}", event.topic()));
                Ok(())
            }))
            .with_notifier(recorder.clone());

        let job = controller
            .create(NewJob::new("CreateServer", json!({"name": "lb-1"})))
            .await
            .unwrap();
        controller.run_job(job.id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec![
                "first:job-started",
                "second:job-started",
                "first:job-finished",
                "second:job-finished",
            ]
        );
        let finished = recorder.received();
        assert_eq!(finished.len(), 1);
        assert!(matches!(&finished[0], JobEvent::Finished { result, .. } if result["server"] == "lb-1"));
    }

    #[tokio::test]
    async fn unknown_actions_never_reach_the_store() {
        let (store, controller, _) = setup();
        let err = controller
            .create(NewJob::new("DeleteUniverse", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::UnknownAction(_)));

        let page = controller
            .limitation(&crate::jobs::JobQuery::new(crate::jobs::JobFilter::new()).unbounded())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        assert_eq!(store.locked_rows(), 0);
    }

    #[tokio::test]
    async fn waiting_for_a_missing_job_to_vanish_succeeds_at_once() {
        let (_, controller, _) = setup();
        let missing = JobId::new();
        Waiter::new()
            .wait_deleted(|| controller.get(missing))
            .await
            .unwrap();
    }
}
