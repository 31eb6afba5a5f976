//! Per-job timer task: wait for the next fire time, run once, report.

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use watchpost_core::{Job, Recurrence};

use crate::callbacks::Callbacks;
use crate::registry::Armed;

/// Sent to the scheduler after a cycle ran to completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub job_id: Uuid,
    /// Generation of the timer task that ran; stale generations are not rescheduled.
    pub generation: u64,
    /// The task's copy of the job, with the new `last_*` fields.
    pub job: Job,
    /// The recurrence ran out of fire times; nothing was executed.
    pub exhausted: bool,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Completed(Job),
    /// The abort token fired (or was dropped) before the fire time.
    Aborted,
    /// The recurrence has no future fire time.
    Exhausted,
}

/// Run one cycle for `job`.
///
/// The executor sees `job` exactly as it was when the task started, so
/// edits that land while the cycle is in flight only affect the next one.
pub async fn run_cycle(
    mut job: Job,
    recurrence: &Recurrence,
    callbacks: &Callbacks,
    abort: oneshot::Receiver<()>,
) -> CycleOutcome {
    let Some((next, delay)) = recurrence.delay_from(Utc::now()) else {
        return CycleOutcome::Exhausted;
    };
    job.should_execute_at = Some(next);
    debug!(job_id = %job.id, next = %next, "waiting for next fire time");

    tokio::select! {
        biased;
        _ = abort => return CycleOutcome::Aborted,
        _ = tokio::time::sleep(delay) => {}
    }

    let fired_at = Utc::now();
    let result = callbacks.execute.execute(&job).await;
    job.record(&result, fired_at);

    if job.is_success(result.status_code) {
        callbacks.on_success.handle(&job, &result).await;
    } else {
        debug!(job_id = %job.id, status = result.status_code, "execution outside success set");
        callbacks.on_error.handle(&job, &result).await;
    }
    CycleOutcome::Completed(job)
}

/// Spawn the timer task for an armed job.
pub fn spawn(armed: Armed, callbacks: Callbacks, completions: mpsc::Sender<Completion>) {
    tokio::spawn(async move {
        let Armed {
            job,
            recurrence,
            generation,
            abort,
        } = armed;
        let job_id = job.id;

        let completion = match run_cycle(job.clone(), &recurrence, &callbacks, abort).await {
            CycleOutcome::Completed(job) => Completion {
                job_id,
                generation,
                job,
                exhausted: false,
            },
            CycleOutcome::Aborted => {
                debug!(job_id = %job_id, generation, "timer aborted");
                return;
            }
            CycleOutcome::Exhausted => {
                warn!(
                    job_id = %job_id,
                    recurrence = recurrence.expression(),
                    "recurrence has no future fire time"
                );
                Completion {
                    job_id,
                    generation,
                    job,
                    exhausted: true,
                }
            }
        };
        if completions.send(completion).await.is_err() {
            debug!(job_id = %job_id, "scheduler stopped before completion was delivered");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use watchpost_core::ExecutionResult;

    use crate::callbacks::{JobExecutor, OutcomeHandler};

    struct FixedStatus {
        status: i32,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobExecutor for FixedStatus {
        async fn execute(&self, _job: &Job) -> ExecutionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.status == 0 {
                return ExecutionResult::failed("connection refused", Duration::ZERO);
            }
            ExecutionResult {
                status_code: self.status,
                message: "body".into(),
                response_time: Duration::from_millis(1),
                scheduler_error: None,
            }
        }
    }

    #[derive(Default)]
    struct Count(AtomicUsize);

    #[async_trait]
    impl OutcomeHandler for Count {
        async fn handle(&self, _job: &Job, _result: &ExecutionResult) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn harness(status: i32) -> (Callbacks, Arc<FixedStatus>, Arc<Count>, Arc<Count>) {
        let executor = Arc::new(FixedStatus {
            status,
            calls: AtomicUsize::new(0),
        });
        let ok = Arc::new(Count::default());
        let err = Arc::new(Count::default());
        let callbacks = Callbacks {
            execute: executor.clone(),
            on_success: ok.clone(),
            on_error: err.clone(),
        };
        (callbacks, executor, ok, err)
    }

    fn job(cron: &str) -> (Job, Recurrence) {
        (
            Job::new("t", cron, "GET", "http://localhost/"),
            Recurrence::parse(cron).unwrap(),
        )
    }

    #[tokio::test]
    async fn abort_while_waiting_skips_execution() {
        let (callbacks, executor, ok, err) = harness(200);
        // Once a year: never fires during the test.
        let (job, recurrence) = job("0 0 1 1 *");
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(async move { run_cycle(job, &recurrence, &callbacks, rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Aborted));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ok.0.load(Ordering::SeqCst) + err.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropped_token_counts_as_abort() {
        let (callbacks, executor, _, _) = harness(200);
        let (job, recurrence) = job("0 0 1 1 *");
        let (tx, rx) = oneshot::channel::<()>();
        drop(tx);
        let outcome = run_cycle(job, &recurrence, &callbacks, rx).await;
        assert!(matches!(outcome, CycleOutcome::Aborted));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_runs_success_callback() {
        let (callbacks, executor, ok, err) = harness(200);
        let (job, recurrence) = job("* * * * * *");
        let (_tx, rx) = oneshot::channel();

        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            run_cycle(job, &recurrence, &callbacks, rx),
        )
        .await
        .unwrap();

        let CycleOutcome::Completed(job) = outcome else {
            panic!("expected a completed cycle, got {outcome:?}");
        };
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ok.0.load(Ordering::SeqCst), 1);
        assert_eq!(err.0.load(Ordering::SeqCst), 0);
        assert_eq!(job.last_status_code, Some(200));
        assert_eq!(job.succeeded, Some(true));
        assert!(job.should_execute_at.is_some());
    }

    #[tokio::test]
    async fn transport_failure_runs_error_callback() {
        let (callbacks, _, ok, err) = harness(0);
        let (job, recurrence) = job("* * * * * *");
        let (_tx, rx) = oneshot::channel();

        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            run_cycle(job, &recurrence, &callbacks, rx),
        )
        .await
        .unwrap();

        let CycleOutcome::Completed(job) = outcome else {
            panic!("expected a completed cycle, got {outcome:?}");
        };
        assert_eq!(ok.0.load(Ordering::SeqCst), 0);
        assert_eq!(err.0.load(Ordering::SeqCst), 1);
        assert_eq!(job.last_status_code, Some(0));
        assert_eq!(job.last_message.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn spawned_task_reports_completion_with_generation() {
        let (callbacks, _, _, _) = harness(204);
        let (job, recurrence) = job("* * * * * *");
        let (_tx, rx) = oneshot::channel();
        let (done_tx, mut done_rx) = mpsc::channel(1);
        let id = job.id;

        spawn(
            Armed {
                job,
                recurrence,
                generation: 7,
                abort: rx,
            },
            callbacks,
            done_tx,
        );

        let completion = tokio::time::timeout(Duration::from_secs(3), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion.job_id, id);
        assert_eq!(completion.generation, 7);
        assert_eq!(completion.job.last_status_code, Some(204));
        assert!(!completion.exhausted);
    }

    #[tokio::test]
    async fn exhausted_recurrence_is_reported_without_executing() {
        let (callbacks, executor, _, _) = harness(200);
        let (job, recurrence) = job("0 0 0 1 1 * 2020");
        let (_tx, rx) = oneshot::channel();
        let (done_tx, mut done_rx) = mpsc::channel(1);

        spawn(
            Armed {
                job,
                recurrence,
                generation: 1,
                abort: rx,
            },
            callbacks,
            done_tx,
        );

        let completion = tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(completion.exhausted);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }
}
