//! Capabilities injected into timer tasks.
//!
//! A timer task knows how to wait and run one cycle; what "run" and
//! "report" mean is supplied here, so jobs have no dependency on storage
//! or alerting.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use watchpost_core::{ExecutionResult, Job, JobExecution};
use watchpost_notify::templating::{JobContext, ResultContext};
use watchpost_notify::{AlertContext, AlertDispatcher, AlertInput, AlertOutcome, PayloadRenderer};
use watchpost_storage::SchedulerStorage;

/// Performs the outbound call for a job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> ExecutionResult;
}

/// Reacts to a classified execution. `job` already carries the new `last_*` fields.
#[async_trait]
pub trait OutcomeHandler: Send + Sync {
    async fn handle(&self, job: &Job, result: &ExecutionResult);
}

/// Everything a timer task may call.
#[derive(Clone)]
pub struct Callbacks {
    pub execute: Arc<dyn JobExecutor>,
    pub on_success: Arc<dyn OutcomeHandler>,
    pub on_error: Arc<dyn OutcomeHandler>,
}

impl Callbacks {
    /// Record every execution; alert on failures before recording them.
    pub fn standard(
        execute: Arc<dyn JobExecutor>,
        storage: Arc<dyn SchedulerStorage>,
        alerts: Arc<AlertDispatcher>,
    ) -> Self {
        let write_back = WriteBack::new(storage);
        Self {
            execute,
            on_success: Arc::new(write_back.clone()),
            on_error: Arc::new(AlertThenWriteBack::new(alerts, write_back)),
        }
    }
}

// ── Write-back ────────────────────────────────────────────────

/// Persist the execution record and the job's `last_*` fields.
#[derive(Clone)]
pub struct WriteBack {
    storage: Arc<dyn SchedulerStorage>,
}

impl WriteBack {
    pub fn new(storage: Arc<dyn SchedulerStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl OutcomeHandler for WriteBack {
    async fn handle(&self, job: &Job, result: &ExecutionResult) {
        let execution = JobExecution::snapshot(job, result.response_time);
        match self.storage.write_done(job, &execution).await {
            Ok(()) => debug!(job_id = %job.id, status = execution.status_code, "execution recorded"),
            Err(e) => warn!(job_id = %job.id, error = %e, "recording execution failed"),
        }
    }
}

// ── Alerting ──────────────────────────────────────────────────

/// Send the job's alert (if it has one), then write back regardless of how
/// the alert went.
pub struct AlertThenWriteBack {
    alerts: Arc<AlertDispatcher>,
    renderer: PayloadRenderer,
    write_back: WriteBack,
}

impl AlertThenWriteBack {
    pub fn new(alerts: Arc<AlertDispatcher>, write_back: WriteBack) -> Self {
        Self {
            alerts,
            renderer: PayloadRenderer::new(),
            write_back,
        }
    }

    fn alert_input(&self, job: &Job, result: &ExecutionResult) -> AlertInput {
        let ctx = AlertContext {
            job: JobContext {
                id: job.id.to_string(),
                name: job.name.clone(),
                endpoint: job.endpoint.clone(),
                method: job.http_method.clone(),
            },
            result: ResultContext {
                status: result.status_code,
                message: result.display_message().to_string(),
                response_time_ms: result.response_time.as_millis() as u64,
            },
            now: Utc::now().to_rfc3339(),
        };
        AlertInput {
            strategy: job.alert.strategy.clone().unwrap_or_default(),
            url: job.alert.endpoint.clone().unwrap_or_default(),
            method: job.alert.method.clone().unwrap_or_default(),
            payload: job
                .alert
                .payload
                .as_deref()
                .map(|template| self.renderer.render_or_raw(template, &ctx)),
            expected_status: None,
            expected_message: None,
            headers: job
                .alert
                .headers
                .iter()
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect::<HashMap<_, _>>(),
        }
    }
}

#[async_trait]
impl OutcomeHandler for AlertThenWriteBack {
    async fn handle(&self, job: &Job, result: &ExecutionResult) {
        if job.alert.is_configured() {
            let report = self.alerts.send_alert(&self.alert_input(job, result)).await;
            if report.outcome != AlertOutcome::Delivered {
                warn!(
                    job_id = %job.id,
                    strategy = %report.strategy,
                    outcome = ?report.outcome,
                    message = %report.message,
                    "alert not delivered"
                );
            }
        }
        self.write_back.handle(job, result).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use watchpost_core::{AlertPolicy, Header};
    use watchpost_notify::{AlertError, AlertStrategy};
    use watchpost_storage::MemoryBackend;

    struct RecordingStrategy {
        sent: Arc<std::sync::Mutex<Vec<AlertInput>>>,
        fail: bool,
    }

    #[async_trait]
    impl AlertStrategy for RecordingStrategy {
        async fn send(&self, input: &AlertInput) -> Result<String, AlertError> {
            self.sent.lock().unwrap().push(input.clone());
            if self.fail {
                Err(AlertError::NoUrl)
            } else {
                Ok("ok".into())
            }
        }
        fn name(&self) -> &str {
            "http"
        }
    }

    fn failing_job(backend: &MemoryBackend) -> Job {
        let mut job = Job::new("api", "* * * * *", "GET", "http://localhost/api");
        job.alert = AlertPolicy {
            strategy: Some("http".into()),
            endpoint: Some("http://alerts.local/hook".into()),
            method: Some("POST".into()),
            headers: vec![Header::new("x-team", "core")],
            payload: Some("{{ job.name }} returned {{ result.status }}".into()),
        };
        backend.insert(job.clone());
        job
    }

    async fn run_on_error(fail_alert: bool) -> (MemoryBackend, Job, Vec<AlertInput>) {
        let backend = MemoryBackend::new();
        let storage = Arc::new(backend.storage("node-a"));
        let mut job = failing_job(&backend);
        storage.available_jobs(1).await.unwrap();

        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let strategy = RecordingStrategy {
            sent: sent.clone(),
            fail: fail_alert,
        };
        let strategies: Vec<Box<dyn AlertStrategy>> = vec![Box::new(strategy)];
        let alerts = Arc::new(AlertDispatcher::new(strategies, &["http".into()]));
        let handler = AlertThenWriteBack::new(alerts, WriteBack::new(storage));

        let result = ExecutionResult {
            status_code: 503,
            message: "down".into(),
            response_time: Duration::from_millis(9),
            scheduler_error: None,
        };
        job.record(&result, Utc::now());
        handler.handle(&job, &result).await;
        let sent = sent.lock().unwrap().clone();
        (backend, job, sent)
    }

    #[tokio::test]
    async fn failure_alerts_with_rendered_payload_then_records() {
        let (backend, job, sent) = run_on_error(false).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.as_deref(), Some("api returned 503"));
        assert_eq!(sent[0].headers.get("x-team").map(String::as_str), Some("core"));
        assert_eq!(backend.executions_for(job.id).len(), 1);
    }

    #[tokio::test]
    async fn failed_alert_does_not_block_write_back() {
        let (backend, job, sent) = run_on_error(true).await;
        assert_eq!(sent.len(), 1);
        let history = backend.executions_for(job.id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status_code, 503);
        assert!(!history[0].succeeded);
    }

    #[tokio::test]
    async fn unregistered_strategy_still_records() {
        let backend = MemoryBackend::new();
        let storage = Arc::new(backend.storage("node-a"));
        let mut job = failing_job(&backend);
        job.alert.strategy = Some("pager".into());
        storage.available_jobs(1).await.unwrap();

        let handler = AlertThenWriteBack::new(
            Arc::new(AlertDispatcher::empty()),
            WriteBack::new(storage),
        );
        let result = ExecutionResult::failed("connection refused", Duration::ZERO);
        job.record(&result, Utc::now());
        handler.handle(&job, &result).await;
        assert_eq!(backend.executions_for(job.id).len(), 1);
    }

    #[tokio::test]
    async fn write_back_failure_is_swallowed() {
        let backend = MemoryBackend::new();
        let storage = Arc::new(backend.storage("node-a"));
        // Never inserted, so write_done fails with NotFound.
        let job = Job::new("gone", "* * * * *", "GET", "http://localhost/");
        WriteBack::new(storage)
            .handle(&job, &ExecutionResult::failed("x", Duration::ZERO))
            .await;
        assert!(backend.executions_for(job.id).is_empty());
    }
}
