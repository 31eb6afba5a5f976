//! Contracts between the scheduler and the shared job table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use watchpost_core::{AlertPolicy, Header, Job, JobExecution, JobStatus, JobUpdates};

use crate::error::StorageError;

/// Payload that ends an instance's change listener instead of naming a job.
pub const RELEASE_PAYLOAD: &str = "release";

/// Claim, release and change-notification protocol used by one scheduler instance.
///
/// Every implementation identifies itself with an instance name; that name is
/// written to `claimed_by` on claim and is the channel change notifications
/// for the instance's jobs are published on.
#[async_trait]
pub trait SchedulerStorage: Send + Sync {
    /// Name written to `claimed_by` and used as the notification channel.
    fn instance_name(&self) -> &str;

    /// Claim up to `limit` jobs in status `pending to be claimed`.
    ///
    /// Rows locked by a concurrent claim are skipped, never waited on. Either
    /// every returned job is marked claimed by this instance or none is.
    async fn available_jobs(&self, limit: usize) -> Result<Vec<Job>, StorageError>;

    /// Return the given jobs to the pool in one transaction.
    ///
    /// Only rows this instance still owns are touched, so releasing the same
    /// batch twice is the same as releasing it once.
    async fn release_all(&self, ids: &[Uuid]) -> Result<(), StorageError>;

    /// Current editable fields of a job, `None` if the row is gone.
    async fn job_updates(&self, id: Uuid) -> Result<Option<JobUpdates>, StorageError>;

    /// Forward job ids published on this instance's channel to `sink` until
    /// `cancel` flips to `true`. Returns once the subscription is established.
    async fn listen_for_changes(
        &self,
        sink: mpsc::Sender<Uuid>,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), StorageError>;

    /// Unsubscribe and wait for the listener to wind down.
    async fn stop_listening_for_changes(&self) -> Result<(), StorageError>;

    /// Append `execution` and copy the job's `last_*` fields, in one transaction.
    /// The `last_*` fields are only written while this instance owns the row.
    async fn write_done(&self, job: &Job, execution: &JobExecution) -> Result<(), StorageError>;

    /// Set a job aside as `invalid recurrence` and give up ownership of it.
    async fn mark_invalid(&self, id: Uuid, reason: &str) -> Result<(), StorageError>;
}

// ── Administrative operations ─────────────────────────────────

/// Fields needed to register a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub cron_expression: String,
    pub endpoint: String,
    pub http_method: String,
    #[serde(default)]
    pub max_retries: i32,
    #[serde(default)]
    pub headers: Vec<Header>,
    pub success_statuses: Vec<i32>,
    pub tls_client_cert: Option<String>,
    #[serde(default)]
    pub alert: AlertPolicy,
}

impl NewJob {
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        http_method: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cron_expression: cron_expression.into(),
            endpoint: endpoint.into(),
            http_method: http_method.into(),
            max_retries: 0,
            headers: Vec::new(),
            success_statuses: vec![200],
            tls_client_cert: None,
            alert: AlertPolicy::default(),
        }
    }

    pub(crate) fn into_job(self, id: Uuid) -> Job {
        let mut job = Job::new(self.name, self.cron_expression, self.http_method, self.endpoint);
        job.id = id;
        job.max_retries = self.max_retries;
        job.headers = self.headers;
        job.success_statuses = self.success_statuses;
        job.tls_client_cert = self.tls_client_cert;
        job.alert = self.alert;
        job
    }
}

/// Partial update of a job's editable fields (absent = unchanged).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub endpoint: Option<String>,
    pub http_method: Option<String>,
    pub max_retries: Option<i32>,
    pub headers: Option<Vec<Header>>,
    pub success_statuses: Option<Vec<i32>>,
    /// `Some(None)` (JSON `null`) removes the certificate.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub tls_client_cert: Option<Option<String>>,
    pub alert: Option<AlertPolicy>,
}

// Keeps an explicit `null` apart from an absent field.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl JobPatch {
    /// Apply the present fields to `job`.
    ///
    /// An unowned job that was set aside becomes claimable again once the
    /// field that disqualified it is patched.
    pub fn apply(self, job: &mut Job) {
        let reopen = match job.status {
            JobStatus::InvalidRecurrence => self.cron_expression.is_some(),
            JobStatus::BadHeaders => self.headers.is_some(),
            _ => false,
        };
        if let Some(v) = self.name {
            job.name = v;
        }
        if let Some(v) = self.cron_expression {
            job.cron_expression = v;
        }
        if let Some(v) = self.endpoint {
            job.endpoint = v;
        }
        if let Some(v) = self.http_method {
            job.http_method = v;
        }
        if let Some(v) = self.max_retries {
            job.max_retries = v;
        }
        if let Some(v) = self.headers {
            job.headers = v;
        }
        if let Some(v) = self.success_statuses {
            job.success_statuses = v;
        }
        if let Some(v) = self.tls_client_cert {
            job.tls_client_cert = v;
        }
        if let Some(v) = self.alert {
            job.alert = v;
        }
        if reopen && job.claimed_by.is_none() {
            job.status = JobStatus::PendingToBeClaimed;
        }
        job.updated_at = chrono::Utc::now();
    }
}

/// Job CRUD and history queries backing the administrative API.
///
/// Updates and deletes publish the job id on the owning instance's channel
/// so the owner picks the change up without waiting for a restart.
#[async_trait]
pub trait JobAdmin: Send + Sync {
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StorageError>;

    async fn job(&self, id: Uuid) -> Result<Option<Job>, StorageError>;

    /// Apply `patch`, returning the updated job or `None` if it does not exist.
    async fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Option<Job>, StorageError>;

    /// Delete a job, returning whether it existed.
    async fn delete_job(&self, id: Uuid) -> Result<bool, StorageError>;

    async fn claimed_jobs(
        &self,
        instance: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, StorageError>;

    /// Newest first.
    async fn executions(
        &self,
        job_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobExecution>, StorageError>;

    /// Ask `instance` to stop consuming change notifications.
    async fn notify_release(&self, instance: &str) -> Result<(), StorageError>;
}

// ── Listener plumbing ─────────────────────────────────────────

/// Resolves once `cancel` holds `true` or its sender is gone.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// What a listener loop should do after one notification.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// Route one notification payload to `sink`.
pub(crate) async fn forward_payload(channel: &str, payload: &str, sink: &mpsc::Sender<Uuid>) -> Flow {
    if payload == RELEASE_PAYLOAD {
        tracing::info!(channel, "release notification received, no longer listening");
        return Flow::Stop;
    }
    match Uuid::parse_str(payload.trim()) {
        Ok(id) => {
            if sink.send(id).await.is_err() {
                tracing::debug!(channel, "change sink closed, listener exiting");
                return Flow::Stop;
            }
            Flow::Continue
        }
        Err(e) => {
            tracing::warn!(channel, payload, error = %e, "ignoring malformed change notification");
            Flow::Continue
        }
    }
}
