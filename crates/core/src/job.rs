//! Job data model shared by the scheduler, storage and alerting crates.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

// ── Status ────────────────────────────────────────────────────

/// Lifecycle label persisted in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "pending to be claimed")]
    PendingToBeClaimed,
    #[serde(rename = "claimed")]
    Claimed,
    /// Stored headers could not be decoded; set aside at claim time.
    #[serde(rename = "bad headers")]
    BadHeaders,
    /// Recurrence failed to compile; set aside until an operator fixes it.
    #[serde(rename = "invalid recurrence")]
    InvalidRecurrence,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::PendingToBeClaimed => "pending to be claimed",
            JobStatus::Claimed => "claimed",
            JobStatus::BadHeaders => "bad headers",
            JobStatus::InvalidRecurrence => "invalid recurrence",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending to be claimed" => Ok(JobStatus::PendingToBeClaimed),
            "claimed" => Ok(JobStatus::Claimed),
            "bad headers" => Ok(JobStatus::BadHeaders),
            "invalid recurrence" => Ok(JobStatus::InvalidRecurrence),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

// ── Headers ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Decode the stored JSON header list. An empty or null column means no headers.
pub fn parse_headers(raw: Option<&str>) -> Result<Vec<Header>, CoreError> {
    match raw.map(str::trim) {
        None | Some("") | Some("null") => Ok(Vec::new()),
        Some(s) => serde_json::from_str(s).map_err(|e| CoreError::Headers(e.to_string())),
    }
}

/// Encode headers for storage.
pub fn encode_headers(headers: &[Header]) -> String {
    serde_json::to_string(headers).unwrap_or_else(|_| "[]".to_string())
}

// ── Job ───────────────────────────────────────────────────────

/// Alert sink activated when an execution lands outside the success set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPolicy {
    pub strategy: Option<String>,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    pub payload: Option<String>,
}

impl AlertPolicy {
    pub fn is_configured(&self) -> bool {
        self.strategy.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// The unit of scheduled work.
///
/// Plain data: the compiled recurrence, the timer handle and the abort
/// signal live next to it in the scheduler's registry, not in here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub endpoint: String,
    pub http_method: String,
    pub max_retries: i32,
    #[serde(default)]
    pub headers: Vec<Header>,
    pub success_statuses: Vec<i32>,
    pub tls_client_cert: Option<String>,
    #[serde(default)]
    pub alert: AlertPolicy,

    pub should_execute_at: Option<DateTime<Utc>>,
    pub last_execution: Option<DateTime<Utc>>,
    pub last_response_at: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    pub last_status_code: Option<i32>,
    pub succeeded: Option<bool>,

    pub status: JobStatus,
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh, unclaimed job. Mostly useful for seeding storage.
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        http_method: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            cron_expression: cron_expression.into(),
            endpoint: endpoint.into(),
            http_method: http_method.into(),
            max_retries: 0,
            headers: Vec::new(),
            success_statuses: vec![200],
            tls_client_cert: None,
            alert: AlertPolicy::default(),
            should_execute_at: None,
            last_execution: None,
            last_response_at: None,
            last_message: None,
            last_status_code: None,
            succeeded: None,
            status: JobStatus::PendingToBeClaimed,
            claimed_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// An execution is successful iff its status code is in the success set.
    pub fn is_success(&self, status_code: i32) -> bool {
        self.success_statuses.contains(&status_code)
    }

    /// Copy the outcome of one execution into the `last_*` fields.
    pub fn record(&mut self, result: &ExecutionResult, fired_at: DateTime<Utc>) {
        self.last_execution = Some(fired_at);
        self.last_response_at = Some(Utc::now());
        self.last_status_code = Some(result.status_code);
        self.last_message = Some(result.display_message().to_string());
        self.succeeded = Some(self.is_success(result.status_code));
    }

    /// Take the `last_*` fields from a copy that ran a cycle.
    pub fn copy_outcome_from(&mut self, other: &Job) {
        self.should_execute_at = other.should_execute_at;
        self.last_execution = other.last_execution;
        self.last_response_at = other.last_response_at;
        self.last_message = other.last_message.clone();
        self.last_status_code = other.last_status_code;
        self.succeeded = other.succeeded;
    }

    /// Overwrite the editable fields with `updates`.
    pub fn apply_updates(&mut self, updates: &JobUpdates) {
        self.cron_expression = updates.cron_expression.clone();
        self.endpoint = updates.endpoint.clone();
        self.http_method = updates.http_method.clone();
        self.max_retries = updates.max_retries;
        self.headers = updates.headers.clone();
        self.success_statuses = updates.success_statuses.clone();
        self.tls_client_cert = updates.tls_client_cert.clone();
        self.alert = updates.alert.clone();
        self.updated_at = updates.updated_at;
    }
}

/// Current editable fields of a job, as fetched after a change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdates {
    pub cron_expression: String,
    pub endpoint: String,
    pub http_method: String,
    pub max_retries: i32,
    pub headers: Vec<Header>,
    pub success_statuses: Vec<i32>,
    pub tls_client_cert: Option<String>,
    pub alert: AlertPolicy,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobUpdates {
    fn from(job: &Job) -> Self {
        Self {
            cron_expression: job.cron_expression.clone(),
            endpoint: job.endpoint.clone(),
            http_method: job.http_method.clone(),
            max_retries: job.max_retries,
            headers: job.headers.clone(),
            success_statuses: job.success_statuses.clone(),
            tls_client_cert: job.tls_client_cert.clone(),
            alert: job.alert.clone(),
            updated_at: job.updated_at,
        }
    }
}

// ── Execution ─────────────────────────────────────────────────

/// Outcome of one outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// HTTP status code, `0` when the request never produced a response.
    pub status_code: i32,
    /// Response body, lossily decoded as UTF-8.
    pub message: String,
    pub response_time: Duration,
    /// Set when the request could not be built or sent.
    pub scheduler_error: Option<String>,
}

impl ExecutionResult {
    pub fn failed(error: impl Into<String>, response_time: Duration) -> Self {
        Self {
            status_code: 0,
            message: String::new(),
            response_time,
            scheduler_error: Some(error.into()),
        }
    }

    /// The body, or the scheduler error when no response was received.
    pub fn display_message(&self) -> &str {
        match &self.scheduler_error {
            Some(err) => err,
            None => &self.message,
        }
    }
}

/// Immutable historical record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub job_id: Uuid,
    pub endpoint: String,
    pub http_method: String,
    pub headers: Vec<Header>,
    pub response_time_ms: i64,
    pub status_code: i32,
    pub message: String,
    pub succeeded: bool,
    pub created_at: DateTime<Utc>,
}

impl JobExecution {
    /// Snapshot of `job` right after [`Job::record`].
    pub fn snapshot(job: &Job, response_time: Duration) -> Self {
        Self {
            job_id: job.id,
            endpoint: job.endpoint.clone(),
            http_method: job.http_method.clone(),
            headers: job.headers.clone(),
            response_time_ms: i64::try_from(response_time.as_millis()).unwrap_or(i64::MAX),
            status_code: job.last_status_code.unwrap_or(0),
            message: job.last_message.clone().unwrap_or_default(),
            succeeded: job.succeeded.unwrap_or(false),
            created_at: job.last_response_at.unwrap_or_else(Utc::now),
        }
    }
}
