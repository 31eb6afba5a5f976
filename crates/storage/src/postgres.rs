//! PostgreSQL implementation of the claim layer.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a transaction so that
//! concurrent instances never wait on, or double-claim, each other's rows.
//! Change notifications ride on `LISTEN`/`NOTIFY`, one channel per instance.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use watchpost_core::config::PostgresConfig;
use watchpost_core::{
    encode_headers, parse_headers, AlertPolicy, CoreError, Job, JobExecution, JobStatus,
    JobUpdates,
};

use crate::error::StorageError;
use crate::traits::{
    cancelled, forward_payload, Flow, JobAdmin, JobPatch, NewJob, SchedulerStorage,
    RELEASE_PAYLOAD,
};

const JOB_COLUMNS: &str = "id, job_name, cron_exp_string, endpoint, http_method, max_retries, \
    headers, success_statuses, tls_client_cert, alert_strategy, alert_endpoint, alert_method, \
    alert_headers, alert_payload, should_execute_at, last_execution, last_response_at, \
    last_message, last_status_code, succeeded, status, claimed_by, created_at, updated_at";

const UPDATE_COLUMNS: &str = "cron_exp_string, endpoint, http_method, max_retries, headers, \
    success_statuses, tls_client_cert, alert_strategy, alert_endpoint, alert_method, \
    alert_headers, alert_payload, updated_at";

/// How long `stop_listening_for_changes` waits for the listener task.
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

// ── Rows ──────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_name: String,
    cron_exp_string: String,
    endpoint: String,
    http_method: String,
    max_retries: i32,
    headers: Option<String>,
    success_statuses: Vec<i32>,
    tls_client_cert: Option<String>,
    alert_strategy: Option<String>,
    alert_endpoint: Option<String>,
    alert_method: Option<String>,
    alert_headers: Option<String>,
    alert_payload: Option<String>,
    should_execute_at: Option<DateTime<Utc>>,
    last_execution: Option<DateTime<Utc>>,
    last_response_at: Option<DateTime<Utc>>,
    last_message: Option<String>,
    last_status_code: Option<i32>,
    succeeded: Option<bool>,
    status: String,
    claimed_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            name: row.job_name,
            cron_expression: row.cron_exp_string,
            endpoint: row.endpoint,
            http_method: row.http_method,
            max_retries: row.max_retries,
            headers: parse_headers(row.headers.as_deref())?,
            success_statuses: row.success_statuses,
            tls_client_cert: row.tls_client_cert,
            alert: AlertPolicy {
                strategy: row.alert_strategy,
                endpoint: row.alert_endpoint,
                method: row.alert_method,
                headers: parse_headers(row.alert_headers.as_deref())?,
                payload: row.alert_payload,
            },
            should_execute_at: row.should_execute_at,
            last_execution: row.last_execution,
            last_response_at: row.last_response_at,
            last_message: row.last_message,
            last_status_code: row.last_status_code,
            succeeded: row.succeeded,
            status: row.status.parse()?,
            claimed_by: row.claimed_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UpdatesRow {
    cron_exp_string: String,
    endpoint: String,
    http_method: String,
    max_retries: i32,
    headers: Option<String>,
    success_statuses: Vec<i32>,
    tls_client_cert: Option<String>,
    alert_strategy: Option<String>,
    alert_endpoint: Option<String>,
    alert_method: Option<String>,
    alert_headers: Option<String>,
    alert_payload: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UpdatesRow> for JobUpdates {
    type Error = CoreError;

    fn try_from(row: UpdatesRow) -> Result<Self, Self::Error> {
        Ok(JobUpdates {
            cron_expression: row.cron_exp_string,
            endpoint: row.endpoint,
            http_method: row.http_method,
            max_retries: row.max_retries,
            headers: parse_headers(row.headers.as_deref())?,
            success_statuses: row.success_statuses,
            tls_client_cert: row.tls_client_cert,
            alert: AlertPolicy {
                strategy: row.alert_strategy,
                endpoint: row.alert_endpoint,
                method: row.alert_method,
                headers: parse_headers(row.alert_headers.as_deref())?,
                payload: row.alert_payload,
            },
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    job_id: Uuid,
    endpoint: String,
    http_method: String,
    headers: Option<String>,
    response_time_ms: i64,
    status_code: i32,
    message: String,
    succeeded: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for JobExecution {
    type Error = CoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(JobExecution {
            job_id: row.job_id,
            endpoint: row.endpoint,
            http_method: row.http_method,
            headers: parse_headers(row.headers.as_deref())?,
            response_time_ms: row.response_time_ms,
            status_code: row.status_code,
            message: row.message,
            succeeded: row.succeeded,
            created_at: row.created_at,
        })
    }
}

// ── Store ─────────────────────────────────────────────────────

struct ListenerHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Claim layer backed by a shared PostgreSQL `jobs` table.
pub struct PgStorage {
    pool: PgPool,
    instance: String,
    listener: Mutex<Option<ListenerHandle>>,
}

impl PgStorage {
    /// Connect a pool sized from `config`.
    pub async fn connect(config: &PostgresConfig, instance: impl Into<String>) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await?;
        info!(host = %config.host, db = %config.database, "PostgreSQL connected");
        Ok(Self::from_pool(pool, instance))
    }

    pub fn from_pool(pool: PgPool, instance: impl Into<String>) -> Self {
        Self {
            pool,
            instance: instance.into(),
            listener: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("Database migrations applied successfully");
        Ok(())
    }
}

#[async_trait]
impl SchedulerStorage for PgStorage {
    fn instance_name(&self) -> &str {
        &self.instance
    }

    async fn available_jobs(&self, limit: usize) -> Result<Vec<Job>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut tx = self.pool.begin().await?;
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 \
             ORDER BY created_at LIMIT $2 FOR UPDATE SKIP LOCKED"
        ))
        .bind(JobStatus::PendingToBeClaimed.as_str())
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        let mut bad_headers = Vec::new();
        for row in rows {
            let id = row.id;
            match Job::try_from(row) {
                Ok(job) => claimed.push(job),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "setting aside job with unreadable row");
                    bad_headers.push(id);
                }
            }
        }

        let ids: Vec<Uuid> = claimed.iter().map(|j| j.id).collect();
        if !ids.is_empty() {
            sqlx::query("UPDATE jobs SET status = $1, claimed_by = $2 WHERE id = ANY($3)")
                .bind(JobStatus::Claimed.as_str())
                .bind(&self.instance)
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
        }
        if !bad_headers.is_empty() {
            sqlx::query("UPDATE jobs SET status = $1, claimed_by = NULL WHERE id = ANY($2)")
                .bind(JobStatus::BadHeaders.as_str())
                .bind(&bad_headers)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        for job in &mut claimed {
            job.status = JobStatus::Claimed;
            job.claimed_by = Some(self.instance.clone());
        }
        debug!(claimed = claimed.len(), set_aside = bad_headers.len(), "claim transaction committed");
        Ok(claimed)
    }

    async fn release_all(&self, ids: &[Uuid]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let released = sqlx::query(
            "UPDATE jobs SET claimed_by = NULL, status = $1 WHERE id = ANY($2) AND claimed_by = $3",
        )
        .bind(JobStatus::PendingToBeClaimed.as_str())
        .bind(ids)
        .bind(&self.instance)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        info!(requested = ids.len(), released, "jobs released");
        Ok(())
    }

    async fn job_updates(&self, id: Uuid) -> Result<Option<JobUpdates>, StorageError> {
        let row: Option<UpdatesRow> =
            sqlx::query_as(&format!("SELECT {UPDATE_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(JobUpdates::try_from).transpose()?)
    }

    async fn listen_for_changes(
        &self,
        sink: mpsc::Sender<Uuid>,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), StorageError> {
        let mut guard = self.listener.lock().await;
        if let Some(previous) = guard.take() {
            let _ = previous.stop.send(());
            previous.task.abort();
        }

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.instance).await?;
        info!(channel = %self.instance, "listening for job changes");

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(listen_loop(
            listener,
            self.instance.clone(),
            sink,
            cancel,
            stop_rx,
        ));
        *guard = Some(ListenerHandle { stop, task });
        Ok(())
    }

    async fn stop_listening_for_changes(&self) -> Result<(), StorageError> {
        let Some(handle) = self.listener.lock().await.take() else {
            return Ok(());
        };
        let _ = handle.stop.send(());
        match tokio::time::timeout(LISTENER_STOP_TIMEOUT, handle.task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StorageError::Listener(e.to_string())),
            Err(_) => Err(StorageError::Listener("listener did not stop in time".into())),
        }
    }

    async fn write_done(&self, job: &Job, execution: &JobExecution) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO job_executions \
             (id, job_id, endpoint, http_method, headers, response_time_ms, status_code, message, succeeded, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(Uuid::new_v4())
        .bind(execution.job_id)
        .bind(&execution.endpoint)
        .bind(&execution.http_method)
        .bind(encode_headers(&execution.headers))
        .bind(execution.response_time_ms)
        .bind(execution.status_code)
        .bind(&execution.message)
        .bind(execution.succeeded)
        .bind(execution.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE jobs SET should_execute_at = $2, last_execution = $3, last_response_at = $4, \
             last_message = $5, last_status_code = $6, succeeded = $7 \
             WHERE id = $1 AND claimed_by = $8",
        )
        .bind(job.id)
        .bind(job.should_execute_at)
        .bind(job.last_execution)
        .bind(job.last_response_at)
        .bind(&job.last_message)
        .bind(job.last_status_code)
        .bind(job.succeeded)
        .bind(&self.instance)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_invalid(&self, id: Uuid, reason: &str) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE jobs SET status = $2, claimed_by = NULL, last_message = $3 \
             WHERE id = $1 AND claimed_by = $4",
        )
        .bind(id)
        .bind(JobStatus::InvalidRecurrence.as_str())
        .bind(reason)
        .bind(&self.instance)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn listen_loop(
    mut listener: PgListener,
    channel: String,
    sink: mpsc::Sender<Uuid>,
    mut cancel: watch::Receiver<bool>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = cancelled(&mut cancel) => {
                debug!(channel = %channel, "listener cancelled");
                break;
            }
            _ = &mut stop => {
                if let Err(e) = listener.unlisten(&channel).await {
                    warn!(channel = %channel, error = %e, "UNLISTEN failed");
                }
                debug!(channel = %channel, "listener stopped");
                break;
            }
            received = listener.recv() => match received {
                Ok(notification) => {
                    if forward_payload(&channel, notification.payload(), &sink).await == Flow::Stop {
                        break;
                    }
                }
                Err(e) => {
                    // The next recv() reconnects and re-issues LISTEN.
                    warn!(channel = %channel, error = %e, "notification stream interrupted");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

// ── Administrative operations ─────────────────────────────────

#[async_trait]
impl JobAdmin for PgStorage {
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StorageError> {
        let job = new_job.into_job(Uuid::new_v4());
        let row: JobRow = sqlx::query_as(&format!(
            "INSERT INTO jobs (id, job_name, cron_exp_string, endpoint, http_method, max_retries, \
             headers, success_statuses, tls_client_cert, alert_strategy, alert_endpoint, \
             alert_method, alert_headers, alert_payload, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.cron_expression)
        .bind(&job.endpoint)
        .bind(&job.http_method)
        .bind(job.max_retries)
        .bind(encode_headers(&job.headers))
        .bind(&job.success_statuses)
        .bind(&job.tls_client_cert)
        .bind(&job.alert.strategy)
        .bind(&job.alert.endpoint)
        .bind(&job.alert.method)
        .bind(encode_headers(&job.alert.headers))
        .bind(&job.alert.payload)
        .bind(JobStatus::PendingToBeClaimed.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(Job::try_from(row)?)
    }

    async fn job(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        let row: Option<JobRow> = sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Job::try_from).transpose()?)
    }

    async fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Option<Job>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"))
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = Job::try_from(row)?;
        patch.apply(&mut job);

        sqlx::query(
            "UPDATE jobs SET job_name = $2, cron_exp_string = $3, endpoint = $4, http_method = $5, \
             max_retries = $6, headers = $7, success_statuses = $8, tls_client_cert = $9, \
             alert_strategy = $10, alert_endpoint = $11, alert_method = $12, alert_headers = $13, \
             alert_payload = $14, status = $15, updated_at = $16 WHERE id = $1",
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.cron_expression)
        .bind(&job.endpoint)
        .bind(&job.http_method)
        .bind(job.max_retries)
        .bind(encode_headers(&job.headers))
        .bind(&job.success_statuses)
        .bind(&job.tls_client_cert)
        .bind(&job.alert.strategy)
        .bind(&job.alert.endpoint)
        .bind(&job.alert.method)
        .bind(encode_headers(&job.alert.headers))
        .bind(&job.alert.payload)
        .bind(job.status.as_str())
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;

        // Delivered to the owner when the transaction commits.
        if let Some(owner) = &job.claimed_by {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(owner)
                .bind(job.id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        let owner: Option<(Option<String>,)> =
            sqlx::query_as("DELETE FROM jobs WHERE id = $1 RETURNING claimed_by")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((owner,)) = owner else {
            return Ok(false);
        };
        if let Some(owner) = owner {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(&owner)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn claimed_jobs(
        &self,
        instance: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, StorageError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE claimed_by = $1 \
             ORDER BY created_at LIMIT $2 OFFSET $3"
        ))
        .bind(instance)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| Job::try_from(r).map_err(StorageError::from))
            .collect()
    }

    async fn executions(
        &self,
        job_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobExecution>, StorageError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            "SELECT job_id, endpoint, http_method, headers, response_time_ms, status_code, message, \
             succeeded, created_at FROM job_executions WHERE job_id = $1 \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(job_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| JobExecution::try_from(r).map_err(StorageError::from))
            .collect()
    }

    async fn notify_release(&self, instance: &str) -> Result<(), StorageError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(instance)
            .bind(RELEASE_PAYLOAD)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
