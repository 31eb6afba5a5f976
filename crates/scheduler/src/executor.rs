//! HTTP job executor.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use watchpost_core::{ExecutionResult, Job};

use crate::callbacks::JobExecutor;
use crate::error::SchedulerError;

#[derive(Debug, thiserror::Error)]
enum CallError {
    #[error("invalid HTTP method: {0}")]
    Method(String),

    #[error("reading client certificate {path}: {source}")]
    CertificateFile {
        path: String,
        source: std::io::Error,
    },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Calls a job's endpoint and reports status and body.
///
/// Never fails: anything that prevents a response becomes an
/// [`ExecutionResult`] with status `0` and `scheduler_error` set.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    /// Shared client for jobs without a client certificate.
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpExecutor {
    pub fn new(timeout: Duration) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }

    /// Jobs with a client certificate get a client of their own, dropped after the call.
    async fn client_for(&self, job: &Job) -> Result<reqwest::Client, CallError> {
        let Some(path) = job.tls_client_cert.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(self.client.clone());
        };
        let pem = tokio::fs::read(path)
            .await
            .map_err(|source| CallError::CertificateFile {
                path: path.to_string(),
                source,
            })?;
        let identity = reqwest::Identity::from_pem(&pem)?;
        Ok(reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .timeout(self.timeout)
            .build()?)
    }

    async fn call(&self, job: &Job) -> Result<(i32, String), CallError> {
        // An empty method means GET.
        let method = match job.http_method.trim() {
            "" => reqwest::Method::GET,
            m => m
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|_| CallError::Method(job.http_method.clone()))?,
        };

        let client = self.client_for(job).await?;
        let mut request = client.request(method, &job.endpoint);
        for header in &job.headers {
            request = request.header(header.name.as_str(), header.value.as_str());
        }

        let response = request.send().await?;
        let status = i32::from(response.status().as_u16());
        let body = response.bytes().await?;
        Ok((status, String::from_utf8_lossy(&body).into_owned()))
    }
}

#[async_trait]
impl JobExecutor for HttpExecutor {
    async fn execute(&self, job: &Job) -> ExecutionResult {
        let start = Instant::now();
        let outcome = self.call(job).await;
        let response_time = start.elapsed();
        match outcome {
            Ok((status_code, message)) => {
                debug!(job_id = %job.id, status_code, elapsed_ms = response_time.as_millis() as u64, "job executed");
                ExecutionResult {
                    status_code,
                    message,
                    response_time,
                    scheduler_error: None,
                }
            }
            Err(e) => {
                debug!(job_id = %job.id, error = %e, "job execution failed");
                ExecutionResult::failed(e.to_string(), response_time)
            }
        }
    }
}
