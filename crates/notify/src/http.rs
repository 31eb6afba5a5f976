//! HTTP alert strategy.
//!
//! Sends the rendered payload to the job's alert URL with the job's alert
//! method and headers. `${VAR_NAME}` references in the URL and header
//! values are resolved from the environment at send time, so secrets
//! never have to live in the jobs table.

use std::time::Duration;

use crate::traits::{AlertError, AlertInput, AlertStrategy};

/// Delivers alerts as plain HTTP requests.
#[derive(Debug, Clone)]
pub struct HttpAlert {
    /// Shared HTTP client (connection pooling).
    client: reqwest::Client,
}

impl HttpAlert {
    /// Strategy name used in `ALERT_CHANNELS` and in a job's alert policy.
    pub const NAME: &'static str = "http";

    /// Create a strategy whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl AlertStrategy for HttpAlert {
    async fn send(&self, input: &AlertInput) -> Result<String, AlertError> {
        if input.method.trim().is_empty() {
            return Err(AlertError::NoMethod);
        }
        if input.url.trim().is_empty() {
            return Err(AlertError::NoUrl);
        }

        let method = input
            .method
            .trim()
            .to_uppercase()
            .parse::<reqwest::Method>()
            .map_err(|_| AlertError::InvalidMethod(input.method.clone()))?;
        let url = resolve_env_vars(&input.url)?;

        let mut request = self.client.request(method.clone(), &url);
        for (key, value) in &input.headers {
            request = request.header(key.as_str(), resolve_env_vars(value)?);
        }
        if let Some(payload) = &input.payload {
            request = request.body(payload.clone());
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        let body = String::from_utf8_lossy(&bytes).into_owned();

        let status_ok = match input.expected_status {
            Some(expected) => status.as_u16() == expected,
            None => status.is_success(),
        };
        let message_ok = input
            .expected_message
            .as_deref()
            .map_or(true, |expected| body.contains(expected));

        if !status_ok || !message_ok {
            tracing::warn!(
                url = %url,
                %status,
                body = %body,
                "alert endpoint returned an unexpected response"
            );
            return Err(AlertError::UnexpectedResponse {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(url = %url, method = %method, %status, "http alert delivered");
        Ok(format!("status code: {}\nmessage: {}", status.as_u16(), body))
    }

    fn name(&self) -> &str {
        Self::NAME
    }
}

/// Resolve `${VAR_NAME}` patterns in a string using `std::env::var`.
///
/// Returns an error if a referenced variable is not set.
fn resolve_env_vars(input: &str) -> Result<String, AlertError> {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| AlertError::Config(format!("unclosed env var reference in: {input}")))?;
        let name = &after[..end];
        let value = std::env::var(name)
            .map_err(|_| AlertError::Config(format!("env var not found: {name}")))?;
        result.push_str(&value);
        rest = &after[end + 1..];
    }
    result.push_str(rest);

    Ok(result)
}
