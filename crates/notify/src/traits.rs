//! Alert strategy trait definition and shared error types.

use std::collections::HashMap;

/// Errors that can occur while delivering an alert.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("no method")]
    NoMethod,

    #[error("no url")]
    NoUrl,

    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response {status}: {body}")]
    UnexpectedResponse { status: u16, body: String },

    #[error("Template rendering failed: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Everything a strategy needs to deliver one alert.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AlertInput {
    /// Name of the strategy that should deliver this alert (e.g. `"http"`).
    pub strategy: String,
    pub url: String,
    pub method: String,
    /// Rendered request body.
    pub payload: Option<String>,
    /// When set, any other response status counts as a failed delivery.
    pub expected_status: Option<u16>,
    /// When set, the response body must contain this text.
    pub expected_message: Option<String>,
    pub headers: HashMap<String, String>,
}

/// A named alert sink.
#[async_trait::async_trait]
pub trait AlertStrategy: Send + Sync {
    /// Deliver the alert, returning a human-readable description of the response.
    async fn send(&self, input: &AlertInput) -> Result<String, AlertError>;

    /// Name operators use to enable this strategy and jobs use to select it.
    fn name(&self) -> &str;
}
