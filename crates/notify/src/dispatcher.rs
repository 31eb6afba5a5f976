//! Routes alerts to the strategy a job asks for.
//!
//! The dispatcher is built once at startup from the strategies this build
//! knows about, intersected with the channels the operator enabled.
//! Delivery is best-effort: every outcome is reported, none is an error.

use std::collections::HashMap;
use std::time::Duration;

use crate::http::HttpAlert;
use crate::traits::{AlertInput, AlertStrategy};

/// How an alert attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    Delivered,
    /// The requested strategy is unknown or not enabled.
    NotRegistered,
    /// The strategy ran but delivery failed.
    TransportError,
}

/// Result of one `send_alert` call.
#[derive(Debug, Clone)]
pub struct AlertReport {
    pub strategy: String,
    pub outcome: AlertOutcome,
    /// Human-readable response or failure description.
    pub message: String,
    pub duration_ms: u64,
}

/// Every strategy this build ships with.
pub fn available_strategies(timeout: Duration) -> Vec<Box<dyn AlertStrategy>> {
    let mut strategies: Vec<Box<dyn AlertStrategy>> = Vec::new();
    match HttpAlert::new(timeout) {
        Ok(http) => strategies.push(Box::new(http)),
        Err(e) => tracing::warn!(error = %e, "http alert strategy unavailable"),
    }
    strategies
}

/// Maps strategy names to their senders.
pub struct AlertDispatcher {
    strategies: HashMap<String, Box<dyn AlertStrategy>>,
}

impl AlertDispatcher {
    /// Keep only the `available` strategies whose name appears in `enabled`.
    pub fn new(available: Vec<Box<dyn AlertStrategy>>, enabled: &[String]) -> Self {
        let mut strategies = HashMap::new();
        for strategy in available {
            let name = strategy.name().to_lowercase();
            if enabled.iter().any(|c| c.eq_ignore_ascii_case(&name)) {
                strategies.insert(name, strategy);
            }
        }
        for channel in enabled {
            if !strategies.contains_key(&channel.to_lowercase()) {
                tracing::warn!(channel = %channel, "enabled alert channel has no implementation");
            }
        }
        Self { strategies }
    }

    /// A dispatcher that reports every alert as not registered.
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Names of the registered strategies, sorted.
    pub fn registered(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Deliver `input` through the strategy it names.
    pub async fn send_alert(&self, input: &AlertInput) -> AlertReport {
        let name = input.strategy.to_lowercase();
        let Some(strategy) = self.strategies.get(&name) else {
            tracing::warn!(strategy = %input.strategy, "alert strategy not registered");
            return AlertReport {
                strategy: input.strategy.clone(),
                outcome: AlertOutcome::NotRegistered,
                message: format!("alert strategy '{}' is not registered", input.strategy),
                duration_ms: 0,
            };
        };

        let start = std::time::Instant::now();
        let result = strategy.send(input).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (outcome, message) = match result {
            Ok(message) => {
                tracing::info!(strategy = %name, url = %input.url, duration_ms, "Alert delivered");
                (AlertOutcome::Delivered, message)
            }
            Err(e) => {
                tracing::warn!(
                    strategy = %name,
                    url = %input.url,
                    error = %e,
                    duration_ms,
                    "Alert delivery failed"
                );
                (AlertOutcome::TransportError, e.to_string())
            }
        };

        AlertReport {
            strategy: name,
            outcome,
            message,
            duration_ms,
        }
    }
}
