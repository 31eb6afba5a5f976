//! Best-effort alerting for failed job executions.
//!
//! This crate provides:
//! - `AlertStrategy` trait for pluggable alert sinks
//! - an HTTP alert strategy
//! - minijinja rendering for alert payloads
//! - `AlertDispatcher`, which routes an alert to the strategy named by the job

pub mod dispatcher;
pub mod http;
pub mod templating;
pub mod traits;

pub use dispatcher::{available_strategies, AlertDispatcher, AlertOutcome, AlertReport};
pub use http::HttpAlert;
pub use templating::{AlertContext, PayloadRenderer};
pub use traits::{AlertError, AlertInput, AlertStrategy};
