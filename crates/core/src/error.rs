use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid recurrence: {0}")]
    Recurrence(#[from] RecurrenceError),

    #[error("Invalid headers: {0}")]
    Headers(String),

    #[error("Unknown job status: {0}")]
    UnknownStatus(String),
}

/// Error produced when a recurrence expression cannot be compiled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("'{expression}': {reason}")]
pub struct RecurrenceError {
    pub expression: String,
    pub reason: String,
}
