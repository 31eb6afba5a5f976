use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("core error: {0}")]
    Core(#[from] watchpost_core::CoreError),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("listener error: {0}")]
    Listener(String),
}
