//! Shared job table access for scheduler instances.
//!
//! [`SchedulerStorage`] is the claim/release/notify protocol a scheduler
//! instance runs against; [`JobAdmin`] is the administrative surface that
//! creates and edits jobs. Both are implemented for PostgreSQL and for an
//! in-process backend.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use error::StorageError;
pub use memory::{MemoryBackend, MemoryStorage};
pub use postgres::PgStorage;
pub use traits::{cancelled, JobAdmin, JobPatch, NewJob, SchedulerStorage, RELEASE_PAYLOAD};
