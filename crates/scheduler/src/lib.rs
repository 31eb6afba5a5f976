//! Scheduling engine for one watchpost instance.
//!
//! [`Scheduler`] claims jobs through a [`watchpost_storage::SchedulerStorage`],
//! keeps them in a bounded [`Registry`], and runs one timer task per job.
//! On shutdown it releases every job it owns, falling back to a recovery
//! dump when storage is unreachable.

pub mod callbacks;
pub mod dump;
pub mod error;
pub mod executor;
pub mod registry;
pub mod scheduler;
pub mod timer;

pub use callbacks::{AlertThenWriteBack, Callbacks, JobExecutor, OutcomeHandler, WriteBack};
pub use dump::{write_dump, RecoveryDump};
pub use error::SchedulerError;
pub use executor::HttpExecutor;
pub use registry::{LiveJob, Registry};
pub use scheduler::{Scheduler, SchedulerMonitor, SchedulerState, SchedulerStats};
pub use timer::{Completion, CycleOutcome};
