pub mod config;
pub mod error;
pub mod job;
pub mod recurrence;

pub use config::Config;
pub use error::*;
pub use job::*;
pub use recurrence::Recurrence;
