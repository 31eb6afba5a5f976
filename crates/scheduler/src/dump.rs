//! Recovery dump written when owned jobs could not be released.
//!
//! The file holds `{"jobs": [...]}` with every job the instance owned at
//! shutdown, so an operator can reset them by hand.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use watchpost_core::Job;

use crate::error::SchedulerError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryDump {
    pub jobs: Vec<Job>,
}

impl RecoveryDump {
    pub fn read(path: &Path) -> Result<Self, SchedulerError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Write `jobs` to `path`, replacing any previous dump.
pub fn write_dump(path: &Path, jobs: &[Job]) -> Result<(), SchedulerError> {
    #[derive(Serialize)]
    struct Borrowed<'a> {
        jobs: &'a [Job],
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    serde_json::to_writer(&mut file, &Borrowed { jobs })?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    info!(path = %path.display(), jobs = jobs.len(), "recovery dump written");
    Ok(())
}
