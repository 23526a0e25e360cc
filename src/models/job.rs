//! Job bookkeeping records consumed by the liveness oracle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record of a job (driver process) owning units of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job identifier.
    pub job_id: String,
    /// Operating-system process id of the driver.
    pub pid: u32,
    /// Registration time.
    pub started_at: DateTime<Utc>,
    /// Set once the driver has exited cleanly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// New running job record for `pid`.
    #[must_use]
    pub fn new(job_id: impl Into<String>, pid: u32) -> Self {
        Self {
            job_id: job_id.into(),
            pid,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Whether the job has been marked finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}
