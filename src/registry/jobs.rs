//! Job table stored alongside sessions in the shared directory.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::models::job::JobRecord;
use crate::{AppError, Result};

use super::store::KvStore;

/// Directory namespace holding [`JobRecord`]s.
pub const JOB_NAMESPACE: &str = "bdb_jobs";

/// Repository of job records keyed by job id.
#[derive(Clone)]
pub struct JobTable {
    store: Arc<dyn KvStore>,
}

impl JobTable {
    /// Create a table over the shared directory.
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Record a running job owned by process `pid`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` on directory failure.
    pub async fn register(&self, job_id: &str, pid: u32) -> Result<JobRecord> {
        let record = JobRecord::new(job_id, pid);
        self.put(&record).await?;
        info!(job_id, pid, "job registered");
        Ok(record)
    }

    /// Mark a job as cleanly finished.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if no such job is recorded, or
    /// `AppError::StoreUnavailable` on directory failure.
    pub async fn mark_finished(&self, job_id: &str) -> Result<JobRecord> {
        let mut record = self
            .get(job_id)
            .await?
            .ok_or_else(|| AppError::SessionNotFound(format!("job {job_id}")))?;
        record.finished_at = Some(Utc::now());
        self.put(&record).await?;
        info!(job_id, "job finished");
        Ok(record)
    }

    /// Fetch a job record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MalformedDescriptor` if the stored value cannot be
    /// decoded, or `AppError::StoreUnavailable` on directory failure.
    pub async fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let Some(raw) = self.store.get(JOB_NAMESPACE, job_id).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| AppError::MalformedDescriptor(format!("job {job_id}: {err}")))
    }

    async fn put(&self, record: &JobRecord) -> Result<()> {
        let value = serde_json::to_vec(record)
            .map_err(|err| AppError::MalformedDescriptor(format!("encode job failed: {err}")))?;
        self.store.put(JOB_NAMESPACE, &record.job_id, &value).await
    }
}
