//! Liveness oracle: answers whether the job owning a session still runs.

use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use crate::registry::JobTable;

/// Answer returned by a [`LivenessOracle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The job is running.
    Alive,
    /// The job has exited.
    Dead,
    /// Liveness could not be established; treated as alive by callers.
    Unknown,
}

/// External predicate deciding whether a job is still running.
pub trait LivenessOracle: Send + Sync {
    /// Query the liveness of `job_id`.
    fn liveness<'a>(&'a self, job_id: &'a str)
        -> Pin<Box<dyn Future<Output = Liveness> + Send + 'a>>;
}

/// Oracle backed by the shared job table and an OS process probe.
#[derive(Clone)]
pub struct ProcessLiveness {
    jobs: JobTable,
}

impl ProcessLiveness {
    /// Create an oracle over `jobs`.
    #[must_use]
    pub fn new(jobs: JobTable) -> Self {
        Self { jobs }
    }
}

impl LivenessOracle for ProcessLiveness {
    fn liveness<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Liveness> + Send + 'a>> {
        Box::pin(async move {
            let record = match self.jobs.get(job_id).await {
                Ok(Some(record)) => record,
                Ok(None) => return Liveness::Unknown,
                Err(err) => {
                    debug!(job_id, %err, "job lookup failed");
                    return Liveness::Unknown;
                }
            };
            if record.is_finished() {
                return Liveness::Dead;
            }
            probe_pid(record.pid)
        })
    }
}

/// Probe a process with signal 0.
#[cfg(unix)]
#[must_use]
pub fn probe_pid(pid: u32) -> Liveness {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return Liveness::Unknown;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Dead,
        Err(_) => Liveness::Unknown,
    }
}

/// Probe a process; unsupported on this platform.
#[cfg(not(unix))]
#[must_use]
pub fn probe_pid(_pid: u32) -> Liveness {
    Liveness::Unknown
}
