//! Session reaper: removes registry entries whose owning job has died.
//!
//! Runs once at debugger-client startup and optionally as a background
//! task. Only entries whose owner is positively `Dead` are deleted; an
//! `Unknown` answer keeps the entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::liveness::{Liveness, LivenessOracle};
use crate::registry::SessionRegistry;
use crate::Result;

/// Outcome of one reaper scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Decodable entries examined.
    pub scanned: usize,
    /// Keys deleted because their owner is dead.
    pub removed: Vec<String>,
    /// Entries kept because their owner is alive.
    pub kept: usize,
    /// Entries kept because liveness could not be determined.
    pub unknown: usize,
    /// Keys skipped because their value could not be decoded.
    pub malformed: Vec<String>,
}

/// Run one deterministic scan of the registry.
///
/// Each job is queried at most once per scan. A failed delete keeps the
/// entry for the next scan.
///
/// # Errors
///
/// Returns `AppError::StoreUnavailable` if the registry cannot be listed.
pub async fn reap(registry: &SessionRegistry, oracle: &dyn LivenessOracle) -> Result<ReapReport> {
    let span = info_span!("reap");
    async move {
        let listing = registry.list_sessions().await?;
        let mut report = ReapReport {
            scanned: listing.sessions.len(),
            malformed: listing.malformed,
            ..ReapReport::default()
        };

        let mut answers: HashMap<String, Liveness> = HashMap::new();
        for descriptor in listing.sessions {
            let liveness = match answers.get(&descriptor.job_id) {
                Some(known) => *known,
                None => {
                    let answer = oracle.liveness(&descriptor.job_id).await;
                    answers.insert(descriptor.job_id.clone(), answer);
                    answer
                }
            };

            match liveness {
                Liveness::Alive => report.kept += 1,
                Liveness::Unknown => {
                    debug!(
                        session_key = %descriptor.session_key,
                        job_id = %descriptor.job_id,
                        "owner liveness unknown, keeping entry"
                    );
                    report.unknown += 1;
                }
                Liveness::Dead => match registry.remove(descriptor.session_key.as_str()).await {
                    Ok(_) => {
                        info!(
                            session_key = %descriptor.session_key,
                            job_id = %descriptor.job_id,
                            "reaped session of dead job"
                        );
                        report.removed.push(descriptor.session_key.to_string());
                    }
                    Err(err) => {
                        warn!(
                            session_key = %descriptor.session_key,
                            %err,
                            "failed to reap session, will retry next scan"
                        );
                    }
                },
            }
        }

        info!(
            scanned = report.scanned,
            removed = report.removed.len(),
            kept = report.kept,
            unknown = report.unknown,
            malformed = report.malformed.len(),
            "reaper scan completed"
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

/// Spawn the periodic reaper background task.
#[must_use]
pub fn spawn_reaper_task(
    registry: SessionRegistry,
    oracle: Arc<dyn LivenessOracle>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("reaper task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = reap(&registry, oracle.as_ref()).await {
                        error!(?err, "reaper scan failed");
                    }
                }
            }
        }
    })
}
