//! Stale-job recovery.
//!
//! A job left `running` by a crashed worker is reset to `pending` once its
//! `started_at` is older than the staleness threshold. There are no
//! heartbeats; the threshold bounds how long an orphan waits.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::JobStore;
use crate::error::Result;
use crate::telemetry::metrics::JobMetrics;

/// Reset stale `running` jobs to `pending`, preserving attempts.
pub async fn recover_stale_jobs(store: &dyn JobStore, threshold: Duration) -> Result<u64> {
    let recovered = store.recover_stale(threshold).await?;
    JobMetrics::record_recovered(recovered);

    if recovered > 0 {
        tracing::warn!(
            recovered,
            threshold = ?threshold,
            store = store.backend_name(),
            "Recovered stale jobs"
        );
    } else {
        tracing::debug!(threshold = ?threshold, "No stale jobs to recover");
    }

    Ok(recovered)
}

/// Run [`recover_stale_jobs`] every `interval` until `shutdown` fires.
pub fn spawn_periodic_recovery(
    store: Arc<dyn JobStore>,
    threshold: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(e) = recover_stale_jobs(store.as_ref(), threshold).await {
                tracing::error!(error = %e, "Periodic stale job recovery failed");
            }
        }
    })
}
