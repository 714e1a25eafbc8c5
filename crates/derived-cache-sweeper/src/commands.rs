//! Operations behind each sweeper subcommand

use crate::error::Result;
use crate::types::{RequestResponse, SweepResponse};
use chrono::Utc;
use derived_file_cache::{CacheBackend, SweepReport};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

/// Run one sweep and describe it
pub async fn sweep_once(backend: &dyn CacheBackend, backend_name: &str) -> SweepResponse {
    let swept_at = Utc::now();
    let report = backend.expire_files_at(swept_at).await;
    SweepResponse {
        backend: backend_name.to_string(),
        swept_at,
        report,
    }
}

/// What a `watch` run did before it was stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub sweeps: u64,
    pub totals: SweepReport,
}

/// Sweep every `interval_secs` until `shutdown` resolves
pub async fn watch<F>(backend: &dyn CacheBackend, interval_secs: u64, shutdown: F) -> WatchSummary
where
    F: std::future::Future<Output = ()>,
{
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut summary = WatchSummary::default();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let report = backend.expire_files().await;
                summary.totals.scanned += report.scanned;
                summary.totals.removed += report.removed;
                summary.totals.failed += report.failed;
                summary.sweeps += 1;
            }
        }
    }

    info!(
        sweeps = summary.sweeps,
        removed = summary.totals.removed,
        failed = summary.totals.failed,
        "Sweeper stopped"
    );
    summary
}

/// Request an entry and report where it lives
pub async fn request(
    backend: &dyn CacheBackend,
    file_name: &str,
    ttl_secs: u64,
) -> Result<RequestResponse> {
    let id = backend.request_file(file_name, ttl_secs).await?;
    let path = backend.file_path(&id).await?;
    let valid_to = backend.valid_to(&id).await;

    Ok(RequestResponse {
        id: id.to_string(),
        file_name: id.file_name().to_string(),
        path,
        valid_to,
    })
}
