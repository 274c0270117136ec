use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use crate::engine::Engine;
use crate::model::Event;

/// Background task that rewrites a site's WAL once enough appends have
/// accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}

/// Background task that drains a site's event firehose into structured log
/// lines. This is the in-process stand-in for external notification
/// delivery: anything that wants to page a tenant or an admin subscribes to
/// the same hub.
pub async fn run_event_logger(site: String, mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let payload =
                    serde_json::to_string(&event).unwrap_or_else(|e| format!("\"<encode error: {e}>\""));
                info!(site = %site, payload = %payload, "event committed");
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(site = %site, missed, "event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
