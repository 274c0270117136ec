use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::engine::Engine;
use crate::limits::*;
use crate::maintenance;
use crate::notify::NotifyHub;

/// Manages per-site engines. Each housing site gets its own Engine + WAL +
/// background tasks. Site = database name from the pgwire connection.
pub struct SiteManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    /// Serializes lazy creation so two connections racing on a new site
    /// can't build two engines over the same WAL file.
    creation: Mutex<()>,
}

impl SiteManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            creation: Mutex::new(()),
        }
    }

    /// Get or lazily create an engine for the given site. Creation replays
    /// the site's WAL and resolves any approval interrupted by a crash
    /// before the engine is handed out.
    pub async fn get_or_create(&self, site: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(site) {
            return Ok(engine.value().clone());
        }
        if site.len() > MAX_SITE_NAME_LEN {
            return Err(bad_name("site name too long"));
        }
        let stem = wal_stem(site).ok_or_else(|| bad_name("empty site name"))?;

        let _guard = self.creation.lock().await;
        if let Some(engine) = self.engines.get(site) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_SITES {
            return Err(io::Error::other("too many sites"));
        }

        let wal_path = self.data_dir.join(format!("{stem}.wal"));
        let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
        engine
            .recover()
            .await
            .map_err(|e| io::Error::other(format!("recovery failed: {e}")))?;
        self.spawn_site_tasks(&engine, stem);

        self.engines.insert(site.to_string(), engine.clone());
        metrics::gauge!(crate::observability::SITES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    /// Per-site background work: WAL compaction and the event-firehose
    /// logger that stands in for external notification delivery.
    fn spawn_site_tasks(&self, engine: &Arc<Engine>, site: String) {
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            maintenance::run_compactor(compactor_engine, threshold).await;
        });
        let firehose = engine.notify.subscribe_all();
        tokio::spawn(async move {
            maintenance::run_event_logger(site, firehose).await;
        });
    }
}

/// A site names its WAL file; anything path-like is stripped first so a
/// crafted database name cannot escape the data directory.
fn wal_stem(site: &str) -> Option<String> {
    let stem: String = site
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-'))
        .collect();
    (!stem.is_empty()).then_some(stem)
}

fn bad_name(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}
