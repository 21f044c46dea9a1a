//! Wires a store, an advertisement cache, an SRDI index and their garbage collection.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    cache::AdvertisementCache,
    clock::Clock,
    config::Config,
    gc::{GcHandle, schedule_periodic},
    registry::DocumentRegistry,
    srdi::SrdiIndex,
    store::{Store, fs::FsStore},
};

/// A running cache and SRDI index sharing one store.
///
/// Both expiry indices are swept every [`Config::gc_interval`] until the engine is shut
/// down or dropped.
#[derive(Debug)]
pub struct Engine<S = FsStore> {
    cache: Arc<AdvertisementCache<S>>,
    srdi: Arc<SrdiIndex<S>>,
    gc: GcHandle,
}

impl Engine<FsStore> {
    /// Open the store named by `config` and start the engine for `area`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: &Config,
        area: impl Into<String>,
        registry: Arc<dyn DocumentRegistry>,
        clock: Arc<dyn Clock>,
    ) -> crate::Result<Self> {
        let store = Arc::new(config.open_store()?);
        Ok(Self::with_store(config, store, area, registry, clock))
    }
}

impl<S: Store> Engine<S> {
    /// Start the engine on an already opened store.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_store(
        config: &Config,
        store: Arc<S>,
        area: impl Into<String>,
        registry: Arc<dyn DocumentRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let area = area.into();
        let cache = Arc::new(AdvertisementCache::new(
            area.clone(),
            store.clone(),
            registry,
            clock.clone(),
        ));
        cache.deltas().set_tracking(config.track_deltas);
        let srdi = Arc::new(
            SrdiIndex::new(store, clock).with_default_threshold(config.query_threshold),
        );
        let gc = schedule_periodic(config.gc_interval, {
            let cache = cache.clone();
            let srdi = srdi.clone();
            move || {
                if let Err(err) = cache.garbage_collect() {
                    warn!("advertisement gc failed: {err:#}");
                }
                if let Err(err) = srdi.garbage_collect() {
                    warn!("srdi gc failed: {err:#}");
                }
            }
        });
        info!(%area, gc_interval = ?config.gc_interval, "engine started");
        Self { cache, srdi, gc }
    }

    /// The advertisement cache.
    pub fn cache(&self) -> &Arc<AdvertisementCache<S>> {
        &self.cache
    }

    /// The SRDI index.
    pub fn srdi(&self) -> &Arc<SrdiIndex<S>> {
        &self.srdi
    }

    /// Stop garbage collection, waiting for a running sweep to finish.
    pub async fn shutdown(self) {
        self.gc.shutdown().await;
        info!(area = %self.cache.area(), "engine stopped");
    }
}
