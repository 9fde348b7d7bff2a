use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use ef_types::{ConfigurationKey, EvaluationError, ModelArtifact};

type Slot = Arc<OnceCell<Arc<ModelArtifact>>>;

/// Process-wide model cache keyed by configuration.
///
/// Each key owns a `OnceCell`, so concurrent first users wait on a single
/// construction. A failed construction removes its slot and the next caller
/// tries again.
#[derive(Debug, Default)]
pub struct ModelCache {
    slots: DashMap<ConfigurationKey, Slot>,
    stats: RwLock<CacheStats>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the artifact for `key`, constructing it with `build` if absent.
    ///
    /// The flag is `true` when this caller did not run the construction.
    pub async fn get_or_build<F, Fut>(
        &self,
        key: &ConfigurationKey,
        build: F,
    ) -> Result<(Arc<ModelArtifact>, bool), EvaluationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ModelArtifact, EvaluationError>>,
    {
        // Clone the slot out so no shard lock is held across the await.
        let slot: Slot = self.slots.entry(key.clone()).or_default().clone();

        if let Some(artifact) = slot.get() {
            self.stats.write().hits += 1;
            debug!(key = %key, "model cache hit");
            return Ok((artifact.clone(), true));
        }

        let constructed = AtomicBool::new(false);
        let result = slot
            .get_or_try_init(|| {
                constructed.store(true, Ordering::SeqCst);
                let fut = build();
                async move { fut.await.map(Arc::new) }
            })
            .await;

        let constructed = constructed.load(Ordering::SeqCst);
        if result.is_err() {
            // Drop the empty slot unless another caller has filled it since.
            self.slots
                .remove_if(key, |_, current| Arc::ptr_eq(current, &slot) && !current.initialized());
        }
        let mut stats = self.stats.write();
        match result {
            Ok(artifact) if constructed => {
                stats.misses += 1;
                stats.builds += 1;
                info!(key = %key, qubits = artifact.qubit_count, "model constructed");
                Ok((artifact.clone(), false))
            }
            Ok(artifact) => {
                stats.hits += 1;
                Ok((artifact.clone(), true))
            }
            Err(e) => {
                stats.misses += 1;
                stats.failures += 1;
                Err(e)
            }
        }
    }

    pub fn get(&self, key: &ConfigurationKey) -> Option<Arc<ModelArtifact>> {
        self.slots.get(key).and_then(|slot| slot.get().cloned())
    }

    pub fn contains(&self, key: &ConfigurationKey) -> bool {
        self.get(key).is_some()
    }

    /// Drop one key. Consumers already holding the artifact keep their copy.
    pub fn invalidate(&self, key: &ConfigurationKey) -> bool {
        let removed = self
            .slots
            .remove(key)
            .map_or(false, |(_, slot)| slot.initialized());
        if removed {
            self.stats.write().invalidations += 1;
            info!(key = %key, "model invalidated");
        }
        removed
    }

    /// Drop every key belonging to a configuration, at any bond length.
    pub fn invalidate_configuration(&self, configuration_id: &str) -> usize {
        let mut removed = 0;
        self.slots.retain(|key, slot| {
            if key.configuration_id != configuration_id {
                return true;
            }
            if slot.initialized() {
                removed += 1;
            }
            false
        });
        if removed > 0 {
            self.stats.write().invalidations += removed as u64;
            info!(configuration = configuration_id, removed, "configuration invalidated");
        }
        removed
    }

    pub fn clear(&self) {
        self.slots.clear();
        *self.stats.write() = CacheStats::default();
    }

    /// Number of constructed entries.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub failures: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}
