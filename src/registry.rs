//! Keyed registry of cache entries and the service facade over it.
//!
//! The registry is a two-level concurrent map, provider key to file key to
//! entry, mirroring the on-disk layout. Lookups go through the dashmap entry
//! API so concurrent callers for the same url always converge on a single
//! `CacheEntry`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::warn;

use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::error::{LoadError, StoreError, TransportError};
use crate::evict::{self, EvictionPolicy};
use crate::fetch::{ConditionalFetch, HttpTransport, Transport};
use crate::keys::KeyDeriver;
use crate::media::{AtlasBuilder, GridAtlasBuilder, ImageFormat, MediaDecoder, ProbeDecoder};
use crate::store::DiskStore;

/// Collaborators and state shared by the service, its entries, and the
/// evictor.
pub(crate) struct Shared {
    pub(crate) config: CacheConfig,
    pub(crate) base_dir: PathBuf,
    pub(crate) keys: KeyDeriver,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) decoder: Arc<dyn MediaDecoder>,
    pub(crate) atlas: Arc<dyn AtlasBuilder>,
    pub(crate) entries: DashMap<u64, DashMap<u64, Arc<CacheEntry>>>,
    gate: Semaphore,
    total_bytes: AtomicU64,
    pub(crate) reclaim_in_progress: AtomicBool,
}

impl Shared {
    fn new(
        config: CacheConfig,
        base_dir: PathBuf,
        transport: Arc<dyn Transport>,
        decoder: Arc<dyn MediaDecoder>,
        atlas: Arc<dyn AtlasBuilder>,
    ) -> Self {
        let permits = config.concurrent_loads();
        Self {
            config,
            base_dir,
            keys: KeyDeriver::new(),
            transport,
            decoder,
            atlas,
            entries: DashMap::new(),
            gate: Semaphore::new(permits),
            total_bytes: AtomicU64::new(0),
            reclaim_in_progress: AtomicBool::new(false),
        }
    }

    pub(crate) fn store(&self, subdir: &str) -> Result<DiskStore, StoreError> {
        DiskStore::new(&self.base_dir, subdir)
    }

    pub(crate) fn fetcher(&self) -> ConditionalFetch {
        ConditionalFetch::new(Arc::clone(&self.transport))
    }

    /// Admission slot for one network fetch. Bounds concurrent fetches
    /// without bounding concurrent waiters.
    pub(crate) async fn acquire_load_slot(&self) -> Result<SemaphorePermit<'_>, LoadError> {
        self.gate
            .acquire()
            .await
            .map_err(|err| LoadError::unexpected(format!("load gate closed: {err}")))
    }

    pub(crate) fn add_loaded_bytes(&self, weight: u64) {
        self.total_bytes.fetch_add(weight, Ordering::Relaxed);
    }

    pub(crate) fn sub_loaded_bytes(&self, weight: u64) {
        self.total_bytes.fetch_sub(weight, Ordering::Relaxed);
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn max_budget_bytes(&self) -> u64 {
        self.config.max_budget_bytes()
    }
}

/// Creation parameters for a cache entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryParams {
    /// Known format hint; `Unknown` enables probe-and-sniff loading.
    pub format: ImageFormat,
    /// Frame cap for animations; `0` keeps every frame.
    pub max_frames: usize,
}

/// Client-side cache of network-fetched images and animations.
///
/// Cloneable handle; clones share the registry, the byte budget, and the
/// fetch admission gate.
#[derive(Clone)]
pub struct CacheService {
    shared: Arc<Shared>,
}

impl CacheService {
    /// Build a service with the default HTTP transport, header-probe
    /// decoder, and grid atlas layout. `base_dir` is the parent of the
    /// on-disk cache directory.
    pub fn new(config: CacheConfig, base_dir: impl Into<PathBuf>) -> Result<Self, TransportError> {
        let transport = Arc::new(HttpTransport::new()?);
        Ok(Self::with_parts(
            config,
            base_dir,
            transport,
            Arc::new(ProbeDecoder),
            Arc::new(GridAtlasBuilder),
        ))
    }

    /// Build a service with injected collaborators.
    pub fn with_parts(
        config: CacheConfig,
        base_dir: impl Into<PathBuf>,
        transport: Arc<dyn Transport>,
        decoder: Arc<dyn MediaDecoder>,
        atlas: Arc<dyn AtlasBuilder>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(
                config,
                base_dir.into(),
                transport,
                decoder,
                atlas,
            )),
        }
    }

    /// Find or create the entry for `url`. Concurrent callers with the same
    /// url get the same entry. Returns `None` for urls that do not yield a
    /// valid cache key.
    pub fn lookup_or_create(&self, url: &str, params: EntryParams) -> Option<Arc<CacheEntry>> {
        let key = self.shared.keys.derive(url);
        if !key.is_valid() {
            warn!(url, "Url does not derive a valid cache key");
            return None;
        }
        let inner = self.shared.entries.entry(key.provider_key).or_default();
        let entry = inner
            .entry(key.file_key)
            .or_insert_with(|| {
                Arc::new(CacheEntry::new(
                    url.to_string(),
                    key,
                    params.format,
                    params.max_frames,
                    Arc::clone(&self.shared),
                ))
            })
            .clone();
        Some(entry)
    }

    /// Whether `url` is already cached: a registered in-memory entry, or a
    /// payload persisted on disk.
    pub async fn exists(&self, url: &str, cache_subdir: &str) -> bool {
        let key = self.shared.keys.derive(url);
        if !key.is_valid() {
            return false;
        }
        let registered = self
            .shared
            .entries
            .get(&key.provider_key)
            .is_some_and(|inner| inner.contains_key(&key.file_key));
        if registered {
            return true;
        }
        match self.shared.store(cache_subdir) {
            Ok(store) => store.payload_exists(key).await,
            Err(err) => {
                warn!(url, error = %err, "Cache directory is unavailable");
                false
            }
        }
    }

    /// Sum of the weights of every loaded entry, in bytes.
    pub fn total_cache_size(&self) -> u64 {
        self.shared.total_bytes()
    }

    pub fn max_cache_bytes(&self) -> u64 {
        self.shared.max_budget_bytes()
    }

    /// Current fill against the byte budget; `1.0` means at budget.
    pub fn memory_fill_rate(&self) -> f32 {
        let max = self.shared.max_budget_bytes();
        if max == 0 {
            return 0.0;
        }
        self.shared.total_bytes() as f32 / max as f32
    }

    pub fn entry_count(&self) -> usize {
        self.shared.entries.iter().map(|inner| inner.len()).sum()
    }

    /// Prune owners whose tokens were dropped without a release, across
    /// every entry.
    pub fn clear_invalid_owners(&self, dispose_if_unowned: bool) {
        for inner in self.shared.entries.iter() {
            let entries: Vec<Arc<CacheEntry>> =
                inner.iter().map(|e| Arc::clone(e.value())).collect();
            for entry in entries {
                entry.clear_invalid_owners(dispose_if_unowned);
            }
        }
    }

    /// Dispose unowned loaded entries until the policy's byte target is met.
    /// Returns the number of bytes released; `0` when a pass is already
    /// running.
    pub fn reclaim(&self, policy: EvictionPolicy) -> u64 {
        evict::reclaim(&self.shared, policy)
    }

    // ========================================================================
    // Persisted payload deletion
    // ========================================================================

    /// Delete every persisted payload under the cache directory.
    pub async fn delete_all_saved(&self, cache_subdir: &str) -> Result<(), StoreError> {
        self.shared.store(cache_subdir)?.delete_all().await
    }

    /// Delete every persisted payload for the provider of `url`.
    pub async fn delete_saved_for_provider(
        &self,
        url: &str,
        cache_subdir: &str,
    ) -> Result<(), StoreError> {
        let key = self.shared.keys.derive(url);
        if !key.is_valid() {
            warn!(url, "Url does not derive a valid cache key");
            return Ok(());
        }
        self.shared
            .store(cache_subdir)?
            .delete_for_provider(key.provider_key)
            .await
    }

    /// Delete the persisted payload for `url` alone.
    pub async fn delete_saved_for_url(
        &self,
        url: &str,
        cache_subdir: &str,
    ) -> Result<(), StoreError> {
        let key = self.shared.keys.derive(url);
        if !key.is_valid() {
            warn!(url, "Url does not derive a valid cache key");
            return Ok(());
        }
        self.shared.store(cache_subdir)?.delete_for_key(key).await
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("entries", &self.entry_count())
            .field("total_bytes", &self.total_cache_size())
            .finish_non_exhaustive()
    }
}
