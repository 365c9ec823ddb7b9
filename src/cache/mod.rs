//! Two-tier cache with TTL and stale-while-revalidate.
//!
//! Reads consult memory first, then the durable store (promoting what they find).
//! Expired entries are served marked stale and never dropped on read.
//! [`TwoTierCache::get_or_fetch`] refreshes them in the background, at most one
//! refresh per key, while concurrent misses for one key share a single upstream
//! call.
//!
//! Every invalidation bumps a cache-wide epoch. Background fills remember the
//! epoch they started under and are discarded if it moved, so an invalidation is
//! never undone by a fetch that was already in flight.

mod entry;
pub mod keys;
mod store;

pub use entry::CacheEntry;
pub use keys::CacheKey;
pub use store::DurableStore;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::background::TaskPool;
use crate::clock::Clock;
use crate::config::{env_flag, env_or};
use crate::degrade::DegradationRegistry;
use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, retry_default};

/// Cache location and sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Durable tier directory; `None` keeps the cache memory-only.
    pub dir: Option<PathBuf>,
    /// TTL used when a read names none.
    pub default_ttl: Duration,
    /// Concurrent background revalidations and disk writes.
    pub max_background_tasks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: Some(PathBuf::from(".cache/upguard")),
            default_ttl: Duration::from_secs(300),
            max_background_tasks: 8,
        }
    }
}

impl CacheConfig {
    /// The default configuration without a durable tier.
    pub fn memory_only() -> Self {
        Self {
            dir: None,
            ..Self::default()
        }
    }

    /// Reads `UPGUARD_CACHE_DIR`, `UPGUARD_CACHE_MEMORY_ONLY`,
    /// `UPGUARD_CACHE_TTL_SECS` and `UPGUARD_CACHE_BACKGROUND_TASKS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let dir = if env_flag("UPGUARD_CACHE_MEMORY_ONLY", false) {
            None
        } else {
            std::env::var_os("UPGUARD_CACHE_DIR")
                .map(PathBuf::from)
                .or(defaults.dir)
        };
        Self {
            dir,
            default_ttl: Duration::from_secs(env_or(
                "UPGUARD_CACHE_TTL_SECS",
                defaults.default_ttl.as_secs(),
            )),
            max_background_tasks: env_or(
                "UPGUARD_CACHE_BACKGROUND_TASKS",
                defaults.max_background_tasks,
            ),
        }
    }
}

/// A value served from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit<T> {
    pub data: T,
    /// The entry outlived its TTL. A refresh may already be running.
    pub is_stale: bool,
}

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub revalidations: u64,
    pub revalidation_failures: u64,
    /// Reads that joined a fill or refresh already in flight.
    pub coalesced: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    revalidations: AtomicU64,
    revalidation_failures: AtomicU64,
    coalesced: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Memory index in front of an optional [`DurableStore`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use upguard::cache::{CacheConfig, TwoTierCache};
/// use upguard::{ManualClock, RetryPolicy};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), upguard::Error> {
/// let clock = Arc::new(ManualClock::new(0));
/// let cache: TwoTierCache<String> = TwoTierCache::new(
///     &CacheConfig::memory_only(),
///     RetryPolicy::no_retries(),
///     clock.clone(),
/// )?;
///
/// cache.set("jobs:open", "three jobs".to_string(), Duration::from_secs(60));
/// assert_eq!(cache.get_fresh("jobs:open").await.as_deref(), Some("three jobs"));
///
/// clock.advance(Duration::from_secs(61));
/// let hit = cache.get("jobs:open").await.unwrap();
/// assert!(hit.is_stale);
/// assert_eq!(cache.get_fresh("jobs:open").await, None);
/// # Ok(())
/// # }
/// ```
pub struct TwoTierCache<T> {
    memory: DashMap<String, Arc<CacheEntry<T>>>,
    store: Option<Arc<DurableStore>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    default_ttl: Duration,
    pool: TaskPool,
    refreshing: DashMap<String, ()>,
    fill_locks: DashMap<String, Arc<Mutex<()>>>,
    epoch: AtomicU64,
    counters: Counters,
    degradation: Option<Arc<DegradationRegistry>>,
}

impl<T> fmt::Debug for TwoTierCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoTierCache")
            .field("entries", &self.memory.len())
            .field("durable", &self.store.as_ref().map(|s| s.dir().to_path_buf()))
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> TwoTierCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Builds a cache, opening the durable tier when `config.dir` is set.
    pub fn new(config: &CacheConfig, retry: RetryPolicy, clock: Arc<dyn Clock>) -> Result<Self> {
        let pool = TaskPool::new("cache", config.max_background_tasks);
        let store = match &config.dir {
            Some(dir) => Some(Arc::new(DurableStore::open(dir, pool.clone())?)),
            None => None,
        };
        Ok(Self {
            memory: DashMap::new(),
            store,
            clock,
            retry,
            default_ttl: config.default_ttl,
            pool,
            refreshing: DashMap::new(),
            fill_locks: DashMap::new(),
            epoch: AtomicU64::new(0),
            counters: Counters::default(),
            degradation: None,
        })
    }

    /// Reports fetch failures to `registry` under the key's resource name.
    #[must_use]
    pub fn with_degradation(mut self, registry: Arc<DegradationRegistry>) -> Self {
        self.degradation = Some(registry);
        self
    }

    /// TTL applied by callers that do not pick one.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// The durable tier, `None` when the cache is memory-only.
    pub fn durable(&self) -> Option<&Arc<DurableStore>> {
        self.store.as_ref()
    }

    /// Returns the entry for `key`, fresh or stale.
    pub async fn get(&self, key: &str) -> Option<CacheHit<T>> {
        let (entry, is_stale) = self.read(key).await?;
        Some(CacheHit {
            data: entry.data.clone(),
            is_stale,
        })
    }

    /// Returns the entry for `key` only while it is fresh.
    pub async fn get_fresh(&self, key: &str) -> Option<T> {
        match self.read(key).await? {
            (entry, false) => Some(entry.data.clone()),
            (_, true) => None,
        }
    }

    /// Stores `data` under `key`. Memory is updated before this returns; the
    /// durable write happens in the background.
    pub fn set(&self, key: &str, data: T, ttl: Duration) {
        let entry = self.entry(key, data, ttl);
        let _slot = self.memory.entry(key.to_string()).insert(Arc::clone(&entry));
        if let Some(store) = &self.store {
            store.write(&entry);
        }
    }

    /// Removes `key` from both tiers.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the durable file exists but cannot be removed.
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.memory.remove(key);
        if let Some(store) = &self.store {
            store.remove(key).await?;
        }
        debug!(key, "cache key invalidated");
        Ok(())
    }

    /// Removes every key under the `resource` namespace from both tiers.
    pub async fn invalidate_prefix(&self, resource: &str) -> Result<()> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.memory.retain(|key, _| !keys::belongs_to(key, resource));
        if let Some(store) = &self.store {
            store.remove_prefix(resource).await?;
        }
        debug!(resource, "cache namespace invalidated");
        Ok(())
    }

    /// Empties both tiers.
    pub async fn invalidate_all(&self) -> Result<()> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.memory.clear();
        if let Some(store) = &self.store {
            store.clear().await?;
        }
        debug!("cache cleared");
        Ok(())
    }

    /// Serves `key` from the cache, fetching it on a miss.
    ///
    /// A stale hit is returned as-is and triggers one background refresh through
    /// the retry executor. A miss blocks on `fetch` (retried per policy); callers
    /// missing the same key concurrently wait for that one call.
    ///
    /// # Errors
    ///
    /// Only a miss can fail: the fetch error is returned after retries.
    pub async fn get_or_fetch<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<CacheHit<T>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some((entry, is_stale)) = self.read(key).await {
            if is_stale {
                self.spawn_refresh(key, ttl, fetch);
            }
            return Ok(CacheHit {
                data: entry.data.clone(),
                is_stale,
            });
        }
        self.fill(key, ttl, &fetch).await
    }

    /// Counters since creation plus the current memory entry count.
    pub fn stats(&self) -> CacheStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            hits: load(&self.counters.hits),
            stale_hits: load(&self.counters.stale_hits),
            misses: load(&self.counters.misses),
            revalidations: load(&self.counters.revalidations),
            revalidation_failures: load(&self.counters.revalidation_failures),
            coalesced: load(&self.counters.coalesced),
            entries: self.memory.len(),
        }
    }

    fn entry(&self, key: &str, data: T, ttl: Duration) -> Arc<CacheEntry<T>> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Arc::new(CacheEntry::new(key, data, self.clock.now_ms(), ttl_ms))
    }

    // Lookup that feeds the hit/miss counters.
    async fn read(&self, key: &str) -> Option<(Arc<CacheEntry<T>>, bool)> {
        let Some(entry) = self.lookup(key).await else {
            bump(&self.counters.misses);
            return None;
        };
        let is_stale = !entry.is_fresh_at(self.clock.now_ms());
        bump(if is_stale {
            &self.counters.stale_hits
        } else {
            &self.counters.hits
        });
        Some((entry, is_stale))
    }

    async fn lookup(&self, key: &str) -> Option<Arc<CacheEntry<T>>> {
        if let Some(entry) = self.memory.get(key) {
            return Some(Arc::clone(entry.value()));
        }
        let store = self.store.as_ref()?;
        let epoch = self.epoch.load(Ordering::SeqCst);
        match store.load::<T>(key).await {
            Ok(Some(entry)) => {
                let entry = Arc::new(entry);
                self.store_if_current(key, &entry, epoch, false)
                    .then_some(entry)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(key, error = %err, "discarding unreadable cache file");
                if let Err(err) = store.remove(key).await {
                    warn!(key, error = %err, "failed to remove unreadable cache file");
                }
                None
            }
        }
    }

    // Inserts `entry` unless an invalidation ran since `epoch` was read. The
    // check and insert happen under the key's shard lock, which invalidation
    // also takes after bumping the epoch. With `replace == false` an existing
    // memory entry wins and the durable tier is left alone.
    fn store_if_current(
        &self,
        key: &str,
        entry: &Arc<CacheEntry<T>>,
        epoch: u64,
        replace: bool,
    ) -> bool {
        match self.memory.entry(key.to_string()) {
            _ if self.epoch.load(Ordering::SeqCst) != epoch => false,
            Entry::Occupied(_) if !replace => true,
            slot => {
                // Keep the shard locked until the durable write is scheduled.
                let _slot = slot.insert(Arc::clone(entry));
                if let Some(store) = self.store.as_ref().filter(|_| replace) {
                    store.write(entry);
                }
                true
            }
        }
    }

    async fn fill<F, Fut>(&self, key: &str, ttl: Duration, fetch: &F) -> Result<CacheHit<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = Arc::clone(self.fill_locks.entry(key.to_string()).or_default().value());
        let result = {
            let _filling = lock.lock().await;
            match self.lookup(key).await {
                Some(entry) => {
                    bump(&self.counters.coalesced);
                    Ok(CacheHit {
                        data: entry.data.clone(),
                        is_stale: !entry.is_fresh_at(self.clock.now_ms()),
                    })
                }
                None => self.fetch_into(key, ttl, fetch).await,
            }
        };
        // Map entry plus our clone: nobody else is waiting on this key.
        self.fill_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) <= 2);
        result
    }

    async fn fetch_into<F, Fut>(&self, key: &str, ttl: Duration, fetch: &F) -> Result<CacheHit<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let epoch = self.epoch.load(Ordering::SeqCst);
        match retry_default(&self.retry, fetch).await {
            Ok(data) => {
                let entry = self.entry(key, data.clone(), ttl);
                self.store_if_current(key, &entry, epoch, true);
                self.note_recovery(key);
                Ok(CacheHit {
                    data,
                    is_stale: false,
                })
            }
            Err(err) => {
                self.note_failure(key, &err);
                Err(err)
            }
        }
    }

    fn spawn_refresh<F, Fut>(self: &Arc<Self>, key: &str, ttl: Duration, fetch: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        match self.refreshing.entry(key.to_string()) {
            Entry::Occupied(_) => {
                bump(&self.counters.coalesced);
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        bump(&self.counters.revalidations);

        let cache = Arc::clone(self);
        let key = key.to_string();
        let epoch = self.epoch.load(Ordering::SeqCst);
        debug!(key = %key, "scheduling background revalidation");
        self.pool.spawn(async move {
            let _claim = RefreshClaim {
                refreshing: &cache.refreshing,
                key: &key,
            };
            match retry_default(&cache.retry, &fetch).await {
                Ok(data) => {
                    let entry = cache.entry(&key, data, ttl);
                    if !cache.store_if_current(&key, &entry, epoch, true) {
                        debug!(key = %key, "revalidated value dropped after invalidation");
                    }
                    cache.note_recovery(&key);
                }
                Err(err) => {
                    bump(&cache.counters.revalidation_failures);
                    warn!(key = %key, error = %err, "revalidation failed, keeping stale entry");
                    cache.note_failure(&key, &err);
                }
            }
        });
    }

    fn note_failure(&self, key: &str, err: &Error) {
        let Some(registry) = &self.degradation else {
            return;
        };
        if err.is_retryable() || matches!(err, Error::CircuitOpen) {
            registry.mark_degraded(keys::resource_of(key), err);
        }
    }

    fn note_recovery(&self, key: &str) {
        if let Some(registry) = &self.degradation {
            registry.mark_recovered(keys::resource_of(key));
        }
    }
}

// Releases a key's refresh slot when the refresh task ends.
struct RefreshClaim<'a> {
    refreshing: &'a DashMap<String, ()>,
    key: &'a str,
}

impl Drop for RefreshClaim<'_> {
    fn drop(&mut self) {
        self.refreshing.remove(self.key);
    }
}
