//! Provides groups, the named caches which make up the read path.
//!
//! A [Group] combines a [Loader] (which knows how to obtain a value from the actual data source),
//! a local [LRU cache](crate::lru::LRUCache) and optionally a [PeerPicker] (which knows which
//! process of the fleet owns a key). A lookup via [Group::get] is resolved as follows:
//!
//! 1. Empty keys are rejected right away.
//! 2. If the local cache contains the key, its value is returned.
//! 3. Otherwise the key is resolved via [singleflight](crate::singleflight), so that concurrent
//!    misses for the same key only resolve it once:
//!    * if a remote peer owns the key, the value is fetched from there. Such values are **not**
//!      put into the local cache, as they are cached by their owner.
//!    * if no peer owns the key (or fetching it from the owner failed), the loader is invoked and
//!      its result is put into the local cache.
//!
//! Groups are kept in a [Groups] registry, so that they can be looked up by name (which is e.g.
//! done when serving requests of other peers).
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

use async_trait::async_trait;

use crate::fmt::format_size;
use crate::lru::LRUCache;
use crate::peers::{PeerGetter, PeerPicker};
use crate::singleflight;
use crate::view::ByteView;
use crate::{Error, Result};

/// Loads values from the underlying data source on a cache miss.
///
/// The loader of a group is invoked at most once per key at any given time, but might be invoked
/// concurrently for distinct keys.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Loads the value for the given key.
    ///
    /// An error (e.g. as the key doesn't exist) is reported to all callers waiting for this key.
    /// It isn't cached, therefore the next lookup will invoke the loader again.
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

/// Turns a plain (blocking) function into a [Loader].
///
/// # Examples
/// ```
/// # use jwcache::group::{Loader, LoaderFn};
/// # #[tokio::main]
/// # async fn main() {
/// let loader = LoaderFn(|key: &str| Ok(key.as_bytes().to_vec()));
/// assert_eq!(loader.load("key").await.unwrap(), b"key".to_vec());
/// # }
/// ```
pub struct LoaderFn<F>(pub F)
where
    F: Fn(&str) -> anyhow::Result<Vec<u8>> + Send + Sync;

#[async_trait]
impl<F> Loader for LoaderFn<F>
where
    F: Fn(&str) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        (self.0)(key)
    }
}

/// Counts what happened in a group.
#[derive(Default)]
struct Counters {
    gets: AtomicU64,
    cache_hits: AtomicU64,
    loads: AtomicU64,
    loads_deduped: AtomicU64,
    peer_loads: AtomicU64,
    peer_errors: AtomicU64,
    local_loads: AtomicU64,
    local_load_errors: AtomicU64,
}

fn increment(counter: &AtomicU64) {
    let _ = counter.fetch_add(1, Ordering::Relaxed);
}

/// Provides a snapshot of the metrics of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// The total number of lookups (including rejected ones).
    pub gets: u64,
    /// The number of lookups served by the local cache.
    pub cache_hits: u64,
    /// The number of lookups which missed the local cache.
    pub loads: u64,
    /// The number of loads which were actually performed (after collapsing concurrent ones).
    pub loads_deduped: u64,
    /// The number of values successfully fetched from a remote peer.
    pub peer_loads: u64,
    /// The number of failed attempts to fetch a value from a remote peer.
    pub peer_errors: u64,
    /// The number of values successfully provided by the loader.
    pub local_loads: u64,
    /// The number of failed loader invocations.
    pub local_load_errors: u64,
    /// The number of entries in the local cache.
    pub entries: usize,
    /// The amount of memory occupied by the local cache.
    pub allocated_memory: usize,
    /// The memory budget of the local cache (0 = unbounded).
    pub max_memory: usize,
    /// The number of entries evicted from the local cache.
    pub evictions: usize,
}

impl Display for Stats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<30} {:>20}", "Gets", self.gets)?;
        writeln!(f, "{:<30} {:>20}", "Cache Hits", self.cache_hits)?;
        writeln!(f, "{:<30} {:>20}", "Loads", self.loads)?;
        writeln!(f, "{:<30} {:>20}", "Loads (deduplicated)", self.loads_deduped)?;
        writeln!(f, "{:<30} {:>20}", "Peer Loads", self.peer_loads)?;
        writeln!(f, "{:<30} {:>20}", "Peer Errors", self.peer_errors)?;
        writeln!(f, "{:<30} {:>20}", "Local Loads", self.local_loads)?;
        writeln!(f, "{:<30} {:>20}", "Local Load Errors", self.local_load_errors)?;
        writeln!(f, "{:<30} {:>20}", "Num Entries", self.entries)?;
        writeln!(
            f,
            "{:<30} {:>20}",
            "Allocated Memory",
            format_size(self.allocated_memory)
        )?;
        writeln!(f, "{:<30} {:>20}", "Max Memory", format_size(self.max_memory))?;
        writeln!(f, "{:<30} {:>20}", "Evictions", self.evictions)
    }
}

/// Represents a named cache which is backed by a loader and optionally by a set of peers.
pub struct Group {
    name: String,
    loader: Arc<dyn Loader>,
    main_cache: Mutex<LRUCache<ByteView>>,
    peers: OnceLock<Arc<dyn PeerPicker>>,
    flights: singleflight::Group<Result<ByteView>>,
    counters: Counters,
}

impl Group {
    /// Creates a new group.
    ///
    /// Most probably [Groups::new_group] should be used, so that the group is also registered
    /// and can be found by peers.
    pub fn new(name: &str, max_memory: usize, loader: Arc<dyn Loader>) -> Self {
        Group {
            name: name.to_owned(),
            loader,
            main_cache: Mutex::new(LRUCache::new(max_memory)),
            peers: OnceLock::new(),
            flights: singleflight::Group::new(),
            counters: Counters::default(),
        }
    }

    /// Returns the name of this group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connects this group to the given set of peers.
    ///
    /// # Panics
    /// Panics if a peer picker has already been registered for this group. The topology of a
    /// group is wired once during startup, so a second call indicates a setup bug.
    pub fn register_peers(&self, peers: Arc<dyn PeerPicker>) {
        if self.peers.set(peers).is_err() {
            panic!(
                "register_peers called more than once for group '{}'",
                self.name
            );
        }
    }

    /// Returns the value for the given key.
    ///
    /// See the [module docs](crate::group) for a detailed description of the read path.
    ///
    /// # Errors
    /// Fails with [Error::EmptyKey] if an empty key was given and with [Error::LoadFailed] if the
    /// loader couldn't provide a value.
    pub async fn get(&self, key: &str) -> Result<ByteView> {
        increment(&self.counters.gets);

        if key.is_empty() {
            return Err(Error::EmptyKey);
        }

        if let Some(value) = self.lookup_cache(key) {
            log::debug!("[{}] Cache hit for '{}'", self.name, key);
            return Ok(value);
        }

        self.load(key).await
    }

    async fn load(&self, key: &str) -> Result<ByteView> {
        increment(&self.counters.loads);

        self.flights
            .work(key, move || async move {
                // A flight which completed right before ours started might have filled the cache.
                // This lookup is already counted as load, therefore it isn't counted as hit...
                let cached = self.cache().get(key).cloned();
                if let Some(value) = cached {
                    return Ok(value);
                }

                increment(&self.counters.loads_deduped);

                if let Some(peer) = self.peers.get().and_then(|peers| peers.pick_peer(key)) {
                    match self.get_from_peer(peer.as_ref(), key).await {
                        Ok(value) => {
                            increment(&self.counters.peer_loads);
                            return Ok(value);
                        }
                        Err(error) => {
                            increment(&self.counters.peer_errors);
                            log::warn!(
                                "[{}] Failed to fetch '{}' from its peer: {:#}",
                                self.name,
                                key,
                                error
                            );
                        }
                    }
                }

                self.get_locally(key).await
            })
            .await
    }

    async fn get_from_peer(&self, peer: &dyn PeerGetter, key: &str) -> anyhow::Result<ByteView> {
        let bytes = peer.get(&self.name, key).await?;
        Ok(ByteView::from(bytes))
    }

    async fn get_locally(&self, key: &str) -> Result<ByteView> {
        match self.loader.load(key).await {
            Ok(data) => {
                increment(&self.counters.local_loads);
                let value = ByteView::from(data);
                self.populate_cache(key, value.clone());

                Ok(value)
            }
            Err(error) => {
                increment(&self.counters.local_load_errors);
                log::debug!("[{}] Failed to load '{}': {:#}", self.name, key, error);

                Err(Error::load_failed(key, error))
            }
        }
    }

    fn lookup_cache(&self, key: &str) -> Option<ByteView> {
        let value = self.cache().get(key).cloned();
        if value.is_some() {
            increment(&self.counters.cache_hits);
        }

        value
    }

    fn populate_cache(&self, key: &str, value: ByteView) {
        self.cache().put(key.to_owned(), value);
    }

    fn cache(&self) -> MutexGuard<'_, LRUCache<ByteView>> {
        self.main_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of the metrics of this group.
    pub fn stats(&self) -> Stats {
        let cache = self.cache();
        Stats {
            gets: self.counters.gets.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            loads_deduped: self.counters.loads_deduped.load(Ordering::Relaxed),
            peer_loads: self.counters.peer_loads.load(Ordering::Relaxed),
            peer_errors: self.counters.peer_errors.load(Ordering::Relaxed),
            local_loads: self.counters.local_loads.load(Ordering::Relaxed),
            local_load_errors: self.counters.local_load_errors.load(Ordering::Relaxed),
            entries: cache.len(),
            allocated_memory: cache.allocated_memory(),
            max_memory: cache.max_memory(),
            evictions: cache.evictions(),
        }
    }
}

/// Keeps all groups of a process so that they can be looked up by name.
///
/// Most probably this is owned by the [Node](crate::node::Node) and created once during startup.
///
/// # Examples
/// ```
/// # use jwcache::group::{Groups, LoaderFn};
/// let groups = Groups::new();
/// let scores = groups.new_group("scores", 1024, LoaderFn(|_key: &str| Ok(Vec::new())));
///
/// assert_eq!(groups.get_group("scores").unwrap().name(), scores.name());
/// assert_eq!(groups.get_group("unknown").is_none(), true);
/// ```
#[derive(Default)]
pub struct Groups {
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl Groups {
    /// Creates a new and empty registry.
    pub fn new() -> Self {
        Groups {
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Creates and registers a new group.
    ///
    /// The local cache of the group will occupy up to **max_memory** bytes (0 = unbounded).
    /// Note that a group which is already registered for the same name is replaced.
    pub fn new_group<L>(&self, name: &str, max_memory: usize, loader: L) -> Arc<Group>
    where
        L: Loader + 'static,
    {
        let group = Arc::new(Group::new(name, max_memory, Arc::new(loader)));

        let previous = self
            .groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), group.clone());

        if previous.is_some() {
            log::info!("Replaced the already registered group {}.", name);
        } else {
            log::info!("Created group {}...", name);
        }

        group
    }

    /// Returns the group with the given name.
    pub fn get_group(&self, name: &str) -> Option<Arc<Group>> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Lists the names of all registered groups in alphabetical order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();

        names
    }

    /// Lists all registered groups ordered by their name.
    pub fn all(&self) -> Vec<Arc<Group>> {
        self.names()
            .iter()
            .filter_map(|name| self.get_group(name))
            .collect()
    }

    /// Drops all registered groups.
    pub fn clear(&self) {
        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
