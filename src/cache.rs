//! Shared, invalidatable block cache
//!
//! One [`BlockCache`] is shared by every dataset opened through a
//! [`crate::access::VolumeAccess`]. Entries are keyed by dataset identity
//! (container URL plus dataset path) and linear cell index. Concurrent
//! requests for the same missing cell share a single load; invalidation
//! forgets the load in flight so that its result is never inserted.
//! Residency is bounded in bytes by a [`moka`] cache with LRU eviction.

use crate::chunk::Chunk;
use crate::error::{Result, VolumeError};
use crate::io::ChunkStore;
use crate::layout::CellGrid;
use crate::metadata::DatasetAttributes;
use crate::utils::format_bytes;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, trace};
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Identity of a dataset within the process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetId {
    container: Arc<str>,
    path: Arc<str>,
}

impl DatasetId {
    pub fn new(container: &str, path: &str) -> Self {
        Self {
            container: Arc::from(container),
            path: Arc::from(crate::utils::normalize_path(path)),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container, self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    dataset: DatasetId,
    cell: u64,
}

/// Produces the content of one cell on a cache miss
#[async_trait]
pub trait CellLoader: Send + Sync {
    async fn load(&self, cell: u64) -> Result<Chunk>;
}

/// Loads cells of an N5 dataset through a [`ChunkStore`]
pub struct N5CellLoader {
    store: Arc<dyn ChunkStore>,
    path: String,
    attributes: DatasetAttributes,
    grid: CellGrid,
}

impl N5CellLoader {
    pub fn new(store: Arc<dyn ChunkStore>, path: impl Into<String>, attributes: DatasetAttributes) -> Self {
        let grid = attributes.cell_grid();
        Self {
            store,
            path: path.into(),
            attributes,
            grid,
        }
    }
}

#[async_trait]
impl CellLoader for N5CellLoader {
    async fn load(&self, cell: u64) -> Result<Chunk> {
        if cell >= self.grid.num_cells() {
            return Err(VolumeError::OutOfBounds(format!(
                "cell {cell} outside grid of {} cells",
                self.grid.num_cells()
            )));
        }
        let position = self.grid.cell_position(cell);
        self.store.read_chunk(&self.path, &self.attributes, &position).await
    }
}

/// Observer of invalidation and eviction events for one dataset.
///
/// `cell == None` means every cell of the dataset was invalidated.
pub trait InvalidationListener: Send + Sync {
    fn invalidated(&self, cell: Option<u64>);

    /// The cache dropped `cell` to stay within its byte bound
    fn evicted(&self, _cell: u64) {}
}

type SharedLoad = Shared<BoxFuture<'static, std::result::Result<Arc<Chunk>, Arc<VolumeError>>>>;

/// A load that has not finished yet. `id` is unique per started load.
struct InFlight {
    load: SharedLoad,
    id: u64,
}

/// Cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub evictions: u64,
    /// Loads that finished after an invalidation and were dropped
    pub discarded_loads: u64,
    pub entries: usize,
    pub resident_bytes: usize,
}

impl CacheStats {
    pub fn summary(&self) -> String {
        format!(
            "{} entries, {} resident, {} hits, {} misses, {} evictions",
            self.entries,
            format_bytes(self.resident_bytes),
            self.hits,
            self.misses,
            self.evictions
        )
    }
}

#[derive(Default)]
struct CacheState {
    loading: HashMap<CacheKey, InFlight>,
    next_load: u64,
    stats: CacheStats,
}

struct CacheInner {
    /// Guards `loading` and every insert into or removal from `resident`
    state: Mutex<CacheState>,
    resident: moka::sync::Cache<CacheKey, Arc<Chunk>>,
    listeners: Mutex<HashMap<DatasetId, Vec<Weak<dyn InvalidationListener>>>>,
    max_bytes: usize,
    next_token: AtomicU64,
    evictions: AtomicU64,
}

impl CacheInner {
    /// Insert a finished load unless the key was invalidated meanwhile.
    fn complete(
        &self,
        key: &CacheKey,
        id: u64,
        result: &std::result::Result<Arc<Chunk>, Arc<VolumeError>>,
    ) {
        let mut state = self.state.lock();
        let current = matches!(state.loading.get(key), Some(flight) if flight.id == id);
        if !current {
            debug!("discarding stale load of cell {} of {}", key.cell, key.dataset);
            state.stats.discarded_loads += 1;
            return;
        }
        state.loading.remove(key);
        if let Ok(chunk) = result {
            self.resident.insert(key.clone(), Arc::clone(chunk));
        }
    }

    fn evicted(&self, key: &CacheKey) {
        trace!("evicted cell {} of {}", key.cell, key.dataset);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        for listener in self.listeners_of(&key.dataset) {
            listener.evicted(key.cell);
        }
    }

    fn listeners_of(&self, dataset: &DatasetId) -> Vec<Arc<dyn InvalidationListener>> {
        let mut registry = self.listeners.lock();
        match registry.get_mut(dataset) {
            Some(entries) => {
                entries.retain(|weak| weak.strong_count() > 0);
                entries.iter().filter_map(Weak::upgrade).collect()
            }
            None => Vec::new(),
        }
    }

    fn notify(&self, dataset: &DatasetId, cell: Option<u64>) {
        for listener in self.listeners_of(dataset) {
            listener.invalidated(cell);
        }
    }
}

/// Process-wide cache of decoded cells
#[derive(Clone)]
pub struct BlockCache {
    inner: Arc<CacheInner>,
}

impl BlockCache {
    /// Create a cache bounded to `max_bytes` of decoded data.
    ///
    /// Least recently used cells are evicted first. Readers keep their
    /// `Arc<Chunk>` alive after eviction; loads in flight are never evicted.
    pub fn new(max_bytes: usize) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<CacheInner>| {
            let this = this.clone();
            let resident = moka::sync::Cache::builder()
                .max_capacity(max_bytes as u64)
                .weigher(|_key: &CacheKey, chunk: &Arc<Chunk>| -> u32 {
                    u32::try_from(chunk.size_in_bytes()).unwrap_or(u32::MAX)
                })
                .eviction_policy(EvictionPolicy::lru())
                .eviction_listener(move |key: Arc<CacheKey>, _chunk: Arc<Chunk>, cause: RemovalCause| {
                    if cause.was_evicted() {
                        if let Some(inner) = this.upgrade() {
                            inner.evicted(&key);
                        }
                    }
                })
                .build();
            CacheInner {
                state: Mutex::new(CacheState::default()),
                resident,
                listeners: Mutex::new(HashMap::new()),
                max_bytes,
                next_token: AtomicU64::new(1),
                evictions: AtomicU64::new(0),
            }
        });
        Self { inner }
    }

    pub fn max_bytes(&self) -> usize {
        self.inner.max_bytes
    }

    /// Get a cell, loading it through `loader` on a miss.
    ///
    /// Concurrent callers for the same missing cell await one shared load.
    /// A failed load is reported to every waiter and is not cached.
    pub async fn get(
        &self,
        dataset: &DatasetId,
        cell: u64,
        loader: &Arc<dyn CellLoader>,
    ) -> Result<Arc<Chunk>> {
        let key = CacheKey {
            dataset: dataset.clone(),
            cell,
        };

        let load = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if let Some(chunk) = self.inner.resident.get(&key) {
                state.stats.hits += 1;
                return Ok(chunk);
            }
            match state.loading.get(&key) {
                Some(flight) => {
                    state.stats.hits += 1;
                    flight.load.clone()
                }
                None => {
                    state.stats.misses += 1;
                    state.stats.loads += 1;
                    state.next_load += 1;
                    let id = state.next_load;
                    let load = self.spawn_load(key.clone(), id, Arc::clone(loader));
                    state.loading.insert(
                        key,
                        InFlight {
                            load: load.clone(),
                            id,
                        },
                    );
                    load
                }
            }
        };

        load.await.map_err(|source| VolumeError::Load {
            dataset: dataset.to_string(),
            cell,
            source,
        })
    }

    fn spawn_load(&self, key: CacheKey, id: u64, loader: Arc<dyn CellLoader>) -> SharedLoad {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = loader.load(key.cell).await.map(Arc::new).map_err(Arc::new);
            inner.complete(&key, id, &result);
            result
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(Arc::new(VolumeError::Task(e.to_string()))),
            }
        }
        .boxed()
        .shared()
    }

    /// Cached cell without loading it
    pub fn peek(&self, dataset: &DatasetId, cell: u64) -> Option<Arc<Chunk>> {
        self.inner.resident.get(&CacheKey {
            dataset: dataset.clone(),
            cell,
        })
    }

    /// Drop one cell; loads already in flight for it will not be inserted.
    pub fn invalidate(&self, dataset: &DatasetId, cell: u64) {
        let key = CacheKey {
            dataset: dataset.clone(),
            cell,
        };
        {
            let mut state = self.inner.state.lock();
            state.loading.remove(&key);
            self.inner.resident.invalidate(&key);
        }
        debug!("invalidated cell {} of {}", cell, dataset);
        self.inner.notify(dataset, Some(cell));
    }

    /// Drop every cell of a dataset.
    pub fn invalidate_all(&self, dataset: &DatasetId) {
        {
            let mut state = self.inner.state.lock();
            state.loading.retain(|key, _| &key.dataset != dataset);
            let keys: Vec<Arc<CacheKey>> = self
                .inner
                .resident
                .iter()
                .map(|(key, _)| key)
                .filter(|key| &key.dataset == dataset)
                .collect();
            for key in keys {
                self.inner.resident.invalidate(&*key);
            }
        }
        debug!("invalidated all cells of {}", dataset);
        self.inner.notify(dataset, None);
    }

    /// Register an observer of invalidations and evictions of `dataset`.
    ///
    /// Only a weak reference is kept; dropped listeners are pruned lazily.
    pub fn subscribe(&self, dataset: &DatasetId, listener: Weak<dyn InvalidationListener>) {
        self.inner
            .listeners
            .lock()
            .entry(dataset.clone())
            .or_default()
            .push(listener);
    }

    /// Invalidation handle for one dataset
    pub fn token(&self, dataset: &DatasetId) -> InvalidationToken {
        InvalidationToken {
            id: self.inner.next_token.fetch_add(1, Ordering::Relaxed),
            dataset: dataset.clone(),
            cache: self.clone(),
        }
    }

    /// Cached view of one dataset backed by an N5 store
    pub fn array(
        &self,
        store: Arc<dyn ChunkStore>,
        path: &str,
        attributes: DatasetAttributes,
    ) -> CachedArray {
        let id = DatasetId::new(store.url(), path);
        let grid = attributes.cell_grid();
        let loader: Arc<dyn CellLoader> = Arc::new(N5CellLoader::new(store, path, attributes.clone()));
        CachedArray {
            id,
            grid,
            attributes,
            loader,
            cache: self.clone(),
        }
    }

    /// Counters and residency after pending evictions have run
    pub fn stats(&self) -> CacheStats {
        self.inner.resident.run_pending_tasks();
        let mut stats = self.inner.state.lock().stats.clone();
        stats.evictions = self.inner.evictions.load(Ordering::Relaxed);
        stats.entries = self.inner.resident.entry_count() as usize;
        stats.resident_bytes = self.inner.resident.weighted_size() as usize;
        stats
    }
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCache")
            .field("max_bytes", &self.inner.max_bytes)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Handle that invalidates cached cells of one dataset
#[derive(Clone)]
pub struct InvalidationToken {
    id: u64,
    dataset: DatasetId,
    cache: BlockCache,
}

impl InvalidationToken {
    /// Distinguishes tokens handed out by the same cache
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dataset(&self) -> &DatasetId {
        &self.dataset
    }

    pub fn invalidate(&self, cell: u64) {
        self.cache.invalidate(&self.dataset, cell);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all(&self.dataset);
    }
}

impl fmt::Debug for InvalidationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationToken")
            .field("id", &self.id)
            .field("dataset", &self.dataset)
            .finish()
    }
}

/// Lazily loaded, cached view of one chunked dataset
#[derive(Clone)]
pub struct CachedArray {
    id: DatasetId,
    grid: CellGrid,
    attributes: DatasetAttributes,
    loader: Arc<dyn CellLoader>,
    cache: BlockCache,
}

impl CachedArray {
    /// View over a custom loader
    pub fn with_loader(
        cache: &BlockCache,
        id: DatasetId,
        attributes: DatasetAttributes,
        loader: Arc<dyn CellLoader>,
    ) -> Self {
        Self {
            id,
            grid: attributes.cell_grid(),
            attributes,
            loader,
            cache: cache.clone(),
        }
    }

    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    pub fn grid(&self) -> &CellGrid {
        &self.grid
    }

    pub fn attributes(&self) -> &DatasetAttributes {
        &self.attributes
    }

    /// Cell by linear index
    pub async fn get(&self, cell: u64) -> Result<Arc<Chunk>> {
        self.cache.get(&self.id, cell, &self.loader).await
    }

    /// Cell by grid position
    pub async fn get_at(&self, position: &[u64]) -> Result<Arc<Chunk>> {
        if !self.grid.contains_cell(position) {
            return Err(VolumeError::OutOfBounds(format!(
                "cell {:?} outside grid {:?} of {}",
                position,
                self.grid.grid_dimensions(),
                self.id
            )));
        }
        self.get(self.grid.cell_index(position)).await
    }

    pub fn peek(&self, cell: u64) -> Option<Arc<Chunk>> {
        self.cache.peek(&self.id, cell)
    }

    pub fn invalidation(&self) -> InvalidationToken {
        self.cache.token(&self.id)
    }

    /// Observe invalidations of this dataset
    pub fn subscribe(&self, listener: Weak<dyn InvalidationListener>) {
        self.cache.subscribe(&self.id, listener);
    }
}

impl fmt::Debug for CachedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedArray")
            .field("id", &self.id)
            .field("grid", &self.grid)
            .finish()
    }
}
