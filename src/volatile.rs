//! Non-blocking read path over cached arrays
//!
//! A [`VolatileOverlay`] answers [`VolatileOverlay::try_get`] immediately with
//! whatever it holds and schedules the missing cell on a shared
//! [`FetchQueue`]. Entries go stale when the underlying block cache is
//! invalidated and become fresh again once the re-issued fetch completes.

use crate::cache::{CachedArray, InvalidationListener};
use crate::chunk::Chunk;
use crate::error::Result;
use futures::future::{BoxFuture, FutureExt};
use log::{trace, warn};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

struct Job {
    priority: i32,
    seq: u64,
    task: BoxFuture<'static, ()>,
}

// BinaryHeap is a max-heap: the lowest priority number and then the
// oldest submission must compare greatest.
impl Ord for Job {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Job {}

struct QueueInner {
    jobs: Mutex<BinaryHeap<Job>>,
    notify: Notify,
    closed: AtomicBool,
    next_seq: AtomicU64,
}

impl QueueInner {
    async fn work(self: Arc<Self>) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                break;
            }
            let job = self.jobs.lock().pop();
            match job {
                Some(job) => job.task.await,
                None => notified.await,
            }
        }
    }
}

struct Shutdown(Arc<QueueInner>);

impl Drop for Shutdown {
    fn drop(&mut self) {
        self.0.closed.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }
}

/// Bounded pool of background workers serving jobs by priority.
///
/// Lower numbers run first; jobs of equal priority run in submission order.
/// Workers stop once the last handle is dropped or [`FetchQueue::shutdown`]
/// is called; queued jobs are then dropped without running.
#[derive(Clone)]
pub struct FetchQueue {
    inner: Arc<QueueInner>,
    _shutdown: Arc<Shutdown>,
}

impl FetchQueue {
    /// Spawn `workers` tasks on the current tokio runtime.
    pub fn new(workers: usize) -> Self {
        let inner = Arc::new(QueueInner {
            jobs: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });
        for _ in 0..workers.max(1) {
            tokio::spawn(Arc::clone(&inner).work());
        }
        Self {
            _shutdown: Arc::new(Shutdown(Arc::clone(&inner))),
            inner,
        }
    }

    pub fn submit<F>(&self, priority: i32, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return;
        }
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.jobs.lock().push(Job {
            priority,
            seq,
            task: task.boxed(),
        });
        self.inner.notify.notify_one();
    }

    /// Jobs waiting for a worker
    pub fn pending(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.jobs.lock().clear();
        self.inner.notify.notify_waiters();
    }
}

/// Availability of a volatile cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Nothing loaded yet, or the last fetch failed
    Absent,
    /// Old content shown while a newer version is fetched
    Stale,
    Fresh,
}

/// Answer of [`VolatileOverlay::try_get`]
#[derive(Debug, Clone)]
pub struct VolatileChunk {
    pub chunk: Option<Arc<Chunk>>,
    pub freshness: Freshness,
}

impl VolatileChunk {
    fn absent() -> Self {
        Self {
            chunk: None,
            freshness: Freshness::Absent,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh
    }
}

#[derive(Default)]
struct VolatileEntry {
    chunk: Option<Arc<Chunk>>,
    fresh: bool,
    pending: bool,
    failed: bool,
    generation: u64,
    priority: i32,
}

impl VolatileEntry {
    fn freshness(&self) -> Freshness {
        match (&self.chunk, self.fresh) {
            (None, _) => Freshness::Absent,
            (Some(_), false) => Freshness::Stale,
            (Some(_), true) => Freshness::Fresh,
        }
    }
}

struct OverlayInner {
    array: CachedArray,
    queue: FetchQueue,
    entries: Mutex<HashMap<u64, VolatileEntry>>,
    closed: AtomicBool,
    refetch_on_access: AtomicBool,
    this: Weak<OverlayInner>,
}

impl OverlayInner {
    fn schedule(&self, cell: u64, generation: u64, priority: i32) {
        let overlay = self.this.clone();
        self.queue.submit(priority, async move {
            let Some(overlay) = overlay.upgrade() else {
                return;
            };
            if overlay.closed.load(Ordering::Acquire) {
                return;
            }
            let result = overlay.array.get(cell).await;
            overlay.finish(cell, generation, result);
        });
    }

    fn finish(&self, cell: u64, generation: u64, result: Result<Arc<Chunk>>) {
        if self.closed.load(Ordering::Acquire) {
            trace!("dropping fetch of cell {} of closed {}", cell, self.array.id());
            return;
        }
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&cell) else {
            return;
        };
        // Superseded by an invalidation; its own fetch is queued.
        if entry.generation != generation {
            return;
        }
        entry.pending = false;
        match result {
            Ok(chunk) => {
                entry.chunk = Some(chunk);
                entry.fresh = true;
                entry.failed = false;
            }
            Err(e) => {
                warn!("background fetch of cell {} of {} failed: {}", cell, self.array.id(), e);
                entry.failed = true;
            }
        }
    }
}

impl InvalidationListener for OverlayInner {
    fn invalidated(&self, cell: Option<u64>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut refetch = Vec::new();
        {
            let mut entries = self.entries.lock();
            let cells: Vec<u64> = match cell {
                Some(cell) => vec![cell],
                None => entries.keys().copied().collect(),
            };
            for cell in cells {
                let idle = match entries.get(&cell) {
                    Some(entry) => entry.chunk.is_none() && !entry.pending,
                    None => continue,
                };
                // nothing shown and nothing fetching: the next access starts over
                if idle {
                    entries.remove(&cell);
                    continue;
                }
                if let Some(entry) = entries.get_mut(&cell) {
                    entry.generation += 1;
                    entry.fresh = false;
                    entry.failed = false;
                    entry.pending = true;
                    refetch.push((cell, entry.generation, entry.priority));
                }
            }
        }
        for (cell, generation, priority) in refetch {
            self.schedule(cell, generation, priority);
        }
    }

    fn evicted(&self, cell: u64) {
        let mut entries = self.entries.lock();
        let pending = match entries.get_mut(&cell) {
            Some(entry) if entry.pending => {
                entry.chunk = None;
                entry.fresh = false;
                true
            }
            Some(_) => false,
            None => return,
        };
        if !pending {
            entries.remove(&cell);
        }
    }
}

/// Non-blocking, independently invalidatable view of a [`CachedArray`]
#[derive(Clone)]
pub struct VolatileOverlay {
    inner: Arc<OverlayInner>,
}

impl VolatileOverlay {
    /// Wrap `array`; invalidations of its block cache entries propagate here.
    ///
    /// A cell evicted from the block cache is forgotten, so the overlay never
    /// holds more decoded data than the cache bound plus fetches in flight.
    pub fn new(array: CachedArray, queue: FetchQueue) -> Self {
        let inner = Arc::new_cyclic(|this| OverlayInner {
            array,
            queue,
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            refetch_on_access: AtomicBool::new(false),
            this: this.clone(),
        });
        let listener: Weak<dyn InvalidationListener> = Arc::downgrade(&inner) as Weak<OverlayInner>;
        inner.array.subscribe(listener);
        Self { inner }
    }

    pub fn array(&self) -> &CachedArray {
        &self.inner.array
    }

    /// Re-issue a fetch on every access that is not already pending
    pub fn set_refetch_on_access(&self, enabled: bool) {
        self.inner.refetch_on_access.store(enabled, Ordering::Relaxed);
    }

    /// Current content of `cell`, scheduling a fetch if needed. Never waits.
    ///
    /// A cell whose last fetch failed stays absent until it is invalidated.
    pub fn try_get(&self, cell: u64, priority: i32) -> VolatileChunk {
        if self.is_closed() {
            return VolatileChunk::absent();
        }
        let refetch_on_access = self.inner.refetch_on_access.load(Ordering::Relaxed);
        let (answer, fetch) = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(cell).or_default();
            let wanted = entry.chunk.is_none() || !entry.fresh || refetch_on_access;
            let fetch = if wanted && !entry.pending && !entry.failed {
                entry.pending = true;
                entry.priority = priority;
                Some(entry.generation)
            } else {
                None
            };
            let answer = VolatileChunk {
                chunk: entry.chunk.clone(),
                freshness: entry.freshness(),
            };
            (answer, fetch)
        };
        if let Some(generation) = fetch {
            trace!("scheduling cell {} of {} at priority {}", cell, self.inner.array.id(), priority);
            self.inner.schedule(cell, generation, priority);
        }
        answer
    }

    /// Number of cells this overlay currently tracks
    pub fn tracked_cells(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Freshness of `cell` without scheduling anything
    pub fn freshness(&self, cell: u64) -> Freshness {
        self.inner
            .entries
            .lock()
            .get(&cell)
            .map_or(Freshness::Absent, VolatileEntry::freshness)
    }

    /// Blocking read through the block cache
    pub async fn get(&self, cell: u64) -> Result<Arc<Chunk>> {
        self.inner.array.get(cell).await
    }

    /// Mark `cell` stale in this overlay only and refetch it
    pub fn invalidate(&self, cell: u64) {
        self.inner.invalidated(Some(cell));
    }

    pub fn invalidate_all(&self) {
        self.inner.invalidated(None);
    }

    /// Drop all entries; fetches still running complete but are discarded.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.entries.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BlockCache, CellLoader, DatasetId};
    use crate::chunk::ChunkData;
    use crate::error::VolumeError;
    use crate::metadata::DatasetAttributes;
    use crate::types::DataType;
    use async_trait::async_trait;
    use ndarray::{ArrayD, IxDyn};
    use std::time::Duration;

    struct ValueLoader {
        value: AtomicU64,
        fail: AtomicBool,
        delay: Duration,
    }

    #[async_trait]
    impl CellLoader for ValueLoader {
        async fn load(&self, cell: u64) -> Result<Chunk> {
            let value = self.value.load(Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(VolumeError::Codec("truncated stream".to_string()));
            }
            let data = ArrayD::from_elem(IxDyn(&[2, 2, 2]), value);
            Ok(Chunk::new(vec![cell, 0, 0], ChunkData::Unsigned(data)))
        }
    }

    fn overlay(delay: Duration) -> (BlockCache, VolatileOverlay, Arc<ValueLoader>) {
        overlay_bounded(delay, 1 << 20)
    }

    fn overlay_bounded(delay: Duration, max_bytes: usize) -> (BlockCache, VolatileOverlay, Arc<ValueLoader>) {
        let cache = BlockCache::new(max_bytes);
        let loader = Arc::new(ValueLoader {
            value: AtomicU64::new(1),
            fail: AtomicBool::new(false),
            delay,
        });
        let attributes = DatasetAttributes::new(vec![8, 2, 2], vec![2, 2, 2], DataType::Uint64, Default::default());
        let dyn_loader: Arc<dyn CellLoader> = loader.clone();
        let array = CachedArray::with_loader(&cache, DatasetId::new("mem", "labels/s0"), attributes, dyn_loader);
        let overlay = VolatileOverlay::new(array, FetchQueue::new(2));
        (cache, overlay, loader)
    }

    async fn wait_for(overlay: &VolatileOverlay, cell: u64, freshness: Freshness) -> VolatileChunk {
        for _ in 0..200 {
            let answer = overlay.try_get(cell, 0);
            if answer.freshness == freshness {
                return answer;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cell {cell} never became {freshness:?}");
    }

    fn value_of(answer: &VolatileChunk) -> u64 {
        answer.chunk.as_ref().unwrap().data().label_at(&[0, 0, 0]).unwrap()
    }

    #[tokio::test]
    async fn test_try_get_returns_absent_then_fresh() {
        let (_cache, overlay, _) = overlay(Duration::from_millis(20));
        let first = overlay.try_get(0, 0);
        assert_eq!(first.freshness, Freshness::Absent);
        assert!(first.chunk.is_none());

        let answer = wait_for(&overlay, 0, Freshness::Fresh).await;
        assert_eq!(value_of(&answer), 1);
    }

    #[tokio::test]
    async fn test_cache_invalidation_makes_entry_stale_then_fresh() {
        let (cache, overlay, loader) = overlay(Duration::from_millis(30));
        wait_for(&overlay, 1, Freshness::Fresh).await;

        loader.value.store(2, Ordering::SeqCst);
        cache.invalidate(overlay.array().id(), 1);

        let stale = overlay.try_get(1, 0);
        assert_eq!(stale.freshness, Freshness::Stale);
        assert_eq!(value_of(&stale), 1);

        let fresh = wait_for(&overlay, 1, Freshness::Fresh).await;
        assert_eq!(value_of(&fresh), 2);
    }

    #[tokio::test]
    async fn test_refetch_on_access_reissues_fetches() {
        let (cache, overlay, _) = overlay(Duration::from_millis(1));
        wait_for(&overlay, 0, Freshness::Fresh).await;
        let hits = cache.stats().hits;

        overlay.try_get(0, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.stats().hits, hits);

        overlay.set_refetch_on_access(true);
        assert_eq!(overlay.try_get(0, 0).freshness, Freshness::Fresh);
        for _ in 0..200 {
            if cache.stats().hits > hits {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cache.stats().hits > hits);
    }

    #[tokio::test]
    async fn test_failed_fetch_stays_absent_until_invalidated() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (_cache, overlay, loader) = overlay(Duration::ZERO);
        loader.fail.store(true, Ordering::SeqCst);

        overlay.try_get(2, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(overlay.try_get(2, 0).freshness, Freshness::Absent);

        loader.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Not retried on access
        assert_eq!(overlay.freshness(2), Freshness::Absent);

        overlay.invalidate(2);
        wait_for(&overlay, 2, Freshness::Fresh).await;
    }

    #[tokio::test]
    async fn test_invalidating_failed_cell_forgets_it() {
        let (_cache, overlay, loader) = overlay(Duration::ZERO);
        loader.fail.store(true, Ordering::SeqCst);
        overlay.try_get(6, 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(overlay.tracked_cells(), 1);

        overlay.invalidate_all();
        assert_eq!(overlay.tracked_cells(), 0);
    }

    #[tokio::test]
    async fn test_overlay_does_not_pin_evicted_cells() {
        let chunk_bytes = Chunk::new(
            vec![0, 0, 0],
            ChunkData::Unsigned(ArrayD::zeros(IxDyn(&[2, 2, 2]))),
        )
        .size_in_bytes();
        let (cache, overlay, _) = overlay_bounded(Duration::ZERO, chunk_bytes * 2);

        for cell in 0..4 {
            let answer = wait_for(&overlay, cell, Freshness::Fresh).await;
            assert_eq!(value_of(&answer), 1);
        }

        let stats = cache.stats();
        assert!(stats.resident_bytes <= chunk_bytes * 2);
        assert_eq!(stats.evictions, 2);
        assert_eq!(overlay.tracked_cells(), 2);
        assert_eq!(overlay.freshness(0), Freshness::Absent);
        assert_eq!(overlay.freshness(3), Freshness::Fresh);

        // an evicted cell is fetched again on access
        wait_for(&overlay, 0, Freshness::Fresh).await;
    }

    #[tokio::test]
    async fn test_close_drops_results() {
        let (_cache, overlay, _) = overlay(Duration::from_millis(30));
        overlay.try_get(3, 0);
        overlay.close();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(overlay.freshness(3), Freshness::Absent);
        assert_eq!(overlay.try_get(3, 0).freshness, Freshness::Absent);
    }

    #[tokio::test]
    async fn test_queue_orders_by_priority_then_submission() {
        let queue = FetchQueue::new(1);
        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the only worker until every job is queued
        let blocker = Arc::clone(&gate);
        queue.submit(0, async move { blocker.notified().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        for (priority, name) in [(5, "coarse-a"), (1, "fine-a"), (5, "coarse-b"), (1, "fine-b")] {
            let order = Arc::clone(&order);
            queue.submit(priority, async move { order.lock().push(name) });
        }
        assert_eq!(queue.pending(), 4);
        gate.notify_one();

        for _ in 0..100 {
            if order.lock().len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*order.lock(), vec!["fine-a", "fine-b", "coarse-a", "coarse-b"]);
    }

    #[tokio::test]
    async fn test_shutdown_discards_queued_jobs() {
        let queue = FetchQueue::new(1);
        queue.shutdown();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        queue.submit(0, async move { flag.store(true, Ordering::SeqCst) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert!(queue.is_closed());
    }
}
