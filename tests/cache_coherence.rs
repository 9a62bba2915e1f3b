//! Block cache behaviour against a real N5 container
//!
//! A counting wrapper around the filesystem store observes how often the
//! cache actually reaches storage.

use async_trait::async_trait;
use bytes::Bytes;
use n5vol::{
    BlockCache, Chunk, ChunkData, ChunkStore, CompressionMethod, DataType, DatasetAttributes,
    N5FileSystem, StorageBackend,
};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct CountingStore {
    inner: N5FileSystem,
    block_reads: AtomicUsize,
    read_delay_ms: AtomicU64,
}

impl CountingStore {
    fn new(inner: N5FileSystem) -> Self {
        Self {
            inner,
            block_reads: AtomicUsize::new(0),
            read_delay_ms: AtomicU64::new(0),
        }
    }

    fn reads(&self) -> usize {
        self.block_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkStore for CountingStore {
    fn url(&self) -> &str {
        self.inner.url()
    }

    fn backend(&self) -> StorageBackend {
        self.inner.backend()
    }

    async fn exists(&self, path: &str) -> n5vol::Result<bool> {
        self.inner.exists(path).await
    }

    async fn list_children(&self, path: &str) -> n5vol::Result<Vec<String>> {
        self.inner.list_children(path).await
    }

    async fn attributes(&self, path: &str) -> n5vol::Result<Map<String, Value>> {
        self.inner.attributes(path).await
    }

    async fn set_attributes(&self, path: &str, attributes: Map<String, Value>) -> n5vol::Result<()> {
        self.inner.set_attributes(path, attributes).await
    }

    async fn read_block(&self, path: &str, position: &[u64]) -> n5vol::Result<Option<Bytes>> {
        self.block_reads.fetch_add(1, Ordering::SeqCst);
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.read_block(path, position).await
    }

    async fn write_block(&self, path: &str, position: &[u64], block: &[u8]) -> n5vol::Result<()> {
        self.inner.write_block(path, position, block).await
    }

    async fn remove(&self, path: &str) -> n5vol::Result<()> {
        self.inner.remove(path).await
    }
}

fn attributes() -> DatasetAttributes {
    DatasetAttributes::new(vec![4, 4, 2], vec![4, 4, 1], DataType::Uint32, CompressionMethod::Gzip { level: 6 })
}

async fn fill_cell(store: &dyn ChunkStore, z: u64, value: u64) {
    let data = ArrayD::from_elem(IxDyn(&[4, 4, 1]).f(), value);
    let chunk = Chunk::new(vec![0, 0, z], ChunkData::Unsigned(data));
    store.write_chunk("raw", &attributes(), &chunk).await.unwrap();
}

fn first_value(chunk: &Chunk) -> u64 {
    chunk.data().label_at(&[0, 0, 0]).unwrap()
}

async fn setup(temp_dir: &TempDir) -> Arc<CountingStore> {
    let store = Arc::new(CountingStore::new(N5FileSystem::new(temp_dir.path())));
    store.create_dataset("raw", &attributes()).await.unwrap();
    fill_cell(store.as_ref(), 0, 1).await;
    fill_cell(store.as_ref(), 1, 100).await;
    store
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_gets_issue_one_read() {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp_dir = TempDir::new().unwrap();
    let store = setup(&temp_dir).await;
    store.read_delay_ms.store(50, Ordering::SeqCst);

    let cache = BlockCache::new(1 << 20);
    let array = cache.array(store.clone(), "raw", attributes());

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let array = array.clone();
            tokio::spawn(async move { array.get(0).await })
        })
        .collect();
    let mut chunks = Vec::new();
    for task in tasks {
        chunks.push(task.await.unwrap().unwrap());
    }

    assert_eq!(store.reads(), 1);
    assert!(chunks.iter().all(|c| Arc::ptr_eq(c, &chunks[0])));
    assert_eq!(first_value(&chunks[0]), 1);
}

#[tokio::test]
async fn invalidate_then_get_sees_new_storage_state() {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp_dir = TempDir::new().unwrap();
    let store = setup(&temp_dir).await;
    let cache = BlockCache::new(1 << 20);
    let array = cache.array(store.clone(), "raw", attributes());

    assert_eq!(first_value(&array.get(0).await.unwrap()), 1);

    fill_cell(store.as_ref(), 0, 2).await;
    // still served from the cache
    assert_eq!(first_value(&array.get(0).await.unwrap()), 1);
    assert_eq!(store.reads(), 1);

    array.invalidation().invalidate(0);
    fill_cell(store.as_ref(), 0, 3).await;
    assert_eq!(first_value(&array.get(0).await.unwrap()), 3);
    assert_eq!(store.reads(), 2);

    // other cells are untouched by a single-cell invalidation
    assert_eq!(first_value(&array.get(1).await.unwrap()), 100);
    assert_eq!(store.reads(), 3);
    assert!(array.peek(1).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn load_in_flight_during_invalidation_is_not_cached() {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp_dir = TempDir::new().unwrap();
    let store = setup(&temp_dir).await;
    store.read_delay_ms.store(100, Ordering::SeqCst);
    let cache = BlockCache::new(1 << 20);
    let array = cache.array(store.clone(), "raw", attributes());

    let in_flight = {
        let array = array.clone();
        tokio::spawn(async move { array.get(0).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    array.invalidation().invalidate_all();
    fill_cell(store.as_ref(), 0, 5).await;

    // the waiter still completes
    in_flight.await.unwrap().unwrap();
    assert!(array.peek(0).is_none());

    store.read_delay_ms.store(0, Ordering::SeqCst);
    assert_eq!(first_value(&array.get(0).await.unwrap()), 5);
    assert_eq!(cache.stats().discarded_loads, 1);
}

#[tokio::test]
async fn missing_block_reads_as_background() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(CountingStore::new(N5FileSystem::new(temp_dir.path())));
    let attributes = DatasetAttributes::new(vec![8, 8], vec![4, 4], DataType::Uint64, CompressionMethod::Raw);
    store.create_dataset("labels", &attributes).await.unwrap();

    let cache = BlockCache::new(1 << 20);
    let array = cache.array(store.clone(), "labels", attributes);
    let chunk = array.get_at(&[1, 1]).await.unwrap();
    assert_eq!(chunk.size(), vec![4, 4]);
    assert_eq!(chunk.data().label_at(&[3, 3]), Some(n5vol::Label::BACKGROUND));
}

#[tokio::test]
async fn corrupt_block_fails_without_poisoning_other_cells() {
    let temp_dir = TempDir::new().unwrap();
    let store = setup(&temp_dir).await;
    store.write_block("raw", &[0, 0, 1], b"\x00\x00").await.unwrap();

    let cache = BlockCache::new(1 << 20);
    let array = cache.array(store.clone(), "raw", attributes());
    let err = array.get(1).await.unwrap_err();
    assert!(matches!(err, n5vol::VolumeError::Load { cell: 1, .. }));
    assert_eq!(first_value(&array.get(0).await.unwrap()), 1);

    // failures are not cached
    array.get(1).await.unwrap_err();
    assert_eq!(store.reads(), 3);
}
