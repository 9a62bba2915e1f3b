//! Concurrent dataset discovery
//!
//! Walks the group hierarchy of a container and collects every node that
//! can be opened as a dataset. Each node is classified on its own task; the
//! walk tracks outstanding tasks with a counter and is polled for
//! completion, so it can be cancelled at any time with a partial result.

use crate::config::VolumeConfig;
use crate::io::{get_attribute_as, ChunkStore};
use crate::metadata::{MULTI_SCALE_KEY, PAINTERA_DATA_KEY};
use crate::multiscale::scale_level;
use crate::types::DatasetKind;
use crate::utils::join_path;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Cooperative cancellation of a running discovery
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Result of one discovery walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    /// Leaf dataset paths, sorted
    pub datasets: Vec<String>,
    /// Whether the walk was cancelled before it finished
    pub interrupted: bool,
}

fn holds(path: &str, predicate: &str, result: crate::error::Result<bool>) -> bool {
    result.unwrap_or_else(|e| {
        warn!("treating {path} as not {predicate}: {e}");
        false
    })
}

/// Classify one node; the children are returned when it is a group.
async fn classify_node(store: &dyn ChunkStore, path: &str) -> (DatasetKind, Vec<String>) {
    let is_project = store
        .attributes(path)
        .await
        .map(|attributes| attributes.contains_key(PAINTERA_DATA_KEY));
    if holds(path, "a project", is_project) {
        return (DatasetKind::Project, Vec::new());
    }
    if holds(path, "an array", store.is_array(path).await) {
        return (DatasetKind::Array, Vec::new());
    }

    let tagged = get_attribute_as::<bool>(store, path, MULTI_SCALE_KEY)
        .await
        .map(|flag| flag == Some(true));
    if holds(path, "tagged multiscale", tagged) {
        return (DatasetKind::Multiscale, Vec::new());
    }

    let children = match store.list_children(path).await {
        Ok(children) => children,
        Err(e) => {
            warn!("cannot list {path}: {e}");
            Vec::new()
        }
    };
    let mut legacy = !children.is_empty();
    for child in &children {
        let child_path = join_path(path, child);
        if scale_level(child).is_none()
            || !holds(&child_path, "an array", store.is_array(&child_path).await)
        {
            legacy = false;
            break;
        }
    }
    if legacy {
        info!(
            "{path} is a multiscale group without the {MULTI_SCALE_KEY} attribute; \
             add \"{MULTI_SCALE_KEY}\": true to its attributes"
        );
        return (DatasetKind::Multiscale, Vec::new());
    }
    (DatasetKind::Group, children)
}

/// Kind of the node at `path`. Query failures count as non-matching.
pub async fn classify(store: &dyn ChunkStore, path: &str) -> DatasetKind {
    classify_node(store, path).await.0
}

struct Walk {
    store: Arc<dyn ChunkStore>,
    datasets: Mutex<Vec<String>>,
    outstanding: AtomicUsize,
    permits: Semaphore,
    cancel: CancellationFlag,
}

impl Walk {
    /// Queue `path`; the counter is incremented before the task exists.
    fn enter(self: &Arc<Self>, path: String) {
        let count = self.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("entering {path:?}, {count} tasks outstanding");
        tokio::spawn(Arc::clone(self).visit(path));
    }

    fn visit(self: Arc<Self>, path: String) -> BoxFuture<'static, ()> {
        async move {
            if !self.cancel.is_cancelled() {
                if let Ok(_permit) = self.permits.acquire().await {
                    let (kind, children) = classify_node(self.store.as_ref(), &path).await;
                    if kind.is_leaf() {
                        debug!("found {kind:?} at {path:?}");
                        self.datasets.lock().push(path.clone());
                    } else if !self.cancel.is_cancelled() {
                        for child in children {
                            self.enter(join_path(&path, &child));
                        }
                    }
                }
            }
            let remaining = self.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
            debug!("leaving {path:?}, {remaining} tasks outstanding");
        }
        .boxed()
    }
}

/// Recursive classification walk over one container
pub struct DatasetDiscovery {
    store: Arc<dyn ChunkStore>,
    workers: usize,
    poll_interval: Duration,
}

impl DatasetDiscovery {
    /// Single-file containers are walked by one worker.
    pub fn new(store: Arc<dyn ChunkStore>, config: &VolumeConfig) -> Self {
        let workers = if store.backend().is_single_file() {
            1
        } else {
            config.discovery_workers.max(1)
        };
        Self {
            store,
            workers,
            poll_interval: Duration::from_millis(config.discovery_poll_interval_ms.max(1)),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Sorted paths of all datasets below `root`.
    ///
    /// Cancelling `cancel` abandons outstanding work; the datasets found so
    /// far are returned with `interrupted` set.
    pub async fn discover(&self, root: &str, cancel: &CancellationFlag) -> Discovered {
        let walk = Arc::new(Walk {
            store: Arc::clone(&self.store),
            datasets: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            permits: Semaphore::new(self.workers),
            cancel: cancel.clone(),
        });
        walk.enter(join_path(root, ""));

        let mut interrupted = false;
        while walk.outstanding.load(Ordering::Acquire) > 0 {
            if cancel.is_cancelled() {
                info!("dataset discovery below {root:?} cancelled");
                walk.permits.close();
                interrupted = true;
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let mut datasets = walk.datasets.lock().clone();
        datasets.sort();
        Discovered {
            datasets,
            interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionMethod;
    use crate::io::N5FileSystem;
    use crate::metadata::DatasetAttributes;
    use crate::types::DataType;
    use serde_json::json;
    use tempfile::TempDir;

    async fn array(store: &N5FileSystem, path: &str) {
        let attributes = DatasetAttributes::new(vec![8, 8, 8], vec![4, 4, 4], DataType::Uint8, CompressionMethod::Raw);
        store.create_dataset(path, &attributes).await.unwrap();
    }

    async fn sample_container(store: &N5FileSystem) {
        array(store, "volumes/raw").await;
        for level in ["s0", "s1", "s2"] {
            array(store, &format!("volumes/legacy/{level}")).await;
        }
        array(store, "volumes/tagged/s0").await;
        store.set_attribute("volumes/tagged", MULTI_SCALE_KEY, json!(true)).await.unwrap();
        store
            .set_attribute("projects/neurons", PAINTERA_DATA_KEY, json!({"type": "label"}))
            .await
            .unwrap();
        array(store, "projects/neurons/data/s0").await;
        array(store, "mixed/s0").await;
        store.create_group("mixed/extra").await.unwrap();
        array(store, "mixed/extra/deep").await;
    }

    #[tokio::test]
    async fn test_classification_rules() {
        let temp_dir = TempDir::new().unwrap();
        let store = N5FileSystem::new(temp_dir.path());
        sample_container(&store).await;

        assert_eq!(classify(&store, "volumes/raw").await, DatasetKind::Array);
        assert_eq!(classify(&store, "volumes/legacy").await, DatasetKind::Multiscale);
        assert_eq!(classify(&store, "volumes/tagged").await, DatasetKind::Multiscale);
        assert_eq!(classify(&store, "projects/neurons").await, DatasetKind::Project);
        assert_eq!(classify(&store, "mixed").await, DatasetKind::Group);
        assert_eq!(classify(&store, "volumes").await, DatasetKind::Group);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_discover_sorted_leaves() {
        let _ = env_logger::builder().is_test(true).try_init();
        let temp_dir = TempDir::new().unwrap();
        let store = N5FileSystem::new(temp_dir.path());
        sample_container(&store).await;

        let discovery = DatasetDiscovery::new(Arc::new(store), &VolumeConfig::default());
        let found = discovery.discover("", &CancellationFlag::new()).await;

        assert!(!found.interrupted);
        assert_eq!(
            found.datasets,
            vec![
                "mixed/extra/deep",
                "mixed/s0",
                "projects/neurons",
                "volumes/legacy",
                "volumes/raw",
                "volumes/tagged",
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_discovery_returns_partial_result() {
        let temp_dir = TempDir::new().unwrap();
        let store = N5FileSystem::new(temp_dir.path());
        sample_container(&store).await;

        let cancel = CancellationFlag::new();
        cancel.cancel();
        let discovery = DatasetDiscovery::new(Arc::new(store), &VolumeConfig::default());
        let found = discovery.discover("", &cancel).await;

        assert!(found.interrupted);
        assert!(found.datasets.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_attributes_do_not_abort_walk() {
        let temp_dir = TempDir::new().unwrap();
        let store = N5FileSystem::new(temp_dir.path());
        array(&store, "good").await;
        std::fs::create_dir_all(temp_dir.path().join("broken")).unwrap();
        std::fs::write(temp_dir.path().join("broken/attributes.json"), b"{not json").unwrap();

        let discovery = DatasetDiscovery::new(Arc::new(store), &VolumeConfig::default());
        let found = discovery.discover("", &CancellationFlag::new()).await;
        assert_eq!(found.datasets, vec!["good"]);
    }

    /// Stalls every request below `slow` so a walk can be cancelled midway.
    struct StallingStore {
        inner: N5FileSystem,
        slow: &'static str,
    }

    impl StallingStore {
        async fn pause(&self, path: &str) {
            if path.starts_with(self.slow) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        }
    }

    #[async_trait::async_trait]
    impl ChunkStore for StallingStore {
        fn url(&self) -> &str {
            self.inner.url()
        }

        fn backend(&self) -> crate::io::StorageBackend {
            self.inner.backend()
        }

        async fn exists(&self, path: &str) -> crate::error::Result<bool> {
            self.pause(path).await;
            self.inner.exists(path).await
        }

        async fn list_children(&self, path: &str) -> crate::error::Result<Vec<String>> {
            self.pause(path).await;
            self.inner.list_children(path).await
        }

        async fn attributes(&self, path: &str) -> crate::error::Result<serde_json::Map<String, serde_json::Value>> {
            self.pause(path).await;
            self.inner.attributes(path).await
        }

        async fn set_attributes(
            &self,
            path: &str,
            attributes: serde_json::Map<String, serde_json::Value>,
        ) -> crate::error::Result<()> {
            self.inner.set_attributes(path, attributes).await
        }

        async fn read_block(&self, path: &str, position: &[u64]) -> crate::error::Result<Option<bytes::Bytes>> {
            self.inner.read_block(path, position).await
        }

        async fn write_block(&self, path: &str, position: &[u64], block: &[u8]) -> crate::error::Result<()> {
            self.inner.write_block(path, position, block).await
        }

        async fn remove(&self, path: &str) -> crate::error::Result<()> {
            self.inner.remove(path).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_mid_walk_keeps_datasets_found_so_far() {
        let temp_dir = TempDir::new().unwrap();
        let store = N5FileSystem::new(temp_dir.path());
        sample_container(&store).await;
        let store = StallingStore {
            inner: store,
            slow: "volumes",
        };

        let cancel = CancellationFlag::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let discovery = DatasetDiscovery::new(Arc::new(store), &VolumeConfig::default());
        let found = discovery.discover("", &cancel).await;

        assert!(found.interrupted);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            found.datasets,
            vec!["mixed/extra/deep", "mixed/s0", "projects/neurons"]
        );
    }
}
