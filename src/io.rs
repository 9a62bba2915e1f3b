//! Chunked-array containers
//!
//! [`ChunkStore`] is the container contract the cache layer is written
//! against. [`N5FileSystem`] implements it for N5 directories.

use crate::chunk::{decode_block, encode_block, Chunk};
use crate::error::{Result, VolumeError};
use crate::metadata::{DatasetAttributes, N5_VERSION_KEY};
use crate::utils::{block_path, join_path, normalize_path};
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

const ATTRIBUTES_FILE: &str = "attributes.json";

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// N5 directory on a local file system
    FileSystem,
    /// Single HDF5 file
    Hdf5,
    /// AWS S3
    S3,
    /// Google Cloud Storage
    GoogleCloud,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme or file extension
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("h5://") || url.ends_with(".h5") || url.ends_with(".hdf5") || url.ends_with(".hdf") {
            return Ok(StorageBackend::Hdf5);
        }
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                "s3" => Ok(StorageBackend::S3),
                "gs" => Ok(StorageBackend::GoogleCloud),
                _ => Err(VolumeError::configuration(url, format!("unknown scheme: {scheme}"))),
            }
        } else {
            Ok(StorageBackend::FileSystem)
        }
    }

    /// Single-file containers do not benefit from concurrent traversal.
    pub fn is_single_file(&self) -> bool {
        matches!(self, StorageBackend::Hdf5)
    }
}

/// Container of groups, attributes and chunked arrays.
///
/// Paths are `/`-separated and relative to the container root (`""`). All
/// failures surface as [`VolumeError::ContainerIo`]; absent blocks and
/// attributes are `Ok(None)`.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Stable identity of the container, e.g. its root URL
    fn url(&self) -> &str;

    fn backend(&self) -> StorageBackend;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn list_children(&self, path: &str) -> Result<Vec<String>>;

    /// All attributes of a node; empty if the node has none
    async fn attributes(&self, path: &str) -> Result<Map<String, Value>>;

    /// Merge attributes into a node, creating it if necessary
    async fn set_attributes(&self, path: &str, attributes: Map<String, Value>) -> Result<()>;

    async fn read_block(&self, path: &str, position: &[u64]) -> Result<Option<Bytes>>;

    async fn write_block(&self, path: &str, position: &[u64], block: &[u8]) -> Result<()>;

    /// Remove a node and everything below it
    async fn remove(&self, path: &str) -> Result<()>;

    async fn create_group(&self, path: &str) -> Result<()> {
        self.set_attributes(path, Map::new()).await
    }

    async fn is_array(&self, path: &str) -> Result<bool> {
        Ok(DatasetAttributes::is_dataset(&self.attributes(path).await?))
    }

    async fn get_attribute(&self, path: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.attributes(path).await?.remove(key))
    }

    async fn set_attribute(&self, path: &str, key: &str, value: Value) -> Result<()> {
        let mut attributes = Map::new();
        attributes.insert(key.to_string(), value);
        self.set_attributes(path, attributes).await
    }

    async fn dataset_attributes(&self, path: &str) -> Result<DatasetAttributes> {
        DatasetAttributes::from_attributes(path, &self.attributes(path).await?)
    }

    async fn create_dataset(&self, path: &str, attributes: &DatasetAttributes) -> Result<()> {
        self.set_attributes(path, attributes.to_attributes()?).await
    }

    /// Read and decode one cell; absent blocks decode to empty chunks.
    async fn read_chunk(
        &self,
        path: &str,
        attributes: &DatasetAttributes,
        position: &[u64],
    ) -> Result<Chunk> {
        let grid = attributes.cell_grid();
        let size = grid.cell_size(position);
        let bytes = self.read_block(path, position).await?;
        decode_block(attributes, position, &size, bytes.as_deref())
    }

    async fn write_chunk(
        &self,
        path: &str,
        attributes: &DatasetAttributes,
        chunk: &Chunk,
    ) -> Result<()> {
        let block = encode_block(attributes, chunk)?;
        self.write_block(path, chunk.position(), &block).await
    }
}

/// Typed attribute lookup; a present value of the wrong type is a
/// configuration error naming the path and key.
pub async fn get_attribute_as<T: DeserializeOwned>(
    store: &dyn ChunkStore,
    path: &str,
    key: &str,
) -> Result<Option<T>> {
    match store.get_attribute(path, key).await? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
            VolumeError::configuration(format!("{path}#{key}"), e.to_string())
        }),
    }
}

/// N5 container on a local file system
pub struct N5FileSystem {
    url: String,
    base_path: PathBuf,
    attributes_lock: tokio::sync::Mutex<()>,
}

impl N5FileSystem {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        let base_path = base_path.as_ref().to_path_buf();
        Self {
            url: base_path.to_string_lossy().into_owned(),
            base_path,
            attributes_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open an existing container directory
    pub async fn open(base_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self::new(base_path);
        match fs::metadata(&store.base_path).await {
            Ok(meta) if meta.is_dir() => Ok(store),
            Ok(_) => Err(VolumeError::configuration(
                store.url.clone(),
                "container root is not a directory",
            )),
            Err(e) => Err(VolumeError::io(store.url.clone(), e)),
        }
    }

    /// Create a container directory and stamp its root with the N5 version
    pub async fn create(base_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self::new(base_path);
        fs::create_dir_all(&store.base_path)
            .await
            .map_err(|e| VolumeError::io(store.url.clone(), e))?;
        store
            .set_attribute("", N5_VERSION_KEY, Value::String(crate::N5_VERSION.to_string()))
            .await?;
        Ok(store)
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let normalized = normalize_path(path);
        if normalized.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(normalized)
        }
    }

    fn block_file(&self, path: &str, position: &[u64]) -> PathBuf {
        self.full_path(&join_path(path, &block_path(position)))
    }
}

#[async_trait]
impl ChunkStore for N5FileSystem {
    fn url(&self) -> &str {
        &self.url
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match fs::metadata(self.full_path(path)).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VolumeError::io(path, e)),
        }
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(path);
        let mut read_dir = match fs::read_dir(&full_path).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VolumeError::io(path, e)),
        };

        let mut children = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| VolumeError::io(path, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| VolumeError::io(path, e))?
                .is_dir();
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                children.push(name.to_string());
            }
        }
        children.sort();
        Ok(children)
    }

    async fn attributes(&self, path: &str) -> Result<Map<String, Value>> {
        let file = self.full_path(path).join(ATTRIBUTES_FILE);
        let bytes = match fs::read(&file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(VolumeError::io(path, e)),
        };
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(VolumeError::io(
                path,
                std::io::Error::new(ErrorKind::InvalidData, "attributes.json is not an object"),
            )),
            Err(e) => Err(VolumeError::io(path, std::io::Error::new(ErrorKind::InvalidData, e))),
        }
    }

    async fn set_attributes(&self, path: &str, attributes: Map<String, Value>) -> Result<()> {
        let _guard = self.attributes_lock.lock().await;
        let dir = self.full_path(path);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| VolumeError::io(path, e))?;

        let file = dir.join(ATTRIBUTES_FILE);
        if attributes.is_empty()
            && fs::try_exists(&file)
                .await
                .map_err(|e| VolumeError::io(path, e))?
        {
            return Ok(());
        }
        let mut merged = self.attributes(path).await?;
        merged.extend(attributes);
        let json = serde_json::to_vec_pretty(&Value::Object(merged))?;
        fs::write(file, json)
            .await
            .map_err(|e| VolumeError::io(path, e))
    }

    async fn read_block(&self, path: &str, position: &[u64]) -> Result<Option<Bytes>> {
        match fs::read(self.block_file(path, position)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VolumeError::io(join_path(path, &block_path(position)), e)),
        }
    }

    async fn write_block(&self, path: &str, position: &[u64], block: &[u8]) -> Result<()> {
        let file = self.block_file(path, position);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| VolumeError::io(path, e))?;
        }
        fs::write(&file, block)
            .await
            .map_err(|e| VolumeError::io(join_path(path, &block_path(position)), e))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        debug!("Removing {} from {}", path, self.url);
        match fs::remove_dir_all(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VolumeError::io(path, e)),
        }
    }
}

/// Parse URL and open the matching container
///
/// Only N5 directories are supported; other backends implement [`ChunkStore`]
/// in the consuming application.
pub async fn open_container(url: &str) -> Result<Box<dyn ChunkStore>> {
    let backend = StorageBackend::from_url(url)?;

    match backend {
        StorageBackend::FileSystem => {
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Box::new(N5FileSystem::open(path).await?))
        }
        StorageBackend::Hdf5 | StorageBackend::S3 | StorageBackend::GoogleCloud => {
            Err(VolumeError::configuration(
                url,
                format!("backend {backend:?} is not supported; implement ChunkStore for it"),
            ))
        }
    }
}
