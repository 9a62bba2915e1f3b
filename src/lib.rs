//! n5vol - block cache and multiscale assembly for N5 volumes
//!
//! Random access to larger-than-memory label and intensity volumes stored
//! in chunked N5 containers.
//!
//! # Features
//!
//! - Byte-bounded LRU block cache with single-flight loads; invalidation discards stale loads
//! - Non-blocking volatile views fed by a prioritised background fetch queue
//! - Multiscale pyramids with per-level world transforms
//! - Concurrent, cancellable dataset discovery
//! - Label masks over scalar ids and label multisets
//! - Composite project datasets (fragment-segment assignments, id service)
//!
//! # Storage backends
//!
//! The N5 filesystem layout is built in. Other containers implement the
//! [`ChunkStore`] trait in the consuming application.
//!
//! # Example
//!
//! ```rust,ignore
//! use n5vol::{LabelQuery, VolumeAccess, VolumeConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> n5vol::Result<()> {
//! let access = VolumeAccess::open("file:///data/sample.n5", VolumeConfig::default()).await?;
//! let dataset = access.open_dataset("volumes/labels/neuron_ids").await?;
//!
//! // Non-blocking: absent until the background fetch completes
//! let chunk = access.volatile_chunk(&dataset, 0, 0)?;
//!
//! let mask = access
//!     .evaluate_label_mask(&dataset, 0, 0, Arc::new(LabelQuery::new([7, 9])))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod cache;
pub mod chunk;
pub mod compression;
pub mod config;
pub mod discovery;
pub mod error;
pub mod io;
pub mod label;
pub mod layout;
pub mod metadata;
pub mod multiscale;
pub mod project;
pub mod transform;
pub mod types;
pub mod utils;
pub mod volatile;

// Re-exports
pub use access::{DatasetStats, OpenDataset, VolumeAccess};
pub use cache::{BlockCache, CacheStats, CachedArray, CellLoader, DatasetId, InvalidationToken};
pub use chunk::{Chunk, ChunkData};
pub use compression::{CompressionMethod, Compressor};
pub use config::VolumeConfig;
pub use discovery::{CancellationFlag, DatasetDiscovery, Discovered};
pub use error::{Result, VolumeError};
pub use io::{ChunkStore, N5FileSystem, StorageBackend};
pub use label::{LabelMaskEvaluator, LabelMultiset, LabelQuery, MaskGenerator};
pub use layout::CellGrid;
pub use metadata::DatasetAttributes;
pub use multiscale::{MultiscaleAssembler, PyramidLevel};
pub use project::{FragmentSegmentAssignment, IdService, LabelBlockLookup, LabelDatasetLayout};
pub use transform::WorldTransform;
pub use types::{DataType, DatasetKind, Label};
pub use volatile::{FetchQueue, Freshness, VolatileChunk, VolatileOverlay};

/// Version of the n5vol implementation
pub const N5VOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// N5 format version written to new container roots
pub const N5_VERSION: &str = "2.5.1";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!N5VOL_VERSION.is_empty());
        assert!(N5_VERSION.starts_with('2'));
    }
}
