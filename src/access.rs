//! Volume access - consumer-facing API over one N5 container
//!
//! [`VolumeAccess`] owns the process-wide [`BlockCache`] and background
//! [`FetchQueue`] for a container. Datasets are opened by path into
//! [`OpenDataset`] handles whose pyramid levels share that cache.

use crate::cache::{BlockCache, CacheStats};
use crate::chunk::{Chunk, ChunkData};
use crate::config::VolumeConfig;
use crate::discovery::{CancellationFlag, DatasetDiscovery, Discovered};
use crate::error::{Result, VolumeError};
use crate::io::{open_container, ChunkStore};
use crate::label::{LabelMaskEvaluator, LabelQuery};
use crate::multiscale::{
    base_transform, is_multiscale, is_project_dataset, volumetric_data_group, MultiscaleAssembler,
    PyramidLevel,
};
use crate::project::{
    create_empty_label_dataset, FragmentSegmentAssignment, IdService, LabelBlockLookup,
    LabelDatasetLayout,
};
use crate::transform::WorldTransform;
use crate::types::{DataType, DatasetKind};
use crate::utils::normalize_path;
use crate::volatile::{FetchQueue, VolatileChunk};
use futures::future::try_join_all;
use log::{debug, info};
use ndarray::{ArrayD, IxDyn, ShapeBuilder, Slice};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An opened dataset: its kind and one [`PyramidLevel`] per resolution
#[derive(Debug)]
pub struct OpenDataset {
    path: String,
    kind: DatasetKind,
    data_type: DataType,
    levels: Vec<PyramidLevel>,
    closed: AtomicBool,
}

impl OpenDataset {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    /// Voxel type of the finest level
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Levels ordered finest first
    pub fn levels(&self) -> Result<&[PyramidLevel]> {
        if self.is_closed() {
            return Err(VolumeError::Closed(self.path.clone()));
        }
        Ok(&self.levels)
    }

    pub fn level(&self, index: usize) -> Result<&PyramidLevel> {
        self.levels()?.get(index).ok_or_else(|| {
            VolumeError::OutOfBounds(format!(
                "level {index} of `{}` with {} levels",
                self.path,
                self.levels.len()
            ))
        })
    }

    /// Mask evaluator of one level for `query`
    pub fn mask_evaluator(&self, level: usize, query: Arc<LabelQuery>) -> Result<LabelMaskEvaluator> {
        let level = self.level(level)?;
        let generator = level.mask_generator().ok_or_else(|| {
            VolumeError::configuration(
                level.path(),
                format!("data type {} does not hold labels", level.voxel_type()),
            )
        })?;
        Ok(generator.evaluator(query))
    }

    /// Close all overlays and drop the cached cells of every level.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for level in &self.levels {
            level.close();
        }
        info!("closed `{}`", self.path);
    }

    /// Shape and size of the dataset at each level
    pub fn stats(&self) -> Result<DatasetStats> {
        let levels = self.levels()?;
        let finest = &levels[0];
        Ok(DatasetStats {
            path: self.path.clone(),
            kind: self.kind,
            data_type: self.data_type,
            num_levels: levels.len(),
            dimensions: finest.grid().dimensions().to_vec(),
            num_cells: levels.iter().map(|l| l.grid().num_cells()).sum(),
            uncompressed_size: levels
                .iter()
                .map(|l| {
                    let voxels: u64 = l.grid().dimensions().iter().product();
                    voxels as usize * l.voxel_type().size_in_bytes()
                })
                .sum(),
        })
    }
}

impl Drop for OpenDataset {
    fn drop(&mut self) {
        self.close();
    }
}

/// Summary of an opened dataset
#[derive(Debug, Clone)]
pub struct DatasetStats {
    pub path: String,
    pub kind: DatasetKind,
    pub data_type: DataType,
    pub num_levels: usize,
    /// Dimensions of level 0
    pub dimensions: Vec<u64>,
    /// Cells over all levels
    pub num_cells: u64,
    /// Stored size over all levels, without compression
    pub uncompressed_size: usize,
}

impl DatasetStats {
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {}): {} levels, {:?} voxels at s0, {} cells, {} uncompressed",
            self.path,
            self.kind,
            self.data_type,
            self.num_levels,
            self.dimensions,
            self.num_cells,
            crate::utils::format_bytes(self.uncompressed_size),
        )
    }
}

/// Main interface for accessing the datasets of one container
pub struct VolumeAccess {
    store: Arc<dyn ChunkStore>,
    config: VolumeConfig,
    cache: BlockCache,
    queue: FetchQueue,
    assembler: MultiscaleAssembler,
}

impl VolumeAccess {
    /// Wrap an existing store. Must be called inside a tokio runtime.
    pub fn new(store: Arc<dyn ChunkStore>, config: VolumeConfig) -> Result<Self> {
        config.validate()?;
        let cache = BlockCache::new(config.cache_max_bytes);
        let queue = FetchQueue::new(config.fetch_workers);
        let assembler = MultiscaleAssembler::new(Arc::clone(&store), cache.clone(), queue.clone());
        debug!("volume access on {} with {:?}", store.url(), config);
        Ok(Self {
            store,
            config,
            cache,
            queue,
            assembler,
        })
    }

    /// Open the container at `url`
    pub async fn open(url: &str, config: VolumeConfig) -> Result<Self> {
        let store: Arc<dyn ChunkStore> = Arc::from(open_container(url).await?);
        Self::new(store, config)
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// All datasets below `root`; see [`DatasetDiscovery`]
    pub async fn discover_datasets(&self, root: &str, cancel: &CancellationFlag) -> Discovered {
        DatasetDiscovery::new(Arc::clone(&self.store), &self.config)
            .discover(root, cancel)
            .await
    }

    /// Open a project, multiscale group or plain array by path
    pub async fn open_dataset(&self, path: &str) -> Result<OpenDataset> {
        let path = normalize_path(path);
        let store = self.store.as_ref();
        if !store.exists(&path).await? {
            return Err(VolumeError::NotFound(path));
        }

        let (kind, levels) = if is_project_dataset(store, &path).await? {
            let data = volumetric_data_group(&path, true);
            let base = base_transform(store, &path, false).await?;
            let levels = if is_multiscale(store, &data).await? {
                self.assembler.open_multiscale(&data, base).await?
            } else {
                self.assembler.open_single(&data, base).await?
            };
            (DatasetKind::Project, levels)
        } else if is_multiscale(store, &path).await? {
            let base = base_transform(store, &path, false).await?;
            (DatasetKind::Multiscale, self.assembler.open_multiscale(&path, base).await?)
        } else if store.is_array(&path).await? {
            let base = base_transform(store, &path, false).await?;
            (DatasetKind::Array, self.assembler.open_single(&path, base).await?)
        } else {
            return Err(VolumeError::configuration(
                path,
                "neither a project, a multiscale group nor an array",
            ));
        };

        let data_type = levels
            .first()
            .map(PyramidLevel::voxel_type)
            .ok_or_else(|| VolumeError::configuration(&path, "no scale levels"))?;
        info!("opened `{path}` as {kind:?} with {} levels of {data_type}", levels.len());
        Ok(OpenDataset {
            path,
            kind,
            data_type,
            levels,
            closed: AtomicBool::new(false),
        })
    }

    /// Ordered pyramid levels of an opened dataset
    pub fn pyramid_levels<'a>(&self, dataset: &'a OpenDataset) -> Result<&'a [PyramidLevel]> {
        dataset.levels()
    }

    /// Non-blocking read of one cell at the default priority
    pub fn volatile_chunk(&self, dataset: &OpenDataset, level: usize, cell: u64) -> Result<VolatileChunk> {
        self.volatile_chunk_with_priority(dataset, level, cell, self.config.default_priority)
    }

    /// Non-blocking read of one cell; lower priorities are fetched first.
    pub fn volatile_chunk_with_priority(
        &self,
        dataset: &OpenDataset,
        level: usize,
        cell: u64,
        priority: i32,
    ) -> Result<VolatileChunk> {
        let level = dataset.level(level)?;
        if cell >= level.grid().num_cells() {
            return Err(VolumeError::OutOfBounds(format!(
                "cell {cell} of `{}` with {} cells",
                level.path(),
                level.grid().num_cells()
            )));
        }
        Ok(level.overlay().try_get(cell, priority))
    }

    /// Reload every level of `dataset` from storage.
    ///
    /// Cached cells are dropped and volatile views turn stale until the
    /// re-issued fetches complete.
    pub fn invalidate_dataset(&self, dataset: &OpenDataset) -> Result<()> {
        for level in dataset.levels()? {
            level.invalidation().invalidate_all();
        }
        debug!("invalidated `{}`", dataset.path());
        Ok(())
    }

    /// Boolean mask of the voxels of one cell belonging to `query`
    pub async fn evaluate_label_mask(
        &self,
        dataset: &OpenDataset,
        level: usize,
        cell: u64,
        query: Arc<LabelQuery>,
    ) -> Result<ArrayD<bool>> {
        let evaluator = dataset.mask_evaluator(level, query)?;
        let chunk = dataset.level(level)?.array().get(cell).await?;
        evaluator.mask_chunk(&chunk)
    }

    /// Voxels of the half-open box `[min, max)` of one level, assembled from
    /// the cached cells it overlaps. Multiset regions carry the lists of all
    /// contributing cells.
    pub async fn read_region(
        &self,
        dataset: &OpenDataset,
        level: usize,
        min: &[u64],
        max: &[u64],
    ) -> Result<ChunkData> {
        let level = dataset.level(level)?;
        let grid = level.grid();
        if min.len() != grid.rank() || max.len() != grid.rank() {
            return Err(VolumeError::InvalidDimensions(format!(
                "region of rank {}/{} for `{}` of rank {}",
                min.len(),
                max.len(),
                level.path(),
                grid.rank()
            )));
        }
        for d in 0..grid.rank() {
            if min[d] >= max[d] || max[d] > grid.dimensions()[d] {
                return Err(VolumeError::OutOfBounds(format!(
                    "region [{min:?}, {max:?}) of `{}` with dimensions {:?}",
                    level.path(),
                    grid.dimensions()
                )));
            }
        }

        let positions = grid.cells_in_box(min, max);
        debug!("reading {} cells of `{}` for [{min:?}, {max:?})", positions.len(), level.path());
        let chunks = try_join_all(positions.iter().map(|p| level.array().get_at(p))).await?;

        let shape: Vec<usize> = min.iter().zip(max).map(|(&lo, &hi)| (hi - lo) as usize).collect();
        let mut region = empty_region(level.voxel_type(), &shape);
        for chunk in &chunks {
            let origin = grid.cell_min(chunk.position());
            let (dst, src) = overlap(min, max, &origin, &chunk.size());
            copy_chunk(&mut region, chunk, &dst, &src)?;
        }
        Ok(region)
    }

    /// Fragment to segment assignments of a project; non-project datasets
    /// get an assignment that refuses to persist.
    pub async fn assignments(&self, dataset: &OpenDataset) -> Result<FragmentSegmentAssignment> {
        FragmentSegmentAssignment::load(Arc::clone(&self.store), dataset.path()).await
    }

    pub async fn id_service(&self, dataset: &OpenDataset) -> Result<IdService> {
        IdService::open(Arc::clone(&self.store), dataset.path()).await
    }

    pub async fn label_block_lookup(&self, dataset: &OpenDataset) -> Result<LabelBlockLookup> {
        LabelBlockLookup::open(Arc::clone(&self.store), dataset.path()).await
    }

    /// Create an empty label project at `group`
    pub async fn create_label_dataset(
        &self,
        group: &str,
        layout: &LabelDatasetLayout,
        ignore_existing: bool,
    ) -> Result<()> {
        create_empty_label_dataset(self.store.as_ref(), group, layout, ignore_existing).await
    }

    /// World transform of a level
    pub fn level_transform(&self, dataset: &OpenDataset, level: usize) -> Result<WorldTransform> {
        Ok(*dataset.level(level)?.transform())
    }

    /// Stop background fetches. Volatile reads report absent cells afterwards.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

impl Drop for VolumeAccess {
    fn drop(&mut self) {
        self.queue.shutdown();
    }
}

fn empty_region(voxel_type: DataType, shape: &[usize]) -> ChunkData {
    let shape = IxDyn(shape).f();
    match voxel_type {
        DataType::LabelMultiset => ChunkData::Multiset {
            lists: Vec::new(),
            index: ArrayD::zeros(shape),
        },
        t if t.is_float() => ChunkData::Float(ArrayD::zeros(shape)),
        t if t.is_signed() => ChunkData::Signed(ArrayD::zeros(shape)),
        _ => ChunkData::Unsigned(ArrayD::zeros(shape)),
    }
}

/// Ranges of the box `[min, max)` covered by a cell, in region and in
/// cell-local coordinates
fn overlap(
    min: &[u64],
    max: &[u64],
    origin: &[u64],
    size: &[u64],
) -> (Vec<Range<usize>>, Vec<Range<usize>>) {
    let mut dst = Vec::with_capacity(min.len());
    let mut src = Vec::with_capacity(min.len());
    for d in 0..min.len() {
        let lo = min[d].max(origin[d]);
        let hi = max[d].min(origin[d] + size[d]);
        dst.push((lo - min[d]) as usize..(hi - min[d]) as usize);
        src.push((lo - origin[d]) as usize..(hi - origin[d]) as usize);
    }
    (dst, src)
}

fn copy_overlap<T: Clone>(dst: &mut ArrayD<T>, src: &ArrayD<T>, dst_range: &[Range<usize>], src_range: &[Range<usize>]) {
    let source = src.slice_each_axis(|ax| Slice::from(src_range[ax.axis.index()].clone()));
    dst.slice_each_axis_mut(|ax| Slice::from(dst_range[ax.axis.index()].clone()))
        .assign(&source);
}

fn copy_chunk(
    region: &mut ChunkData,
    chunk: &Chunk,
    dst: &[Range<usize>],
    src: &[Range<usize>],
) -> Result<()> {
    match (region, chunk.data()) {
        (ChunkData::Unsigned(out), ChunkData::Unsigned(data)) => copy_overlap(out, data, dst, src),
        (ChunkData::Signed(out), ChunkData::Signed(data)) => copy_overlap(out, data, dst, src),
        (ChunkData::Float(out), ChunkData::Float(data)) => copy_overlap(out, data, dst, src),
        (
            ChunkData::Multiset { lists, index },
            ChunkData::Multiset {
                lists: chunk_lists,
                index: chunk_index,
            },
        ) => {
            let first = u32::try_from(lists.len())
                .map_err(|_| VolumeError::OutOfBounds("too many multiset lists in region".into()))?;
            lists.extend(chunk_lists.iter().cloned());
            let shifted = chunk_index.mapv(|i| i + first);
            copy_overlap(index, &shifted, dst, src);
        }
        (out, data) => {
            return Err(VolumeError::TypeMismatch {
                expected: out.kind().to_string(),
                found: data.kind().to_string(),
            })
        }
    }
    Ok(())
}
