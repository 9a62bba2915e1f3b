//! Multiscale pyramids
//!
//! Scale levels are child arrays named `s<N>`, finest first. Opening a
//! pyramid reads the base transform from the group, composes each level's
//! transform from its `downsamplingFactors` and opens every level through the
//! shared block cache and a volatile overlay.

use crate::cache::{BlockCache, CachedArray, DatasetId, InvalidationToken};
use crate::error::{Result, VolumeError};
use crate::io::{get_attribute_as, ChunkStore};
use crate::label::MaskGenerator;
use crate::layout::CellGrid;
use crate::metadata::{
    DatasetAttributes, DOWNSAMPLING_FACTORS_KEY, MULTI_SCALE_KEY, OFFSET_KEY, PAINTERA_DATA_KEY,
    PROJECT_DATA_DATASET, RESOLUTION_KEY,
};
use crate::transform::{as_vec3, WorldTransform};
use crate::types::DataType;
use crate::utils::join_path;
use crate::volatile::{FetchQueue, VolatileOverlay};
use futures::future::{try_join_all, BoxFuture, FutureExt};
use log::{debug, info};
use std::sync::Arc;

const SCALE_PREFIX: char = 's';

/// Level number of a scale dataset name (`"s12"` -> `12`)
pub fn scale_level(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(SCALE_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Sort scale dataset names by their level number
pub fn sort_scale_datasets(names: &mut [String]) {
    names.sort_by_key(|name| scale_level(name).unwrap_or(u64::MAX));
}

pub async fn is_project_dataset(store: &dyn ChunkStore, group: &str) -> Result<bool> {
    Ok(store.exists(group).await? && store.attributes(group).await?.contains_key(PAINTERA_DATA_KEY))
}

/// Whether `group` is a pyramid: a non-array carrying `"multiScale": true`,
/// or one whose children are all scale-named arrays.
pub async fn is_multiscale(store: &dyn ChunkStore, group: &str) -> Result<bool> {
    if !store.exists(group).await? || store.is_array(group).await? {
        return Ok(false);
    }
    if get_attribute_as::<bool>(store, group, MULTI_SCALE_KEY).await? == Some(true) {
        return Ok(true);
    }
    if is_legacy_multiscale(store, group).await? {
        info!(
            "{group} is a multiscale group without the {MULTI_SCALE_KEY} attribute; \
             add \"{MULTI_SCALE_KEY}\": true to its attributes"
        );
        return Ok(true);
    }
    Ok(false)
}

/// Children are all `s<N>` arrays, and there is at least one
pub(crate) async fn is_legacy_multiscale(store: &dyn ChunkStore, group: &str) -> Result<bool> {
    let children = store.list_children(group).await?;
    if children.is_empty() {
        return Ok(false);
    }
    for child in &children {
        if scale_level(child).is_none() || !store.is_array(&join_path(group, child)).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Scale-named array children of `group`, unsorted
pub async fn list_scale_datasets(store: &dyn ChunkStore, group: &str) -> Result<Vec<String>> {
    let mut scales = Vec::new();
    for child in store.list_children(group).await? {
        if scale_level(&child).is_none() {
            continue;
        }
        // Unreadable candidates are not scale levels
        if store.is_array(&join_path(group, &child)).await.unwrap_or(false) {
            scales.push(child);
        }
    }
    debug!("scale datasets of {group}: {scales:?}");
    Ok(scales)
}

pub async fn list_and_sort_scale_datasets(store: &dyn ChunkStore, group: &str) -> Result<Vec<String>> {
    let mut scales = list_scale_datasets(store, group).await?;
    sort_scale_datasets(&mut scales);
    debug!("sorted scale datasets of {group}: {scales:?}");
    Ok(scales)
}

/// Path of the finest level, e.g. `group/s0`
pub async fn finest_level(store: &dyn ChunkStore, group: &str) -> Result<String> {
    let scales = list_and_sort_scale_datasets(store, group).await?;
    scales
        .first()
        .map(|name| join_path(group, name))
        .ok_or_else(|| VolumeError::configuration(group, "no scale levels"))
}

/// Path of the coarsest level
pub async fn coarsest_level(store: &dyn ChunkStore, group: &str) -> Result<String> {
    let scales = list_and_sort_scale_datasets(store, group).await?;
    scales
        .last()
        .map(|name| join_path(group, name))
        .ok_or_else(|| VolumeError::configuration(group, "no scale levels"))
}

/// Group holding the volume: `group/data` for projects, `group` otherwise
pub fn volumetric_data_group(group: &str, is_project: bool) -> String {
    if is_project {
        join_path(group, PROJECT_DATA_DATASET)
    } else {
        join_path(group, "")
    }
}

/// Finest level of a pyramid, or the array itself
pub async fn highest_resolution_dataset(store: &dyn ChunkStore, group: &str) -> Result<String> {
    if is_multiscale(store, group).await? {
        finest_level(store, group).await
    } else {
        Ok(join_path(group, ""))
    }
}

/// Array attributes of a project, pyramid or plain array
pub fn dataset_attributes_of<'a>(
    store: &'a dyn ChunkStore,
    group: &'a str,
) -> BoxFuture<'a, Result<DatasetAttributes>> {
    async move {
        if is_project_dataset(store, group).await? {
            return dataset_attributes_of(store, &join_path(group, PROJECT_DATA_DATASET)).await;
        }
        if is_multiscale(store, group).await? {
            return store.dataset_attributes(&finest_level(store, group).await?).await;
        }
        store.dataset_attributes(group).await
    }
    .boxed()
}

/// Numeric array attribute; projects resolve to their `data` group.
///
/// Integer and float encodings are both accepted. With `reverse`, the axis
/// order is flipped after reading.
pub async fn double_array_attribute(
    store: &dyn ChunkStore,
    group: &str,
    key: &str,
    reverse: bool,
    fallback: &[f64],
) -> Result<Vec<f64>> {
    let path = if is_project_dataset(store, group).await? {
        join_path(group, PROJECT_DATA_DATASET)
    } else {
        group.to_string()
    };
    let mut values = get_attribute_as::<Vec<f64>>(store, &path, key)
        .await?
        .unwrap_or_else(|| fallback.to_vec());
    if reverse {
        values.reverse();
    }
    Ok(values)
}

pub async fn resolution(store: &dyn ChunkStore, group: &str, reverse: bool) -> Result<[f64; 3]> {
    let values = double_array_attribute(store, group, RESOLUTION_KEY, reverse, &[1.0; 3]).await?;
    as_vec3(&values, group, RESOLUTION_KEY)
}

pub async fn offset(store: &dyn ChunkStore, group: &str, reverse: bool) -> Result<[f64; 3]> {
    let values = double_array_attribute(store, group, OFFSET_KEY, reverse, &[0.0; 3]).await?;
    as_vec3(&values, group, OFFSET_KEY)
}

pub async fn downsampling_factors(store: &dyn ChunkStore, level: &str) -> Result<[f64; 3]> {
    let values = double_array_attribute(store, level, DOWNSAMPLING_FACTORS_KEY, false, &[1.0; 3]).await?;
    let factors = as_vec3(&values, level, DOWNSAMPLING_FACTORS_KEY)?;
    if factors.iter().any(|&f| !f.is_finite() || f <= 0.0) {
        return Err(VolumeError::configuration(
            format!("{level}#{DOWNSAMPLING_FACTORS_KEY}"),
            format!("factors must be positive, found {factors:?}"),
        ));
    }
    Ok(factors)
}

/// Base transform from `resolution` and `offset` of `group`
pub async fn base_transform(store: &dyn ChunkStore, group: &str, reverse: bool) -> Result<WorldTransform> {
    Ok(WorldTransform::from_resolution_and_offset(
        resolution(store, group, reverse).await?,
        offset(store, group, reverse).await?,
    ))
}

/// One opened resolution level
#[derive(Clone)]
pub struct PyramidLevel {
    index: usize,
    path: String,
    array: CachedArray,
    overlay: VolatileOverlay,
    transform: WorldTransform,
    downsampling_factors: [f64; 3],
    relative_scales: [f64; 3],
    token: InvalidationToken,
    mask_generator: Option<MaskGenerator>,
}

impl PyramidLevel {
    /// 0 is the finest level
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn dataset_id(&self) -> &DatasetId {
        self.array.id()
    }

    pub fn grid(&self) -> &CellGrid {
        self.array.grid()
    }

    pub fn attributes(&self) -> &DatasetAttributes {
        self.array.attributes()
    }

    pub fn voxel_type(&self) -> DataType {
        self.array.attributes().voxel_type()
    }

    pub fn transform(&self) -> &WorldTransform {
        &self.transform
    }

    pub fn downsampling_factors(&self) -> [f64; 3] {
        self.downsampling_factors
    }

    /// Scale relative to level 0
    pub fn relative_scales(&self) -> [f64; 3] {
        self.relative_scales
    }

    pub fn invalidation(&self) -> &InvalidationToken {
        &self.token
    }

    pub fn array(&self) -> &CachedArray {
        &self.array
    }

    pub fn overlay(&self) -> &VolatileOverlay {
        &self.overlay
    }

    /// `None` for levels that do not hold labels
    pub fn mask_generator(&self) -> Option<MaskGenerator> {
        self.mask_generator
    }

    /// Close the overlay and drop every cached cell of this level
    pub fn close(&self) {
        self.overlay.close();
        self.token.invalidate_all();
    }
}

impl std::fmt::Debug for PyramidLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyramidLevel")
            .field("index", &self.index)
            .field("path", &self.path)
            .field("transform", &self.transform)
            .field("downsampling_factors", &self.downsampling_factors)
            .finish()
    }
}

/// Opens datasets as ordered [`PyramidLevel`] sequences
#[derive(Clone)]
pub struct MultiscaleAssembler {
    store: Arc<dyn ChunkStore>,
    cache: BlockCache,
    queue: FetchQueue,
}

impl MultiscaleAssembler {
    pub fn new(store: Arc<dyn ChunkStore>, cache: BlockCache, queue: FetchQueue) -> Self {
        Self { store, cache, queue }
    }

    /// Open all scale levels of `group` concurrently.
    ///
    /// Fails as a whole if any level fails to open.
    pub async fn open_multiscale(&self, group: &str, base: WorldTransform) -> Result<Vec<PyramidLevel>> {
        let scales = list_and_sort_scale_datasets(self.store.as_ref(), group).await?;
        let Some(finest) = scales.first() else {
            return Err(VolumeError::configuration(group, "no scale levels"));
        };
        let initial_factors = downsampling_factors(self.store.as_ref(), &join_path(group, finest)).await?;
        debug!("opening {scales:?} of {group} with base transform {base:?}");

        let levels = scales.iter().enumerate().map(|(index, name)| {
            let path = join_path(group, name);
            async move {
                let factors = downsampling_factors(self.store.as_ref(), &path).await?;
                self.open_level(index, path, base, factors, initial_factors).await
            }
        });
        try_join_all(levels).await
    }

    /// Open a plain array as a single-level pyramid
    pub async fn open_single(&self, path: &str, base: WorldTransform) -> Result<Vec<PyramidLevel>> {
        let level = self.open_level(0, join_path(path, ""), base, [1.0; 3], [1.0; 3]).await?;
        Ok(vec![level])
    }

    async fn open_level(
        &self,
        index: usize,
        path: String,
        base: WorldTransform,
        factors: [f64; 3],
        initial_factors: [f64; 3],
    ) -> Result<PyramidLevel> {
        let attributes = self.store.dataset_attributes(&path).await?;
        let voxel_type = attributes.voxel_type();
        let relative_scales: [f64; 3] = std::array::from_fn(|d| factors[d] / initial_factors[d]);
        let mask_generator = if voxel_type.is_label() {
            Some(MaskGenerator::for_level(voxel_type, &relative_scales, &path)?)
        } else {
            None
        };
        let transform = if index == 0 {
            base
        } else {
            base.consider_downsampling(factors, initial_factors)
        };

        let array = self.cache.array(Arc::clone(&self.store), &path, attributes);
        let overlay = VolatileOverlay::new(array.clone(), self.queue.clone());
        let token = array.invalidation();
        debug!("opened level {index} at {path} ({voxel_type}, {:?})", array.grid().dimensions());

        Ok(PyramidLevel {
            index,
            path,
            array,
            overlay,
            transform,
            downsampling_factors: factors,
            relative_scales,
            token,
            mask_generator,
        })
    }
}
