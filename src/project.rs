//! Composite project datasets
//!
//! A project group carries `painteraData` and bundles the label volume
//! (`data`), the fragment-to-segment assignment table, an id counter
//! (`maxId`) and a per-level label-to-block index.

use crate::chunk::{Chunk, ChunkData};
use crate::compression::CompressionMethod;
use crate::error::{Result, VolumeError};
use crate::io::{get_attribute_as, ChunkStore};
use crate::metadata::{
    DatasetAttributes, DOWNSAMPLING_FACTORS_KEY, FRAGMENT_SEGMENT_ASSIGNMENT_DATASET,
    IS_LABEL_MULTISET_KEY, LABEL_TO_BLOCK_MAPPING, MAX_ID_KEY, MAX_NUM_ENTRIES_KEY,
    MULTI_SCALE_KEY, OFFSET_KEY, PAINTERA_DATA_KEY, PROJECT_DATA_DATASET, RESOLUTION_KEY,
    UNIQUE_LABELS_GROUP, ProjectMarker,
};
use crate::multiscale::is_project_dataset;
use crate::types::DataType;
use crate::utils::join_path;
use log::{debug, info};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

enum Persistence {
    Table { store: Arc<dyn ChunkStore>, dataset: String },
    Unsupported { group: String },
}

/// Fragment to segment lookup table with local edits
pub struct FragmentSegmentAssignment {
    persistence: Persistence,
    table: HashMap<u64, u64>,
}

impl FragmentSegmentAssignment {
    /// Load the table of `group`. Non-project groups get an empty table
    /// that cannot be persisted.
    pub async fn load(store: Arc<dyn ChunkStore>, group: &str) -> Result<Self> {
        if !is_project_dataset(store.as_ref(), group).await? {
            return Ok(Self {
                persistence: Persistence::Unsupported {
                    group: group.to_string(),
                },
                table: HashMap::new(),
            });
        }

        let dataset = join_path(group, FRAGMENT_SEGMENT_ASSIGNMENT_DATASET);
        let table = if store.is_array(&dataset).await? {
            read_table(store.as_ref(), &dataset).await?
        } else {
            HashMap::new()
        };
        debug!("loaded {} assignments from {}", table.len(), dataset);
        Ok(Self {
            persistence: Persistence::Table { store, dataset },
            table,
        })
    }

    pub fn assign(&mut self, fragment: u64, segment: u64) {
        self.table.insert(fragment, segment);
    }

    pub fn unassign(&mut self, fragment: u64) -> Option<u64> {
        self.table.remove(&fragment)
    }

    /// Segment of `fragment`; unassigned fragments are their own segment
    pub fn lookup(&self, fragment: u64) -> u64 {
        self.table.get(&fragment).copied().unwrap_or(fragment)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn can_persist(&self) -> bool {
        matches!(self.persistence, Persistence::Table { .. })
    }

    /// Write the table as a two-column `uint64` dataset.
    ///
    /// An empty table is refused and the stored table is left untouched.
    pub async fn persist(&self) -> Result<()> {
        let (store, dataset) = match &self.persistence {
            Persistence::Table { store, dataset } => (store, dataset),
            Persistence::Unsupported { group } => {
                return Err(VolumeError::configuration(
                    group.as_str(),
                    "persisting assignments is only supported for project groups",
                ))
            }
        };
        if self.table.is_empty() {
            return Err(VolumeError::configuration(
                dataset.as_str(),
                "refusing to persist zero-length fragment-segment-assignment",
            ));
        }

        let mut rows: Vec<(u64, u64)> = self.table.iter().map(|(&k, &v)| (k, v)).collect();
        rows.sort_unstable();
        let n = rows.len();
        let attributes = DatasetAttributes::new(
            vec![n as u64, 2],
            vec![n as u32, 1],
            DataType::Uint64,
            CompressionMethod::Gzip { level: -1 },
        );
        store.create_dataset(dataset, &attributes).await?;
        let keys = column(rows.iter().map(|&(k, _)| k).collect(), vec![0, 0])?;
        let values = column(rows.iter().map(|&(_, v)| v).collect(), vec![0, 1])?;
        store.write_chunk(dataset, &attributes, &keys).await?;
        store.write_chunk(dataset, &attributes, &values).await?;
        info!("persisted {} assignments to {}", n, dataset);
        Ok(())
    }
}

fn column(values: Vec<u64>, position: Vec<u64>) -> Result<Chunk> {
    let n = values.len();
    let array = ArrayD::from_shape_vec(IxDyn(&[n, 1]).f(), values)
        .map_err(|e| VolumeError::InvalidBlock(e.to_string()))?;
    Ok(Chunk::new(position, ChunkData::Unsigned(array)))
}

async fn read_table(store: &dyn ChunkStore, dataset: &str) -> Result<HashMap<u64, u64>> {
    let attributes = store.dataset_attributes(dataset).await?;
    if attributes.dimensions.len() != 2 || attributes.dimensions[1] != 2 {
        return Err(VolumeError::configuration(
            dataset,
            format!("expected an n x 2 table, found {:?}", attributes.dimensions),
        ));
    }
    let grid = attributes.cell_grid();
    let rows_per_block = grid.cell_dimensions()[0];
    let mut table = HashMap::new();
    for block in 0..grid.grid_dimensions()[0] {
        let keys = store.read_chunk(dataset, &attributes, &[block, 0]).await?;
        let values = store.read_chunk(dataset, &attributes, &[block, 1]).await?;
        let (ChunkData::Unsigned(keys), ChunkData::Unsigned(values)) = (keys.data(), values.data()) else {
            return Err(VolumeError::TypeMismatch {
                expected: "unsigned integers".to_string(),
                found: keys.data().kind().to_string(),
            });
        };
        debug!("reading rows from {} of {}", block * rows_per_block, dataset);
        table.extend(keys.iter().copied().zip(values.iter().copied()));
    }
    Ok(table)
}

/// Hands out fresh label ids above the stored `maxId`
pub struct IdService {
    store: Arc<dyn ChunkStore>,
    dataset: String,
    max_id: AtomicU64,
}

impl IdService {
    /// Requires a `maxId` attribute on `dataset`.
    pub async fn open(store: Arc<dyn ChunkStore>, dataset: &str) -> Result<Self> {
        let max_id = get_attribute_as::<u64>(store.as_ref(), dataset, MAX_ID_KEY)
            .await?
            .ok_or_else(|| {
                VolumeError::configuration(format!("{dataset}#{MAX_ID_KEY}"), "maxId not specified")
            })?;
        debug!("id service for {} starts above {}", dataset, max_id);
        Ok(Self {
            store,
            dataset: dataset.to_string(),
            max_id: AtomicU64::new(max_id),
        })
    }

    pub fn next_id(&self) -> u64 {
        self.max_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// `n` consecutive fresh ids
    pub fn next_ids(&self, n: u64) -> Vec<u64> {
        let first = self.max_id.fetch_add(n, Ordering::SeqCst) + 1;
        (first..first + n).collect()
    }

    pub fn max_id(&self) -> u64 {
        self.max_id.load(Ordering::SeqCst)
    }

    /// Store the current `maxId`
    pub async fn persist(&self) -> Result<()> {
        self.store
            .set_attribute(&self.dataset, MAX_ID_KEY, json!(self.max_id()))
            .await
    }
}

/// Bounding box in voxel coordinates, both ends inclusive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub min: Vec<u64>,
    pub max: Vec<u64>,
}

impl Interval {
    pub fn new(min: Vec<u64>, max: Vec<u64>) -> Self {
        Self { min, max }
    }
}

/// Per-level index of the blocks containing each label id
pub enum LabelBlockLookup {
    /// Intervals stored as attributes of `label-to-block-mapping/s<level>`
    Project { store: Arc<dyn ChunkStore>, group: String },
    /// Non-project datasets: reads are empty, writes are ignored
    Unsupported,
}

impl LabelBlockLookup {
    pub async fn open(store: Arc<dyn ChunkStore>, group: &str) -> Result<Self> {
        if is_project_dataset(store.as_ref(), group).await? {
            Ok(LabelBlockLookup::Project {
                store,
                group: join_path(group, LABEL_TO_BLOCK_MAPPING),
            })
        } else {
            info!("label block lookup is not supported for non-project {group}");
            Ok(LabelBlockLookup::Unsupported)
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, LabelBlockLookup::Project { .. })
    }

    pub async fn read(&self, level: usize, id: u64) -> Result<Vec<Interval>> {
        match self {
            LabelBlockLookup::Project { store, group } => {
                let path = join_path(group, &format!("s{level}"));
                Ok(get_attribute_as::<Vec<Interval>>(store.as_ref(), &path, &id.to_string())
                    .await?
                    .unwrap_or_default())
            }
            LabelBlockLookup::Unsupported => Ok(Vec::new()),
        }
    }

    pub async fn write(&self, level: usize, id: u64, intervals: &[Interval]) -> Result<()> {
        match self {
            LabelBlockLookup::Project { store, group } => {
                let path = join_path(group, &format!("s{level}"));
                store
                    .set_attribute(&path, &id.to_string(), serde_json::to_value(intervals)?)
                    .await
            }
            LabelBlockLookup::Unsupported => Ok(()),
        }
    }
}

/// Layout of a new, empty label project
#[derive(Debug, Clone, PartialEq)]
pub struct LabelDatasetLayout {
    pub dimensions: Vec<u64>,
    pub block_size: Vec<u32>,
    pub resolution: [f64; 3],
    pub offset: [f64; 3],
    /// Factors of each level relative to the previous one
    pub relative_scale_factors: Vec<[f64; 3]>,
    /// Multiset entry limit per downsampled level; negative is unbounded
    pub max_num_entries: Vec<i32>,
}

/// Create an empty label multiset project at `group`.
///
/// Fails if `group` already is an array or a project, or if its
/// `unique-labels` group exists, unless `ignore_existing` is set.
pub async fn create_empty_label_dataset(
    store: &dyn ChunkStore,
    group: &str,
    layout: &LabelDatasetLayout,
    ignore_existing: bool,
) -> Result<()> {
    if layout.max_num_entries.len() != layout.relative_scale_factors.len() {
        return Err(VolumeError::configuration(
            group,
            format!(
                "{} scale factors but {} entry limits",
                layout.relative_scale_factors.len(),
                layout.max_num_entries.len()
            ),
        ));
    }
    let unique_labels = join_path(group, UNIQUE_LABELS_GROUP);
    if !ignore_existing {
        if store.is_array(group).await? {
            return Err(VolumeError::configuration(group, "dataset already exists"));
        }
        if store.attributes(group).await?.contains_key(PAINTERA_DATA_KEY) {
            return Err(VolumeError::configuration(group, "group already is a project"));
        }
        if store.exists(&unique_labels).await? {
            return Err(VolumeError::configuration(unique_labels, "unique labels group already exists"));
        }
    }

    let mut root = Map::new();
    root.insert(PAINTERA_DATA_KEY.to_string(), serde_json::to_value(ProjectMarker::label())?);
    root.insert(MAX_ID_KEY.to_string(), json!(1));
    store.set_attributes(group, root).await?;

    let data = join_path(group, PROJECT_DATA_DATASET);
    let mut data_attributes = Map::new();
    data_attributes.insert(MULTI_SCALE_KEY.to_string(), json!(true));
    data_attributes.insert(OFFSET_KEY.to_string(), json!(layout.offset));
    data_attributes.insert(RESOLUTION_KEY.to_string(), json!(layout.resolution));
    data_attributes.insert(IS_LABEL_MULTISET_KEY.to_string(), json!(true));
    store.set_attributes(&data, data_attributes).await?;
    store.set_attribute(&unique_labels, MULTI_SCALE_KEY, json!(true)).await?;

    let compression = CompressionMethod::Gzip { level: -1 };
    let mut dimensions = layout.dimensions.clone();
    let mut accumulated = [1.0f64; 3];
    for level in 0..=layout.relative_scale_factors.len() {
        let name = format!("s{level}");
        let level_path = join_path(&data, &name);
        let unique_path = join_path(&unique_labels, &name);

        let labels = DatasetAttributes::new(
            dimensions.clone(),
            layout.block_size.clone(),
            DataType::LabelMultiset,
            compression,
        );
        let ids = DatasetAttributes::new(dimensions.clone(), layout.block_size.clone(), DataType::Uint64, compression);
        store.create_dataset(&level_path, &labels).await?;
        store.create_dataset(&unique_path, &ids).await?;

        let max_num_entries = if level == 0 { -1 } else { layout.max_num_entries[level - 1] };
        store
            .set_attribute(&level_path, MAX_NUM_ENTRIES_KEY, json!(max_num_entries))
            .await?;
        if level > 0 {
            store
                .set_attribute(&level_path, DOWNSAMPLING_FACTORS_KEY, json!(accumulated))
                .await?;
            store
                .set_attribute(&unique_path, DOWNSAMPLING_FACTORS_KEY, json!(accumulated))
                .await?;
        }

        if let Some(factors) = layout.relative_scale_factors.get(level) {
            for (d, dim) in dimensions.iter_mut().enumerate() {
                let factor = factors.get(d).copied().unwrap_or(1.0);
                *dim = (*dim as f64 / factor).ceil() as u64;
            }
            for d in 0..3 {
                accumulated[d] *= factors[d];
            }
        }
    }
    info!("created empty label project {} with {} levels", group, layout.relative_scale_factors.len() + 1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::N5FileSystem;
    use crate::multiscale::{downsampling_factors, is_multiscale, list_and_sort_scale_datasets};
    use tempfile::TempDir;

    fn layout() -> LabelDatasetLayout {
        LabelDatasetLayout {
            dimensions: vec![625, 625, 125],
            block_size: vec![64, 64, 64],
            resolution: [4.0, 4.0, 40.0],
            offset: [0.0, 0.0, 0.0],
            relative_scale_factors: vec![[2.0, 2.0, 1.0], [2.0, 2.0, 2.0]],
            max_num_entries: vec![-1, 10],
        }
    }

    fn store(temp_dir: &TempDir) -> Arc<dyn ChunkStore> {
        Arc::new(N5FileSystem::new(temp_dir.path()))
    }

    #[tokio::test]
    async fn test_create_empty_label_dataset() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        create_empty_label_dataset(store.as_ref(), "labels", &layout(), false).await.unwrap();

        assert!(is_project_dataset(store.as_ref(), "labels").await.unwrap());
        assert!(is_multiscale(store.as_ref(), "labels/data").await.unwrap());
        assert_eq!(
            list_and_sort_scale_datasets(store.as_ref(), "labels/data").await.unwrap(),
            vec!["s0", "s1", "s2"]
        );

        let s2 = store.dataset_attributes("labels/data/s2").await.unwrap();
        assert_eq!(s2.dimensions, vec![157, 157, 63]);
        assert_eq!(s2.voxel_type(), DataType::LabelMultiset);
        assert_eq!(
            downsampling_factors(store.as_ref(), "labels/data/s2").await.unwrap(),
            [4.0, 4.0, 2.0]
        );
        assert_eq!(
            get_attribute_as::<i32>(store.as_ref(), "labels/data/s2", MAX_NUM_ENTRIES_KEY)
                .await
                .unwrap(),
            Some(10)
        );
        assert!(store.is_array("labels/unique-labels/s1").await.unwrap());

        let err = create_empty_label_dataset(store.as_ref(), "labels", &layout(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::Configuration { .. }));
        create_empty_label_dataset(store.as_ref(), "labels", &layout(), true).await.unwrap();
    }

    #[tokio::test]
    async fn test_assignments_round_trip_through_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        create_empty_label_dataset(store.as_ref(), "labels", &layout(), false).await.unwrap();

        let mut assignment = FragmentSegmentAssignment::load(Arc::clone(&store), "labels").await.unwrap();
        assert!(assignment.is_empty());
        assert_eq!(assignment.lookup(17), 17);
        assignment.assign(17, 100);
        assignment.assign(18, 100);
        assignment.assign(3, 4);
        assignment.persist().await.unwrap();

        let reloaded = FragmentSegmentAssignment::load(Arc::clone(&store), "labels").await.unwrap();
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.lookup(18), 100);
        assert_eq!(reloaded.lookup(3), 4);
    }

    #[tokio::test]
    async fn test_zero_length_persist_leaves_table_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        create_empty_label_dataset(store.as_ref(), "labels", &layout(), false).await.unwrap();

        let mut assignment = FragmentSegmentAssignment::load(Arc::clone(&store), "labels").await.unwrap();
        assignment.assign(5, 6);
        assignment.persist().await.unwrap();

        assignment.unassign(5);
        let err = assignment.persist().await.unwrap_err();
        match err {
            VolumeError::Configuration { path, .. } => {
                assert_eq!(path, "labels/fragment-segment-assignment")
            }
            other => panic!("unexpected error: {other}"),
        }

        let reloaded = FragmentSegmentAssignment::load(Arc::clone(&store), "labels").await.unwrap();
        assert_eq!(reloaded.lookup(5), 6);
    }

    #[tokio::test]
    async fn test_non_project_assignment_cannot_persist() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.create_group("plain").await.unwrap();

        let mut assignment = FragmentSegmentAssignment::load(Arc::clone(&store), "plain").await.unwrap();
        assert!(!assignment.can_persist());
        assignment.assign(1, 2);
        assert!(assignment.persist().await.is_err());
    }

    #[tokio::test]
    async fn test_id_service() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        create_empty_label_dataset(store.as_ref(), "labels", &layout(), false).await.unwrap();

        let ids = IdService::open(Arc::clone(&store), "labels").await.unwrap();
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_ids(3), vec![3, 4, 5]);
        ids.persist().await.unwrap();

        let reopened = IdService::open(Arc::clone(&store), "labels").await.unwrap();
        assert_eq!(reopened.max_id(), 5);

        store.create_group("plain").await.unwrap();
        let err = IdService::open(Arc::clone(&store), "plain").await.err().unwrap();
        assert!(err.to_string().contains("plain#maxId"));
    }

    #[tokio::test]
    async fn test_label_block_lookup() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        create_empty_label_dataset(store.as_ref(), "labels", &layout(), false).await.unwrap();

        let lookup = LabelBlockLookup::open(Arc::clone(&store), "labels").await.unwrap();
        assert!(lookup.is_supported());
        assert!(lookup.read(0, 7).await.unwrap().is_empty());

        let blocks = vec![Interval::new(vec![0, 0, 0], vec![63, 63, 63])];
        lookup.write(1, 7, &blocks).await.unwrap();
        assert_eq!(lookup.read(1, 7).await.unwrap(), blocks);
        assert!(lookup.read(0, 7).await.unwrap().is_empty());

        store.create_group("plain").await.unwrap();
        let unsupported = LabelBlockLookup::open(Arc::clone(&store), "plain").await.unwrap();
        unsupported.write(0, 7, &blocks).await.unwrap();
        assert!(unsupported.read(0, 7).await.unwrap().is_empty());
    }
}
