//! N5 metadata structures and well-known attribute keys

use crate::compression::CompressionMethod;
use crate::error::{Result, VolumeError};
use crate::layout::CellGrid;
use crate::types::DataType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MULTI_SCALE_KEY: &str = "multiScale";
pub const PAINTERA_DATA_KEY: &str = "painteraData";
pub const MAX_ID_KEY: &str = "maxId";
pub const RESOLUTION_KEY: &str = "resolution";
pub const OFFSET_KEY: &str = "offset";
pub const DOWNSAMPLING_FACTORS_KEY: &str = "downsamplingFactors";
pub const MAX_NUM_ENTRIES_KEY: &str = "maxNumEntries";
pub const IS_LABEL_MULTISET_KEY: &str = "isLabelMultiset";
pub const N5_VERSION_KEY: &str = "n5";

/// Sub-paths of a composite project dataset
pub const PROJECT_DATA_DATASET: &str = "data";
pub const FRAGMENT_SEGMENT_ASSIGNMENT_DATASET: &str = "fragment-segment-assignment";
pub const LABEL_TO_BLOCK_MAPPING: &str = "label-to-block-mapping";
pub const UNIQUE_LABELS_GROUP: &str = "unique-labels";

const DIMENSIONS_KEY: &str = "dimensions";
const BLOCK_SIZE_KEY: &str = "blockSize";
const DATA_TYPE_KEY: &str = "dataType";
const COMPRESSION_KEY: &str = "compression";

/// Attributes that make an N5 node an array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetAttributes {
    pub dimensions: Vec<u64>,
    pub block_size: Vec<u32>,
    pub data_type: DataType,
    #[serde(default)]
    pub compression: CompressionMethod,
    /// Set on label multiset arrays, which are stored as `uint8`
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_label_multiset: bool,
}

impl DatasetAttributes {
    pub fn new(
        dimensions: Vec<u64>,
        block_size: Vec<u32>,
        data_type: DataType,
        compression: CompressionMethod,
    ) -> Self {
        let is_label_multiset = data_type == DataType::LabelMultiset;
        Self {
            dimensions,
            block_size,
            data_type: if is_label_multiset {
                DataType::Uint8
            } else {
                data_type
            },
            compression,
            is_label_multiset,
        }
    }

    /// Whether a raw attribute map describes an array
    pub fn is_dataset(attributes: &Map<String, Value>) -> bool {
        attributes.contains_key(DIMENSIONS_KEY)
            && attributes.contains_key(BLOCK_SIZE_KEY)
            && attributes.contains_key(DATA_TYPE_KEY)
    }

    /// Parse from the raw attribute map of a node
    pub fn from_attributes(path: &str, attributes: &Map<String, Value>) -> Result<Self> {
        if !Self::is_dataset(attributes) {
            return Err(VolumeError::configuration(path, "not an N5 dataset"));
        }
        let mut object = Map::new();
        for key in [DIMENSIONS_KEY, BLOCK_SIZE_KEY, DATA_TYPE_KEY, COMPRESSION_KEY] {
            if let Some(value) = attributes.get(key) {
                object.insert(key.to_string(), value.clone());
            }
        }
        let mut parsed: DatasetAttributes = serde_json::from_value(Value::Object(object))
            .map_err(|e| VolumeError::configuration(path, e.to_string()))?;
        parsed.is_label_multiset = attributes
            .get(IS_LABEL_MULTISET_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        parsed.validate(path)?;
        Ok(parsed)
    }

    /// Attribute entries to merge into a node's `attributes.json`
    pub fn to_attributes(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(VolumeError::Serialization(format!(
                "dataset attributes serialized to {other}"
            ))),
        }
    }

    fn validate(&self, path: &str) -> Result<()> {
        if self.dimensions.len() != self.block_size.len() {
            return Err(VolumeError::configuration(
                path,
                format!(
                    "rank mismatch: {} dimensions, {} block sizes",
                    self.dimensions.len(),
                    self.block_size.len()
                ),
            ));
        }
        if self.block_size.iter().any(|&b| b == 0) {
            return Err(VolumeError::configuration(path, "block size must be positive"));
        }
        Ok(())
    }

    /// Effective voxel representation
    pub fn voxel_type(&self) -> DataType {
        if self.is_label_multiset {
            DataType::LabelMultiset
        } else {
            self.data_type
        }
    }

    pub fn cell_grid(&self) -> CellGrid {
        CellGrid::new(
            self.dimensions.clone(),
            self.block_size.iter().map(|&b| b as u64).collect(),
        )
    }
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Value of the `painteraData` marker of a project group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMarker {
    #[serde(rename = "type")]
    pub kind: String,
}

impl ProjectMarker {
    pub fn label() -> Self {
        Self {
            kind: "label".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_n5_attributes() {
        let raw = json!({
            "dimensions": [625, 625, 125],
            "blockSize": [64, 64, 64],
            "dataType": "uint64",
            "compression": {"type": "gzip", "level": -1},
            "resolution": [4.0, 4.0, 40.0]
        });
        let attrs = DatasetAttributes::from_attributes("s1", raw.as_object().unwrap()).unwrap();
        assert_eq!(attrs.dimensions, vec![625, 625, 125]);
        assert_eq!(attrs.block_size, vec![64, 64, 64]);
        assert_eq!(attrs.voxel_type(), DataType::Uint64);
        assert_eq!(attrs.compression, CompressionMethod::Gzip { level: -1 });
    }

    #[test]
    fn test_label_multiset_flag() {
        let raw = json!({
            "dimensions": [10, 10, 10],
            "blockSize": [5, 5, 5],
            "dataType": "uint8",
            "isLabelMultiset": true
        });
        let attrs = DatasetAttributes::from_attributes("s0", raw.as_object().unwrap()).unwrap();
        assert_eq!(attrs.voxel_type(), DataType::LabelMultiset);
        assert_eq!(attrs.compression, CompressionMethod::Raw);
    }

    #[test]
    fn test_rank_mismatch_is_configuration_error() {
        let raw = json!({
            "dimensions": [10, 10],
            "blockSize": [5, 5, 5],
            "dataType": "uint8"
        });
        let err = DatasetAttributes::from_attributes("broken", raw.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, VolumeError::Configuration { ref path, .. } if path == "broken"));
    }

    #[test]
    fn test_to_attributes_round_trip_keys() {
        let attrs = DatasetAttributes::new(
            vec![8, 8, 8],
            vec![4, 4, 4],
            DataType::LabelMultiset,
            CompressionMethod::Raw,
        );
        let map = attrs.to_attributes().unwrap();
        assert_eq!(map["dataType"], json!("uint8"));
        assert_eq!(map["isLabelMultiset"], json!(true));
        assert_eq!(map["blockSize"], json!([4, 4, 4]));
    }
}
