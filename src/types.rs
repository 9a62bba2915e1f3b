//! Core data types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar types of an N5 dataset, plus the label multiset representation
/// which is stored as `uint8` bytes and flagged by an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    /// Several ids with occupancy counts per voxel
    #[serde(skip)]
    LabelMultiset,
}

impl DataType {
    /// Size in bytes of one stored element
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Uint8 | DataType::Int8 | DataType::LabelMultiset => 1,
            DataType::Uint16 | DataType::Int16 => 2,
            DataType::Uint32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::Uint64 | DataType::Int64 | DataType::Float64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            DataType::Uint8 | DataType::Uint16 | DataType::Uint32 | DataType::Uint64
        )
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64
        )
    }

    /// Types whose voxels can be interpreted as label ids
    pub fn is_label(&self) -> bool {
        self.is_unsigned() || self.is_signed() || *self == DataType::LabelMultiset
    }

    /// Name written to the N5 `dataType` attribute
    pub fn n5_name(&self) -> &'static str {
        match self {
            DataType::Uint8 | DataType::LabelMultiset => "uint8",
            DataType::Uint16 => "uint16",
            DataType::Uint32 => "uint32",
            DataType::Uint64 => "uint64",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::LabelMultiset => write!(f, "label-multiset"),
            other => write!(f, "{}", other.n5_name()),
        }
    }
}

/// Reserved label ids
pub struct Label;

impl Label {
    /// Background / no label
    pub const BACKGROUND: u64 = 0;
    /// Invalid id, never assigned to a segment
    pub const INVALID: u64 = u64::MAX;

    pub fn is_foreground(id: u64) -> bool {
        id != Self::BACKGROUND && id != Self::INVALID
    }
}

/// Kind of node found in a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    /// Single N5 array
    Array,
    /// Group of `s<N>` scale arrays
    Multiscale,
    /// Group bundling data, assignments and id counter
    Project,
    /// Plain group that may contain datasets further down
    Group,
}

impl DatasetKind {
    /// Leaf kinds are openable datasets; discovery stops descending at them.
    pub fn is_leaf(&self) -> bool {
        !matches!(self, DatasetKind::Group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::Uint8.size_in_bytes(), 1);
        assert_eq!(DataType::Uint16.size_in_bytes(), 2);
        assert_eq!(DataType::Float32.size_in_bytes(), 4);
        assert_eq!(DataType::Uint64.size_in_bytes(), 8);
        assert_eq!(DataType::LabelMultiset.size_in_bytes(), 1);
    }

    #[test]
    fn test_n5_names() {
        for name in ["uint8", "uint16", "uint32", "uint64", "int8", "int64", "float32", "float64"] {
            let data_type: DataType = serde_json::from_value(serde_json::json!(name)).unwrap();
            assert_eq!(data_type.n5_name(), name);
            assert_eq!(data_type.to_string(), name);
        }
        assert!(serde_json::from_value::<DataType>(serde_json::json!("complex64")).is_err());
        assert_eq!(DataType::LabelMultiset.n5_name(), "uint8");
        assert_eq!(DataType::LabelMultiset.to_string(), "label-multiset");
    }

    #[test]
    fn test_label_types() {
        assert!(DataType::Uint64.is_label());
        assert!(DataType::LabelMultiset.is_label());
        assert!(!DataType::Float32.is_label());
    }

    #[test]
    fn test_reserved_labels() {
        assert!(!Label::is_foreground(Label::BACKGROUND));
        assert!(!Label::is_foreground(Label::INVALID));
        assert!(Label::is_foreground(42));
    }
}
