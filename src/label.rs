//! Label multisets and per-voxel id-set masks
//!
//! A [`MaskGenerator`] is picked once per scale level when a dataset is opened.
//! For every change of the highlighted id set it hands out a cheap
//! [`LabelMaskEvaluator`] that turns label voxels into booleans.

use crate::chunk::{Chunk, ChunkData};
use crate::error::{Result, VolumeError};
use crate::types::DataType;
use log::trace;
use ndarray::ArrayD;
use std::collections::HashSet;
use std::sync::Arc;

const INTEGER_SCALE_TOLERANCE: f64 = 1e-7;

/// Ids present in one voxel with their occupancy counts, sorted by id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelMultiset {
    entries: Vec<(u64, u32)>,
}

impl LabelMultiset {
    /// Build from arbitrary `(id, count)` pairs; duplicate ids are merged and
    /// zero counts dropped.
    pub fn new(entries: impl IntoIterator<Item = (u64, u32)>) -> Self {
        let mut entries: Vec<(u64, u32)> = entries.into_iter().filter(|&(_, c)| c > 0).collect();
        entries.sort_unstable_by_key(|&(id, _)| id);
        let mut merged: Vec<(u64, u32)> = Vec::with_capacity(entries.len());
        for (id, count) in entries {
            match merged.last_mut() {
                Some((last, total)) if *last == id => *total = total.saturating_add(count),
                _ => merged.push((id, count)),
            }
        }
        Self { entries: merged }
    }

    /// Multiset holding a single id once
    pub fn singleton(id: u64) -> Self {
        Self {
            entries: vec![(id, 1)],
        }
    }

    pub fn entries(&self) -> &[(u64, u32)] {
        &self.entries
    }

    /// Number of distinct ids
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.binary_search_by_key(&id, |&(i, _)| i).is_ok()
    }

    pub fn count(&self, id: u64) -> u32 {
        self.entries
            .binary_search_by_key(&id, |&(i, _)| i)
            .map(|pos| self.entries[pos].1)
            .unwrap_or(0)
    }

    /// Sum of all occupancy counts
    pub fn total_count(&self) -> u64 {
        self.entries.iter().map(|&(_, c)| c as u64).sum()
    }

    /// Id with the highest count; ties go to the smaller id.
    pub fn argmax(&self) -> Option<u64> {
        self.entries
            .iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|&(id, _)| id)
    }
}

/// Set of highlighted ids with an optional minimum occupancy ratio
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LabelQuery {
    ids: HashSet<u64>,
    min_ratio: Option<f64>,
}

impl LabelQuery {
    pub fn new(ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            min_ratio: None,
        }
    }

    pub fn with_min_ratio(mut self, min_ratio: f64) -> Self {
        self.min_ratio = Some(min_ratio);
        self
    }

    pub fn ids(&self) -> &HashSet<u64> {
        &self.ids
    }

    pub fn min_ratio(&self) -> Option<f64> {
        self.min_ratio
    }

    pub fn contains(&self, id: u64) -> bool {
        self.ids.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Mask construction strategy for one scale level, fixed at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskGenerator {
    Scalar,
    Multiset {
        /// Full-resolution voxels represented by one voxel of this level
        num_full_res_voxels: u64,
    },
}

impl MaskGenerator {
    /// Pick the generator for a level from its voxel type and its scale
    /// relative to level 0. Non-integer relative scales are a configuration
    /// error for multiset data.
    pub fn for_level(voxel_type: DataType, relative_scales: &[f64], path: &str) -> Result<Self> {
        match voxel_type {
            DataType::LabelMultiset => Ok(MaskGenerator::Multiset {
                num_full_res_voxels: num_full_res_voxels(relative_scales, path)?,
            }),
            t if t.is_label() => Ok(MaskGenerator::Scalar),
            t => Err(VolumeError::configuration(
                path,
                format!("data type {t} cannot be evaluated as labels"),
            )),
        }
    }

    pub fn evaluator(&self, query: Arc<LabelQuery>) -> LabelMaskEvaluator {
        match *self {
            MaskGenerator::Scalar => LabelMaskEvaluator::Scalar { query },
            MaskGenerator::Multiset {
                num_full_res_voxels,
            } => match query.min_ratio {
                Some(min_ratio) if min_ratio > 0.0 => LabelMaskEvaluator::Ratio {
                    query,
                    min_ratio,
                    num_full_res_voxels,
                },
                _ => LabelMaskEvaluator::Presence { query },
            },
        }
    }
}

fn num_full_res_voxels(relative_scales: &[f64], path: &str) -> Result<u64> {
    relative_scales.iter().try_fold(1u64, |acc, &scale| {
        let rounded = scale.round();
        if (scale - rounded).abs() > INTEGER_SCALE_TOLERANCE || rounded < 1.0 {
            return Err(VolumeError::configuration(
                path,
                format!("accumulated downsampling factor {scale} is not a positive integer"),
            ));
        }
        acc.checked_mul(rounded as u64).ok_or_else(|| {
            VolumeError::configuration(path, "accumulated downsampling factors overflow")
        })
    })
}

/// Decides per voxel whether it belongs to the queried id set
#[derive(Debug, Clone)]
pub enum LabelMaskEvaluator {
    /// Scalar id voxels: membership test
    Scalar { query: Arc<LabelQuery> },
    /// Multiset voxels: any query id present
    Presence { query: Arc<LabelQuery> },
    /// Multiset voxels: occupancy of query ids over full-resolution voxels
    Ratio {
        query: Arc<LabelQuery>,
        min_ratio: f64,
        num_full_res_voxels: u64,
    },
}

impl LabelMaskEvaluator {
    pub fn query(&self) -> &LabelQuery {
        match self {
            LabelMaskEvaluator::Scalar { query }
            | LabelMaskEvaluator::Presence { query }
            | LabelMaskEvaluator::Ratio { query, .. } => query,
        }
    }

    /// Evaluate a scalar id voxel
    pub fn matches_id(&self, id: u64) -> bool {
        self.query().contains(id)
    }

    /// Evaluate a multiset voxel
    pub fn matches_multiset(&self, voxel: &LabelMultiset) -> bool {
        match self {
            LabelMaskEvaluator::Scalar { query } | LabelMaskEvaluator::Presence { query } => {
                any_present(query, voxel)
            }
            LabelMaskEvaluator::Ratio {
                query,
                min_ratio,
                num_full_res_voxels,
            } => {
                let contained: u64 = query.ids().iter().map(|&id| voxel.count(id) as u64).sum();
                contained > 0 && contained as f64 / *num_full_res_voxels as f64 >= *min_ratio
            }
        }
    }

    /// Boolean mask over a whole chunk, in the chunk's own layout
    pub fn mask_chunk(&self, chunk: &Chunk) -> Result<ArrayD<bool>> {
        match (self, chunk.data()) {
            (LabelMaskEvaluator::Scalar { .. }, ChunkData::Unsigned(ids)) => {
                Ok(ids.mapv(|id| self.matches_id(id)))
            }
            (LabelMaskEvaluator::Scalar { .. }, ChunkData::Signed(ids)) => {
                Ok(ids.mapv(|id| self.matches_id(id as u64)))
            }
            (
                LabelMaskEvaluator::Presence { .. } | LabelMaskEvaluator::Ratio { .. },
                ChunkData::Multiset { lists, index },
            ) => {
                // evaluate each distinct list once, voxels share them
                let per_list: Vec<bool> = lists.iter().map(|l| self.matches_multiset(l)).collect();
                Ok(index.mapv(|i| per_list[i as usize]))
            }
            (_, other) => Err(VolumeError::TypeMismatch {
                expected: self.expected_data().to_string(),
                found: other.kind().to_string(),
            }),
        }
    }

    fn expected_data(&self) -> &'static str {
        match self {
            LabelMaskEvaluator::Scalar { .. } => "integer ids",
            _ => "label multisets",
        }
    }
}

/// Iterate the smaller side and look ids up in the other.
fn any_present(query: &LabelQuery, voxel: &LabelMultiset) -> bool {
    trace!(
        "input size={}, query size={}",
        voxel.len(),
        query.ids().len()
    );
    if query.ids().len() < voxel.len() {
        query.ids().iter().any(|&id| voxel.contains(id))
    } else {
        voxel.entries().iter().any(|&(id, _)| query.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(ids: &[u64]) -> LabelMaskEvaluator {
        MaskGenerator::Multiset {
            num_full_res_voxels: 8,
        }
        .evaluator(Arc::new(LabelQuery::new(ids.iter().copied())))
    }

    #[test]
    fn test_multiset_merges_duplicates() {
        let multiset = LabelMultiset::new([(7, 1), (5, 3), (7, 2), (9, 0)]);
        assert_eq!(multiset.entries(), &[(5, 3), (7, 3)]);
        assert_eq!(multiset.count(7), 3);
        assert_eq!(multiset.count(9), 0);
        assert_eq!(multiset.total_count(), 6);
        assert_eq!(multiset.argmax(), Some(5));
    }

    #[test]
    fn test_presence_mode() {
        let voxel = LabelMultiset::new([(5, 3), (7, 1)]);
        assert!(presence(&[7, 9]).matches_multiset(&voxel));
        assert!(!presence(&[1, 2]).matches_multiset(&voxel));
    }

    #[test]
    fn test_presence_mode_iterates_either_side() {
        let voxel = LabelMultiset::new([(1, 1), (2, 1), (3, 1), (4, 1)]);
        assert!(presence(&[4]).matches_multiset(&voxel));
        let big_query: Vec<u64> = (100..200).chain([2]).collect();
        assert!(presence(&big_query).matches_multiset(&voxel));
        assert!(!presence(&(100..200).collect::<Vec<_>>()).matches_multiset(&voxel));
    }

    #[test]
    fn test_ratio_mode() {
        let voxel = LabelMultiset::new([(5, 6), (7, 2)]);
        let generator = MaskGenerator::Multiset {
            num_full_res_voxels: 8,
        };
        let strict = generator.evaluator(Arc::new(LabelQuery::new([7]).with_min_ratio(0.3)));
        assert!(!strict.matches_multiset(&voxel));
        let lenient = generator.evaluator(Arc::new(LabelQuery::new([7]).with_min_ratio(0.2)));
        assert!(lenient.matches_multiset(&voxel));
    }

    #[test]
    fn test_non_positive_ratio_falls_back_to_presence() {
        let generator = MaskGenerator::Multiset {
            num_full_res_voxels: 8,
        };
        let evaluator = generator.evaluator(Arc::new(LabelQuery::new([7]).with_min_ratio(0.0)));
        assert!(matches!(evaluator, LabelMaskEvaluator::Presence { .. }));
    }

    #[test]
    fn test_scalar_mask() {
        let evaluator =
            MaskGenerator::Scalar.evaluator(Arc::new(LabelQuery::new([3, 4]).with_min_ratio(0.5)));
        assert!(evaluator.matches_id(3));
        assert!(!evaluator.matches_id(5));
    }

    #[test]
    fn test_generator_for_level() {
        let generator =
            MaskGenerator::for_level(DataType::LabelMultiset, &[2.0, 2.0, 1.0], "s1").unwrap();
        assert_eq!(
            generator,
            MaskGenerator::Multiset {
                num_full_res_voxels: 4
            }
        );
        assert_eq!(
            MaskGenerator::for_level(DataType::Uint32, &[2.0, 2.0, 1.0], "s1").unwrap(),
            MaskGenerator::Scalar
        );
        assert!(MaskGenerator::for_level(DataType::Float32, &[1.0; 3], "raw").is_err());
    }

    #[test]
    fn test_non_integer_scale_is_configuration_error() {
        let err = MaskGenerator::for_level(DataType::LabelMultiset, &[1.5, 2.0, 1.0], "labels/s1")
            .unwrap_err();
        assert!(matches!(err, VolumeError::Configuration { ref path, .. } if path == "labels/s1"));
    }
}
