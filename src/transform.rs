//! Voxel-to-world transforms of pyramid levels

use crate::error::{Result, VolumeError};
use log::debug;
use ndarray::Array2;

/// Axis-aligned voxel-to-world transform: `world = scale * voxel + translation`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldTransform {
    scale: [f64; 3],
    translation: [f64; 3],
}

impl Default for WorldTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl WorldTransform {
    pub fn identity() -> Self {
        Self {
            scale: [1.0; 3],
            translation: [0.0; 3],
        }
    }

    /// Voxel size on the diagonal, world origin as translation
    pub fn from_resolution_and_offset(resolution: [f64; 3], offset: [f64; 3]) -> Self {
        Self {
            scale: resolution,
            translation: offset,
        }
    }

    pub fn scale(&self) -> [f64; 3] {
        self.scale
    }

    pub fn translation(&self) -> [f64; 3] {
        self.translation
    }

    /// Transform of a level downsampled by `factors` relative to a level
    /// with `initial_factors`, keeping voxel centers aligned.
    ///
    /// Per axis the scale is multiplied by `factor / initial` and a voxel
    /// space shift of `0.5 / initial - 0.5 / factor` is applied before it.
    pub fn consider_downsampling(&self, factors: [f64; 3], initial_factors: [f64; 3]) -> Self {
        let mut scale = self.scale;
        let mut translation = self.translation;
        for d in 0..3 {
            scale[d] *= factors[d] / initial_factors[d];
            let shift = 0.5 / initial_factors[d] - 0.5 / factors[d];
            translation[d] += scale[d] * shift;
        }
        let transform = Self { scale, translation };
        debug!(
            "downsampling {:?} relative to {:?}: {:?}",
            factors, initial_factors, transform
        );
        transform
    }

    /// World coordinates of a voxel position
    pub fn apply(&self, voxel: [f64; 3]) -> [f64; 3] {
        std::array::from_fn(|d| self.scale[d] * voxel[d] + self.translation[d])
    }

    /// Voxel position of world coordinates
    pub fn apply_inverse(&self, world: [f64; 3]) -> [f64; 3] {
        std::array::from_fn(|d| (world[d] - self.translation[d]) / self.scale[d])
    }

    /// Scale of `self` relative to `reference`, per axis
    pub fn relative_scales(&self, reference: &WorldTransform) -> [f64; 3] {
        std::array::from_fn(|d| self.scale[d] / reference.scale[d])
    }

    /// Row-major 3x4 affine matrix
    pub fn to_matrix(&self) -> Array2<f64> {
        let mut matrix = Array2::zeros((3, 4));
        for d in 0..3 {
            matrix[[d, d]] = self.scale[d];
            matrix[[d, 3]] = self.translation[d];
        }
        matrix
    }
}

/// Interpret a spatial attribute as exactly three values
pub fn as_vec3(values: &[f64], path: &str, key: &str) -> Result<[f64; 3]> {
    <[f64; 3]>::try_from(values).map_err(|_| {
        VolumeError::configuration(
            format!("{path}#{key}"),
            format!("expected 3 values, found {}", values.len()),
        )
    })
}
