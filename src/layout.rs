//! Cell grid - how an array is divided into fixed-size cells

use serde::{Deserialize, Serialize};

/// Immutable shape description of one chunked array.
///
/// Cells are linearized with dimension 0 varying fastest, matching the
/// column-major convention of N5 containers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellGrid {
    dimensions: Vec<u64>,
    cell_dimensions: Vec<u64>,
}

impl CellGrid {
    /// Panics if ranks differ or a cell dimension is zero; callers validate
    /// container metadata before building a grid.
    pub fn new(dimensions: Vec<u64>, cell_dimensions: Vec<u64>) -> Self {
        assert_eq!(
            dimensions.len(),
            cell_dimensions.len(),
            "grid rank mismatch"
        );
        assert!(
            cell_dimensions.iter().all(|&c| c > 0),
            "cell dimensions must be positive"
        );
        Self {
            dimensions,
            cell_dimensions,
        }
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    pub fn dimensions(&self) -> &[u64] {
        &self.dimensions
    }

    pub fn cell_dimensions(&self) -> &[u64] {
        &self.cell_dimensions
    }

    /// Number of cells along each dimension
    pub fn grid_dimensions(&self) -> Vec<u64> {
        self.dimensions
            .iter()
            .zip(&self.cell_dimensions)
            .map(|(&d, &c)| d.div_ceil(c))
            .collect()
    }

    pub fn num_cells(&self) -> u64 {
        self.grid_dimensions().iter().product()
    }

    /// Linear cell index to grid position
    pub fn cell_position(&self, index: u64) -> Vec<u64> {
        let grid = self.grid_dimensions();
        let mut remaining = index;
        grid.iter()
            .map(|&g| {
                let p = remaining % g.max(1);
                remaining /= g.max(1);
                p
            })
            .collect()
    }

    /// Grid position to linear cell index
    pub fn cell_index(&self, position: &[u64]) -> u64 {
        let grid = self.grid_dimensions();
        let mut index = 0;
        let mut stride = 1;
        for (&p, &g) in position.iter().zip(&grid) {
            index += p * stride;
            stride *= g;
        }
        index
    }

    /// Voxel-space origin of a cell
    pub fn cell_min(&self, position: &[u64]) -> Vec<u64> {
        position
            .iter()
            .zip(&self.cell_dimensions)
            .map(|(&p, &c)| p * c)
            .collect()
    }

    /// Size of a cell, clipped at the array border
    pub fn cell_size(&self, position: &[u64]) -> Vec<u64> {
        position
            .iter()
            .enumerate()
            .map(|(d, &p)| {
                let start = p * self.cell_dimensions[d];
                (start + self.cell_dimensions[d]).min(self.dimensions[d]) - start
            })
            .collect()
    }

    pub fn contains_cell(&self, position: &[u64]) -> bool {
        position.len() == self.rank()
            && position
                .iter()
                .zip(self.grid_dimensions())
                .all(|(&p, g)| p < g)
    }

    /// Cell containing a voxel position
    pub fn cell_of_voxel(&self, voxel: &[u64]) -> Vec<u64> {
        voxel
            .iter()
            .zip(&self.cell_dimensions)
            .map(|(&v, &c)| v / c)
            .collect()
    }

    /// Whether voxel coordinates are within bounds
    pub fn is_in_bounds(&self, voxel: &[u64]) -> bool {
        voxel.len() == self.rank()
            && voxel
                .iter()
                .zip(&self.dimensions)
                .all(|(&v, &d)| v < d)
    }

    /// All cell positions overlapping the half-open voxel box `[min, max)`
    pub fn cells_in_box(&self, min: &[u64], max: &[u64]) -> Vec<Vec<u64>> {
        if min.iter().zip(max).any(|(&lo, &hi)| lo >= hi) {
            return Vec::new();
        }
        let first = self.cell_of_voxel(min);
        let last: Vec<u64> = max
            .iter()
            .zip(&self.cell_dimensions)
            .map(|(&hi, &c)| (hi - 1) / c)
            .collect();

        let mut cells = Vec::new();
        let mut current = first.clone();
        loop {
            cells.push(current.clone());
            let mut d = 0;
            loop {
                if d == current.len() {
                    return cells;
                }
                current[d] += 1;
                if current[d] <= last[d] {
                    break;
                }
                current[d] = first[d];
                d += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> CellGrid {
        CellGrid::new(vec![1000, 800, 500], vec![64, 64, 64])
    }

    #[test]
    fn test_grid_dimensions() {
        assert_eq!(grid().grid_dimensions(), vec![16, 13, 8]);
        assert_eq!(grid().num_cells(), 16 * 13 * 8);
    }

    #[test]
    fn test_index_conversion() {
        let grid = grid();
        let position = vec![5, 7, 3];
        let index = grid.cell_index(&position);
        assert_eq!(index, 5 + 7 * 16 + 3 * 16 * 13);
        assert_eq!(grid.cell_position(index), position);
    }

    #[test]
    fn test_edge_cells_are_clipped() {
        let grid = grid();
        assert_eq!(grid.cell_min(&[0, 0, 0]), vec![0, 0, 0]);
        assert_eq!(grid.cell_size(&[0, 0, 0]), vec![64, 64, 64]);
        assert_eq!(grid.cell_min(&[15, 12, 7]), vec![960, 768, 448]);
        assert_eq!(grid.cell_size(&[15, 12, 7]), vec![40, 32, 52]);
    }

    #[test]
    fn test_cells_in_box() {
        let grid = CellGrid::new(vec![10, 10], vec![4, 4]);
        let cells = grid.cells_in_box(&[3, 0], &[5, 4]);
        assert_eq!(cells, vec![vec![0, 0], vec![1, 0]]);
        assert!(grid.cells_in_box(&[2, 2], &[2, 5]).is_empty());
    }

    #[test]
    fn test_is_in_bounds() {
        let grid = grid();
        assert!(grid.is_in_bounds(&[999, 799, 499]));
        assert!(!grid.is_in_bounds(&[1000, 0, 0]));
        assert!(grid.contains_cell(&[15, 12, 7]));
        assert!(!grid.contains_cell(&[16, 0, 0]));
    }
}
