//! Work partitioning across the parallel units
//!
//! A problem of `rows x cols` elements is cut into at most [`MAX_UNITS`]
//! rectangular tiles. Tile edges fall on multiples of the kernel's tile
//! granularity except on the last tile of each axis, which absorbs the
//! remainder. Tiles are numbered row-major; the number is the unit's thread
//! index.

use crate::launch::MAX_UNITS;

/// Column divisions tried in order; the first one the column extent can fill wins
const COLUMN_DIVISIONS: [usize; 5] = [6, 4, 3, 2, 1];

/// Per-unit tile granularity of a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGranularity {
    pub rows: usize,
    pub cols: usize,
}

impl TileGranularity {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }
}

/// The part of the problem one unit works on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Thread index of the unit
    pub index: usize,
    pub row0: usize,
    pub rows: usize,
    pub col0: usize,
    pub cols: usize,
}

/// Tiling of one kernel invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    row_divisions: usize,
    col_divisions: usize,
    tiles: Vec<Tile>,
}

impl PartitionPlan {
    /// Two-dimensional tiling
    ///
    /// Column divisions come from the fixed table 6, 4, 3, 2, 1; row divisions
    /// start at `MAX_UNITS / column divisions` and step down while the rows
    /// cannot fill them, falling back to one.
    pub fn grid(rows: usize, cols: usize, granularity: TileGranularity) -> Self {
        let (row_divisions, col_divisions) = choose_divisions(rows, cols, granularity);
        let row_spans = split_axis(rows, granularity.rows, row_divisions);
        let col_spans = split_axis(cols, granularity.cols, col_divisions);

        let mut tiles = Vec::with_capacity(row_divisions * col_divisions);
        for &(row0, nrows) in &row_spans {
            for &(col0, ncols) in &col_spans {
                tiles.push(Tile {
                    index: tiles.len(),
                    row0,
                    rows: nrows,
                    col0,
                    cols: ncols,
                });
            }
        }
        Self {
            row_divisions,
            col_divisions,
            tiles,
        }
    }

    /// Row slabs spanning every column
    ///
    /// Each unit gets at least `row_granularity` rows.
    pub fn row_slabs(rows: usize, cols: usize, row_granularity: usize) -> Self {
        let divisions = (rows / row_granularity).clamp(1, MAX_UNITS);
        let tiles = split_axis(rows, row_granularity, divisions)
            .into_iter()
            .enumerate()
            .map(|(index, (row0, nrows))| Tile {
                index,
                row0,
                rows: nrows,
                col0: 0,
                cols,
            })
            .collect();
        Self {
            row_divisions: divisions,
            col_divisions: 1,
            tiles,
        }
    }

    /// One-dimensional tiling of `len` elements in chunks of `chunk`
    ///
    /// Each unit gets at least `min_chunks` chunks.
    pub fn linear(len: usize, chunk: usize, min_chunks: usize) -> Self {
        let divisions = (len / (chunk * min_chunks.max(1))).clamp(1, MAX_UNITS);
        let tiles = split_axis(len, chunk, divisions)
            .into_iter()
            .enumerate()
            .map(|(index, (col0, ncols))| Tile {
                index,
                row0: 0,
                rows: 1,
                col0,
                cols: ncols,
            })
            .collect();
        Self {
            row_divisions: 1,
            col_divisions: divisions,
            tiles,
        }
    }

    pub fn unit_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_single_unit(&self) -> bool {
        self.tiles.len() == 1
    }

    pub fn divisions(&self) -> (usize, usize) {
        (self.row_divisions, self.col_divisions)
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }
}

/// Row and column division counts for a `rows x cols` problem
pub fn choose_divisions(rows: usize, cols: usize, granularity: TileGranularity) -> (usize, usize) {
    let col_divisions = COLUMN_DIVISIONS
        .iter()
        .copied()
        .find(|&d| cols >= d * granularity.cols)
        .unwrap_or(1);

    let mut row_divisions = MAX_UNITS / col_divisions;
    while row_divisions >= 2 && rows < row_divisions * granularity.rows {
        row_divisions -= 1;
    }
    (row_divisions.max(1), col_divisions)
}

/// Split `extent` into `divisions` spans of `(start, len)`
///
/// With `blocks = extent / granularity` and `h = ceil(blocks / divisions)`,
/// the first `divisions - (h * divisions - blocks)` spans get `h` blocks,
/// the others `h - 1`, and the last span takes whatever is left.
pub fn split_axis(extent: usize, granularity: usize, divisions: usize) -> Vec<(usize, usize)> {
    let blocks = extent / granularity.max(1);
    let divisions = divisions.min(blocks);
    if divisions <= 1 {
        return vec![(0, extent)];
    }
    let h = blocks.div_ceil(divisions);
    let long_spans = divisions - (h * divisions - blocks);

    let mut spans = Vec::with_capacity(divisions);
    let mut start = 0;
    for i in 0..divisions {
        let len = if i == divisions - 1 {
            extent - start
        } else if i < long_spans {
            h * granularity
        } else {
            (h - 1) * granularity
        };
        spans.push((start, len));
        start += len;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEMM: TileGranularity = TileGranularity::new(16, 64);

    #[test]
    fn test_division_policy_thresholds() {
        assert_eq!(choose_divisions(96, 3072, GEMM), (2, 6));
        assert_eq!(choose_divisions(16, 3072, GEMM), (1, 6));
        assert_eq!(choose_divisions(1024, 256, GEMM), (3, 4));
        assert_eq!(choose_divisions(1024, 255, GEMM), (4, 3));
        assert_eq!(choose_divisions(1024, 128, GEMM), (6, 2));
        assert_eq!(choose_divisions(1024, 64, GEMM), (12, 1));
        assert_eq!(choose_divisions(15, 63, GEMM), (1, 1));
        assert_eq!(choose_divisions(47, 63, GEMM), (2, 1));
    }

    #[test]
    fn test_split_axis_uneven() {
        // 5 blocks over 4 divisions: h = 2, one long span
        assert_eq!(
            split_axis(5 * 16 + 3, 16, 4),
            vec![(0, 32), (32, 16), (48, 16), (64, 19)]
        );
        assert_eq!(split_axis(100, 16, 1), vec![(0, 100)]);
    }

    #[test]
    fn test_grid_row_major_numbering() {
        let plan = PartitionPlan::grid(96, 3072, GEMM);
        assert_eq!(plan.unit_count(), 12);
        assert_eq!(plan.divisions(), (2, 6));
        let tile = plan.tiles()[7];
        assert_eq!(tile.index, 7);
        assert_eq!((tile.row0, tile.rows), (48, 48));
        assert_eq!((tile.col0, tile.cols), (512, 512));
    }

    #[test]
    fn test_small_problem_is_single_unit() {
        let plan = PartitionPlan::grid(8, 8, GEMM);
        assert!(plan.is_single_unit());
        assert_eq!(plan.tiles()[0].rows, 8);
        assert_eq!(plan.tiles()[0].cols, 8);
    }

    #[test]
    fn test_linear_respects_minimum_chunks() {
        assert!(PartitionPlan::linear(1536, 768, 2).is_single_unit());
        assert_eq!(PartitionPlan::linear(768 * 24, 768, 2).unit_count(), 12);
        assert_eq!(PartitionPlan::linear(4096, 4096, 1).unit_count(), 1);
        let plan = PartitionPlan::linear(4096 * 30, 4096, 1);
        assert_eq!(plan.unit_count(), 12);
        assert!(plan.tiles().iter().all(|t| t.cols % 4096 == 0));
    }

    #[test]
    fn test_row_slabs_cover_rows() {
        let plan = PartitionPlan::row_slabs(48, 80, 16);
        assert_eq!(plan.unit_count(), 3);
        assert!(plan.tiles().iter().all(|t| t.rows == 16 && t.cols == 80));
    }
}
