//! Property tests for work partitioning

use proptest::prelude::*;
use qpuforge::kernels::partition::{split_axis, PartitionPlan, TileGranularity};
use qpuforge::MAX_UNITS;

fn granularity() -> impl Strategy<Value = TileGranularity> {
    prop_oneof![
        Just(TileGranularity::new(16, 64)),
        Just(TileGranularity::new(64, 16)),
        (1usize..80, 1usize..80).prop_map(|(r, c)| TileGranularity::new(r, c)),
    ]
}

/// Every element covered exactly once
fn assert_exact_cover(plan: &PartitionPlan, rows: usize, cols: usize) {
    let mut hits = vec![0u8; rows * cols];
    for tile in plan.tiles() {
        for i in tile.row0..tile.row0 + tile.rows {
            for j in tile.col0..tile.col0 + tile.cols {
                hits[i * cols + j] += 1;
            }
        }
    }
    assert!(hits.iter().all(|&h| h == 1));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn grid_covers_problem_exactly(
        rows in 1usize..400,
        cols in 1usize..800,
        granularity in granularity(),
    ) {
        let plan = PartitionPlan::grid(rows, cols, granularity);
        prop_assert!(plan.unit_count() >= 1);
        prop_assert!(plan.unit_count() <= MAX_UNITS);
        let (row_divisions, col_divisions) = plan.divisions();
        prop_assert!(row_divisions * col_divisions >= plan.unit_count());
        assert_exact_cover(&plan, rows, cols);

        for (index, tile) in plan.tiles().iter().enumerate() {
            prop_assert_eq!(tile.index, index);
            prop_assert!(tile.rows > 0 && tile.cols > 0);
        }
    }

    #[test]
    fn grid_is_deterministic(
        rows in 1usize..2000,
        cols in 1usize..4000,
        granularity in granularity(),
    ) {
        prop_assert_eq!(
            PartitionPlan::grid(rows, cols, granularity),
            PartitionPlan::grid(rows, cols, granularity)
        );
    }

    #[test]
    fn interior_edges_fall_on_granularity(
        extent in 1usize..5000,
        step in 1usize..128,
        divisions in 1usize..13,
    ) {
        let spans = split_axis(extent, step, divisions);
        prop_assert!(spans.len() <= divisions.max(1));
        prop_assert_eq!(spans[0].0, 0);
        let mut next = 0;
        for &(start, len) in &spans {
            prop_assert_eq!(start, next);
            prop_assert!(len > 0);
            next = start + len;
        }
        prop_assert_eq!(next, extent);
        for &(start, _) in &spans[1..] {
            prop_assert_eq!(start % step, 0);
        }
        // Span lengths before the last differ by at most one block
        if spans.len() > 2 {
            let lens: Vec<_> = spans[..spans.len() - 1].iter().map(|s| s.1).collect();
            let max = *lens.iter().max().unwrap();
            let min = *lens.iter().min().unwrap();
            prop_assert!(max - min <= step);
        }
    }

    #[test]
    fn linear_chunks_are_whole(chunks in 1usize..200, min_chunks in 1usize..4) {
        let chunk = 768;
        let plan = PartitionPlan::linear(chunks * chunk, chunk, min_chunks);
        prop_assert!(plan.unit_count() <= MAX_UNITS);
        assert_exact_cover(&plan, 1, chunks * chunk);
        for tile in plan.tiles() {
            prop_assert_eq!(tile.cols % chunk, 0);
            if plan.unit_count() > 1 {
                prop_assert!(tile.cols >= chunk * min_chunks);
            }
        }
    }

    #[test]
    fn row_slabs_span_all_columns(blocks in 1usize..60, cols in 1usize..64) {
        let rows = blocks * 16;
        let plan = PartitionPlan::row_slabs(rows, cols, 16);
        prop_assert_eq!(plan.unit_count(), blocks.min(MAX_UNITS));
        assert_exact_cover(&plan, rows, cols);
        for tile in plan.tiles() {
            prop_assert_eq!(tile.col0, 0);
            prop_assert_eq!(tile.cols, cols);
            prop_assert_eq!(tile.rows % 16, 0);
        }
    }
}

#[test]
fn test_reference_problem_uses_twelve_units() {
    let plan = PartitionPlan::grid(96, 3072, TileGranularity::new(16, 64));
    assert_eq!(plan.divisions(), (2, 6));
    let tiles = plan.tiles();
    assert_eq!(tiles.len(), 12);
    assert_eq!((tiles[0].rows, tiles[0].cols), (48, 512));
    assert_eq!((tiles[7].row0, tiles[7].col0), (48, 512));
}
