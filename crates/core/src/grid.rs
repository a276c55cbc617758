//! Patch grid planning.
//!
//! A square raster of edge `S` is split into `n = floor(S / ps)` bands per
//! axis with boundaries `[0, ps, 2ps, ..., (n-1)ps, S]`. Any remainder is
//! folded into the last band, so the last tile can be up to `2ps - 1` wide.

use std::ops::Range;

use crate::error::DenoiseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchGrid {
    image_size: usize,
    patch_size: usize,
    padding: usize,
    boundaries: Vec<usize>,
}

/// One unit of work: where to read in the padded image and where the trimmed
/// result goes in the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub row: usize,
    pub col: usize,
    /// Window into the padded image, `padding` wider on every side than
    /// `dest_rows`/`dest_cols`.
    pub src_rows: Range<usize>,
    pub src_cols: Range<usize>,
    pub dest_rows: Range<usize>,
    pub dest_cols: Range<usize>,
}

impl Tile {
    pub fn height(&self) -> usize {
        self.dest_rows.len()
    }

    pub fn width(&self) -> usize {
        self.dest_cols.len()
    }

    /// Backend input shape `(1, 1, h + 2p, w + 2p)`.
    pub fn window_shape(&self) -> [usize; 4] {
        [1, 1, self.src_rows.len(), self.src_cols.len()]
    }
}

impl PatchGrid {
    pub fn plan(image_size: usize, patch_size: usize, padding: usize) -> Result<Self, DenoiseError> {
        if patch_size == 0 {
            return Err(DenoiseError::config("patch_size must be positive"));
        }
        if patch_size > image_size {
            return Err(DenoiseError::config(format!(
                "patch_size ({patch_size}) exceeds image size ({image_size})"
            )));
        }

        let patches_per_dim = image_size / patch_size;
        let mut boundaries: Vec<usize> = (0..patches_per_dim).map(|k| k * patch_size).collect();
        boundaries.push(image_size);

        let grid = Self {
            image_size,
            patch_size,
            padding,
            boundaries,
        };
        grid.check_boundaries()?;
        Ok(grid)
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn patches_per_dim(&self) -> usize {
        self.boundaries.len() - 1
    }

    pub fn tile_count(&self) -> usize {
        self.patches_per_dim() * self.patches_per_dim()
    }

    pub fn boundaries(&self) -> &[usize] {
        &self.boundaries
    }

    /// Tiles in row-major order.
    pub fn tiles(&self) -> Vec<Tile> {
        let n = self.patches_per_dim();
        let mut tiles = Vec::with_capacity(n * n);
        for row in 0..n {
            for col in 0..n {
                tiles.push(self.tile(row, col));
            }
        }
        tiles
    }

    fn tile(&self, row: usize, col: usize) -> Tile {
        let band = |i: usize| self.boundaries[i]..self.boundaries[i + 1];
        let widen = |r: &Range<usize>| r.start..r.end + 2 * self.padding;
        let dest_rows = band(row);
        let dest_cols = band(col);
        Tile {
            row,
            col,
            src_rows: widen(&dest_rows),
            src_cols: widen(&dest_cols),
            dest_rows,
            dest_cols,
        }
    }

    fn check_boundaries(&self) -> Result<(), DenoiseError> {
        let b = &self.boundaries;
        if b.first() != Some(&0) || b.last() != Some(&self.image_size) {
            return Err(DenoiseError::GridInvariant(format!(
                "boundaries {b:?} must start at 0 and end at {}",
                self.image_size
            )));
        }
        if b.windows(2).any(|w| w[0] >= w[1]) {
            return Err(DenoiseError::GridInvariant(format!(
                "boundaries {b:?} are not strictly increasing"
            )));
        }
        Ok(())
    }
}

/// Tracks which output pixels have been written so overlap and gaps are
/// reported instead of silently corrupting the image.
#[derive(Debug)]
pub struct CoverageMask {
    size: usize,
    written: Vec<bool>,
    count: usize,
}

impl CoverageMask {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            written: vec![false; size * size],
            count: 0,
        }
    }

    pub fn claim(&mut self, tile: &Tile) -> Result<(), DenoiseError> {
        if tile.dest_rows.end > self.size || tile.dest_cols.end > self.size {
            return Err(DenoiseError::GridInvariant(format!(
                "tile ({}, {}) destination exceeds {}x{} output",
                tile.row, tile.col, self.size, self.size
            )));
        }
        for y in tile.dest_rows.clone() {
            let line = &mut self.written[y * self.size..(y + 1) * self.size];
            let span = &mut line[tile.dest_cols.clone()];
            if let Some(x) = span.iter().position(|&w| w) {
                return Err(DenoiseError::GridInvariant(format!(
                    "tile ({}, {}) overlaps an already written pixel at ({y}, {})",
                    tile.row,
                    tile.col,
                    tile.dest_cols.start + x
                )));
            }
            span.fill(true);
        }
        self.count += tile.height() * tile.width();
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.size * self.size
    }

    pub fn ensure_complete(&self) -> Result<(), DenoiseError> {
        if self.is_complete() {
            return Ok(());
        }
        let first_gap = self.written.iter().position(|&w| !w).unwrap_or(0);
        Err(DenoiseError::GridInvariant(format!(
            "{} of {} output pixels never written; first gap at ({}, {})",
            self.size * self.size - self.count,
            self.size * self.size,
            first_gap / self.size,
            first_gap % self.size
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fvc_default_grid_has_three_bands() {
        let grid = PatchGrid::plan(6000, 2000, 10).expect("grid");
        assert_eq!(grid.patches_per_dim(), 3);
        assert_eq!(grid.boundaries(), &[0, 2000, 4000, 6000]);
        assert_eq!(grid.tile_count(), 9);
    }

    #[test]
    fn remainder_folds_into_last_band() {
        let grid = PatchGrid::plan(6000, 1800, 10).expect("grid");
        assert_eq!(grid.boundaries(), &[0, 1800, 3600, 6000]);
        let last = grid.tiles().pop().expect("tiles");
        assert_eq!(last.dest_rows, 3600..6000);
        assert_eq!(last.src_rows, 3600..6020);
        assert_eq!(last.window_shape(), [1, 1, 2420, 2420]);
    }

    #[test]
    fn single_patch_covers_whole_image() {
        let grid = PatchGrid::plan(64, 64, 4).expect("grid");
        assert_eq!(grid.boundaries(), &[0, 64]);
        let tiles = grid.tiles();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].src_cols, 0..72);
    }

    #[test]
    fn patch_larger_than_image_is_rejected() {
        let err = PatchGrid::plan(100, 101, 0).unwrap_err();
        assert!(err.is_configuration());
        assert!(PatchGrid::plan(100, 0, 0).unwrap_err().is_configuration());
    }

    #[test]
    fn tiles_are_row_major() {
        let grid = PatchGrid::plan(30, 10, 2).expect("grid");
        let order: Vec<(usize, usize)> = grid.tiles().iter().map(|t| (t.row, t.col)).collect();
        assert_eq!(order[0], (0, 0));
        assert_eq!(order[1], (0, 1));
        assert_eq!(order[3], (1, 0));
    }

    #[test]
    fn coverage_mask_accepts_planned_tiles() {
        for (size, patch) in [(30, 10), (31, 10), (7, 3), (5, 5), (6000, 1800)] {
            let grid = PatchGrid::plan(size, patch, 1).expect("grid");
            let mut mask = CoverageMask::new(size);
            for tile in grid.tiles() {
                mask.claim(&tile).expect("disjoint");
            }
            mask.ensure_complete().expect("complete");
        }
    }

    #[test]
    fn coverage_mask_detects_overlap_and_gaps() {
        let grid = PatchGrid::plan(20, 10, 0).expect("grid");
        let tiles = grid.tiles();

        let mut mask = CoverageMask::new(20);
        mask.claim(&tiles[0]).expect("first claim");
        let err = mask.claim(&tiles[0]).unwrap_err();
        assert!(matches!(err, DenoiseError::GridInvariant(_)));

        let err = mask.ensure_complete().unwrap_err();
        assert!(err.to_string().contains("300 of 400"));
    }
}
