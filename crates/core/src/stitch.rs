//! Pad, tile, infer, trim and reassemble a full image.
//!
//! Tiles are pulled from a shared counter by scoped worker threads and the
//! trimmed results are sent back to the calling thread, which is the only
//! writer of the output buffer. The bounded channel keeps at most one
//! finished tile per worker in flight.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::sync_channel;
use std::thread;
use std::time::Instant;

use ndarray::{s, Array2, Array4, ArrayView2, ArrayView4};
use tracing::{debug, info, warn};

use crate::backend::InferenceBackend;
use crate::config::TilingConfig;
use crate::error::DenoiseError;
use crate::grid::{CoverageMask, PatchGrid, Tile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StitchingEngine {
    tiling: TilingConfig,
    workers: usize,
}

impl StitchingEngine {
    pub fn new(tiling: TilingConfig, workers: usize) -> Self {
        Self {
            tiling,
            workers: workers.max(1),
        }
    }

    pub fn tiling(&self) -> &TilingConfig {
        &self.tiling
    }

    /// Denoise `image` tile by tile. Either every tile succeeds and the full
    /// image is returned, or the first error is returned and no further
    /// tiles are started.
    pub fn run<B>(&self, image: ArrayView2<'_, f32>, backend: &B) -> Result<Array2<f32>, DenoiseError>
    where
        B: InferenceBackend + ?Sized,
    {
        self.tiling.validate()?;
        let size = self.tiling.image_size;
        if image.dim() != (size, size) {
            return Err(DenoiseError::config(format!(
                "image has shape {:?}, expected ({size}, {size})",
                image.dim()
            )));
        }

        let grid = PatchGrid::plan(size, self.tiling.patch_size, self.tiling.padding)?;
        let tiles = grid.tiles();
        let padded = pad_image(image, self.tiling.padding);
        let workers = self.workers.min(backend.max_concurrency().max(1)).min(tiles.len());

        info!(
            backend = backend.name(),
            image_size = size,
            patch_size = self.tiling.patch_size,
            padding = self.tiling.padding,
            patches_per_dim = grid.patches_per_dim(),
            tiles = tiles.len(),
            workers,
            "Starting tiled denoise"
        );
        let started = Instant::now();

        let padding = self.tiling.padding;
        let next = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let (tx, rx) = sync_channel::<(usize, Result<Array2<f32>, DenoiseError>)>(workers);

        let mut output = Array2::<f32>::zeros((size, size));
        let mut mask = CoverageMask::new(size);
        let mut first_error: Option<DenoiseError> = None;

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let (next, abort, tiles, padded) = (&next, &abort, &tiles, &padded);
                scope.spawn(move || {
                    while !abort.load(Ordering::Acquire) {
                        let index = next.fetch_add(1, Ordering::AcqRel);
                        let Some(tile) = tiles.get(index) else {
                            break;
                        };
                        let result = process_tile(tile, padded.view(), padding, backend);
                        if result.is_err() {
                            abort.store(true, Ordering::Release);
                        }
                        if tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            for (index, result) in rx {
                if first_error.is_some() {
                    continue;
                }
                let tile = &tiles[index];
                let placed = result.and_then(|trimmed| {
                    mask.claim(tile)?;
                    output
                        .slice_mut(s![tile.dest_rows.clone(), tile.dest_cols.clone()])
                        .assign(&trimmed);
                    Ok(())
                });
                if let Err(e) = placed {
                    warn!(row = tile.row, col = tile.col, error = %e, "Tile failed; aborting run");
                    abort.store(true, Ordering::Release);
                    first_error = Some(e);
                }
            }
        });

        if let Some(e) = first_error {
            return Err(e);
        }
        mask.ensure_complete()?;

        info!(
            tiles = tiles.len(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Tiled denoise finished"
        );
        Ok(output)
    }
}

/// Zero-pad a 2D image by `padding` on both spatial axes into `(1, 1, H, W)`.
pub fn pad_image(image: ArrayView2<'_, f32>, padding: usize) -> Array4<f32> {
    let (h, w) = image.dim();
    let mut padded = Array4::<f32>::zeros((1, 1, h + 2 * padding, w + 2 * padding));
    padded
        .slice_mut(s![0, 0, padding..padding + h, padding..padding + w])
        .assign(&image);
    padded
}

fn process_tile<B>(
    tile: &Tile,
    padded: ArrayView4<'_, f32>,
    padding: usize,
    backend: &B,
) -> Result<Array2<f32>, DenoiseError>
where
    B: InferenceBackend + ?Sized,
{
    let window = padded.slice(s![.., .., tile.src_rows.clone(), tile.src_cols.clone()]);
    let started = Instant::now();
    let result = backend
        .infer(window)
        .map_err(|e| e.into_tile_error(tile.row, tile.col))?;

    let expected = tile.window_shape();
    if result.shape() != expected {
        return Err(DenoiseError::InvalidTileOutput {
            row: tile.row,
            col: tile.col,
            expected,
            actual: result.shape().to_vec(),
        });
    }

    debug!(
        row = tile.row,
        col = tile.col,
        height = tile.height(),
        width = tile.width(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Tile inferred"
    );

    Ok(result
        .slice(s![0, 0, padding..padding + tile.height(), padding..padding + tile.width()])
        .to_owned())
}
