//! Patch-based DnCNN denoising for full-frame FVC images.
//!
//! A [`Denoiser`] loads the model artifacts once, builds the selected
//! [`InferenceBackend`] and then denoises any number of images through the
//! [`StitchingEngine`].

pub mod artifacts;
pub mod backend;
pub mod config;
pub mod error;
pub mod grid;
pub mod im2col;
pub mod image;
pub mod logging;
pub mod network;
pub mod runtime;
pub mod stitch;
pub mod verify;

use std::path::Path;

use ndarray::{Array2, ArrayView2};
use tracing::info;

pub use artifacts::{ArtifactFiles, ArtifactStore, ModelArtifacts};
pub use backend::{build_backend, ExecutionDevice, InferenceBackend, ModelSelector};
pub use config::{DenoiseConfig, TilingConfig};
pub use error::{DenoiseError, InferenceError};
pub use image::Pixel;
pub use stitch::StitchingEngine;

/// A loaded model bound to one backend and one tiling.
pub struct Denoiser<B: ?Sized = dyn InferenceBackend> {
    engine: StitchingEngine,
    backend: Box<B>,
}

impl Denoiser {
    /// Validate the tiling, load artifacts from `artifact_dir` and build the
    /// backend named by `selector`.
    pub fn open(
        selector: ModelSelector,
        artifact_dir: &Path,
        config: &DenoiseConfig,
    ) -> Result<Self, DenoiseError> {
        config.tiling.validate()?;
        let store = ArtifactStore::new(artifact_dir, ArtifactFiles::from(&config.model));
        let artifacts = store.load(selector)?;
        let backend = build_backend(selector, artifacts, config)?;
        info!(backend = backend.name(), %selector, "Denoiser ready");
        Ok(Self {
            engine: StitchingEngine::new(config.tiling, config.runtime.resolved_workers()),
            backend,
        })
    }
}

impl<B: InferenceBackend + ?Sized> Denoiser<B> {
    pub fn with_backend(backend: Box<B>, config: &DenoiseConfig) -> Result<Self, DenoiseError> {
        config.tiling.validate()?;
        Ok(Self {
            engine: StitchingEngine::new(config.tiling, config.runtime.resolved_workers()),
            backend,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn denoise<P: Pixel>(&self, image: ArrayView2<'_, P>) -> Result<Array2<f32>, DenoiseError> {
        let image = crate::image::to_f32(image);
        self.engine.run(image.view(), &*self.backend)
    }
}

/// One-shot denoise: open, run, drop.
pub fn denoise<P: Pixel>(
    image: ArrayView2<'_, P>,
    selector: ModelSelector,
    artifact_dir: &Path,
    config: &DenoiseConfig,
) -> Result<Array2<f32>, DenoiseError> {
    Denoiser::open(selector, artifact_dir, config)?.denoise(image)
}

/// Like [`denoise`], but the backend is built by `make_backend` from the
/// loaded artifacts. `selector` decides which artifact files are required.
pub fn denoise_with<P, B, F>(
    image: ArrayView2<'_, P>,
    artifact_dir: &Path,
    config: &DenoiseConfig,
    selector: ModelSelector,
    make_backend: F,
) -> Result<Array2<f32>, DenoiseError>
where
    P: Pixel,
    B: InferenceBackend,
    F: FnOnce(ModelArtifacts, &DenoiseConfig) -> Result<B, DenoiseError>,
{
    config.tiling.validate()?;
    let store = ArtifactStore::new(artifact_dir, ArtifactFiles::from(&config.model));
    let artifacts = store.load(selector)?;
    let backend = make_backend(artifacts, config)?;
    Denoiser::with_backend(Box::new(backend), config)?.denoise(image)
}
