use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by a denoising run.
///
/// `Configuration`, `MissingArtifact` and `MalformedArtifact` are always
/// reported before any tile reaches a backend.
#[derive(Debug, Error)]
pub enum DenoiseError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("missing model artifact: {}", path.display())]
    MissingArtifact { path: PathBuf },

    #[error("malformed model artifact {}: {reason}", path.display())]
    MalformedArtifact { path: PathBuf, reason: String },

    #[error("failed to initialize inference backend")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error(
        "device memory exhausted on tile ({row}, {col}); retry the run with a smaller patch size: {message}"
    )]
    ResourceExhausted {
        row: usize,
        col: usize,
        message: String,
    },

    #[error("inference failed on tile ({row}, {col})")]
    Tile {
        row: usize,
        col: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("tile ({row}, {col}) returned shape {actual:?}, expected {expected:?}")]
    InvalidTileOutput {
        row: usize,
        col: usize,
        expected: [usize; 4],
        actual: Vec<usize>,
    },

    #[error("tile grid invariant violated: {0}")]
    GridInvariant(String),

    #[error("backend outputs diverge: max abs diff {max_abs_diff} exceeds tolerance {tolerance}")]
    NumericalMismatch { max_abs_diff: f32, tolerance: f32 },
}

impl DenoiseError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedArtifact {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn backend(error: anyhow::Error) -> Self {
        Self::Backend(error.into())
    }

    /// True for the error family raised before any inference happens.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::MissingArtifact { .. } | Self::MalformedArtifact { .. }
        )
    }
}

/// Failure of a single `infer` call.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("device memory exhausted: {0}")]
    ResourceExhausted(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl InferenceError {
    pub(crate) fn into_tile_error(self, row: usize, col: usize) -> DenoiseError {
        match self {
            Self::ResourceExhausted(message) => DenoiseError::ResourceExhausted { row, col, message },
            Self::Failed(source) => DenoiseError::Tile {
                row,
                col,
                source: source.into(),
            },
        }
    }
}
