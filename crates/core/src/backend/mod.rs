//! Inference backends: the per-tile forward pass behind [`InferenceBackend`].
//!
//! [`AcceleratedBackend`] runs an ONNX Runtime session on CUDA/TensorRT (or
//! CPU); [`PortableBackend`] runs the same network through im2col + GEMM on
//! the host. The stitching engine only sees the trait.

pub mod accelerated;
pub mod onnx;
pub mod portable;

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::artifacts::ModelArtifacts;
use crate::config::DenoiseConfig;
use crate::error::{DenoiseError, InferenceError};
use crate::network::{Architecture, Network};

pub use accelerated::{AcceleratedBackend, AcceleratedOptions};
pub use portable::{PortableBackend, PortableOptions};

/// Forward pass of the denoising network on one padded tile.
///
/// `window` is `(1, 1, h, w)`; the result must have the same shape.
/// Implementations must be safe to call from several tile workers.
pub trait InferenceBackend: Send + Sync {
    fn infer(&self, window: ArrayView4<'_, f32>) -> Result<Array4<f32>, InferenceError>;

    /// Upper bound on useful concurrent `infer` calls.
    fn max_concurrency(&self) -> usize {
        1
    }

    fn name(&self) -> &str;
}

impl<B: InferenceBackend + ?Sized> InferenceBackend for Box<B> {
    fn infer(&self, window: ArrayView4<'_, f32>) -> Result<Array4<f32>, InferenceError> {
        (**self).infer(window)
    }

    fn max_concurrency(&self) -> usize {
        (**self).max_concurrency()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Which forward-pass implementation to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSelector {
    #[default]
    Accelerated,
    Portable,
}

impl fmt::Display for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accelerated => write!(f, "accelerated"),
            Self::Portable => write!(f, "portable"),
        }
    }
}

impl FromStr for ModelSelector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "accelerated" | "gpu" | "onnx" => Ok(Self::Accelerated),
            "portable" | "im2col" => Ok(Self::Portable),
            other => bail!("unknown model selector '{other}' (expected accelerated or portable)"),
        }
    }
}

/// Execution device for the accelerated backend, resolved once per backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionDevice {
    /// CUDA when available, CPU otherwise.
    #[default]
    Auto,
    Cuda,
    /// TensorRT with CUDA fallback. Requires `libnvinfer`.
    Tensorrt,
    Cpu,
}

impl ExecutionDevice {
    /// Parse from string (case-insensitive). Returns `Auto` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Self::Cuda,
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Auto,
        }
    }
}

impl fmt::Display for ExecutionDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Resolve the network from loaded artifacts and construct the selected
/// backend. Any failure here happens before the first tile.
pub fn build_backend(
    selector: ModelSelector,
    artifacts: ModelArtifacts,
    config: &DenoiseConfig,
) -> Result<Box<dyn InferenceBackend>, DenoiseError> {
    let network = Network::from_parameters(
        &artifacts.parameters,
        &artifacts.layer_names,
        Architecture::from(&config.model),
    )?;

    match selector {
        ModelSelector::Accelerated => {
            let options = AcceleratedOptions::from(&config.runtime);
            let backend = AcceleratedBackend::new(&network, options).map_err(DenoiseError::backend)?;
            Ok(Box::new(backend))
        }
        ModelSelector::Portable => {
            let tables = artifacts.index_tables.ok_or_else(|| {
                DenoiseError::config("portable backend requires im2col index tables")
            })?;
            let options = PortableOptions::from(&config.runtime);
            Ok(Box::new(PortableBackend::new(network, tables, options)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parses_and_displays() {
        assert_eq!("Portable".parse::<ModelSelector>().unwrap(), ModelSelector::Portable);
        assert_eq!("gpu".parse::<ModelSelector>().unwrap(), ModelSelector::Accelerated);
        assert!("numpy2".parse::<ModelSelector>().is_err());
        assert_eq!(ModelSelector::Portable.to_string(), "portable");
        assert_eq!(ModelSelector::default(), ModelSelector::Accelerated);
    }

    #[test]
    fn device_from_str_lossy() {
        assert_eq!(ExecutionDevice::from_str_lossy("CUDA"), ExecutionDevice::Cuda);
        assert_eq!(ExecutionDevice::from_str_lossy("trt"), ExecutionDevice::Tensorrt);
        assert_eq!(ExecutionDevice::from_str_lossy("TensorRT"), ExecutionDevice::Tensorrt);
        assert_eq!(ExecutionDevice::from_str_lossy("cpu"), ExecutionDevice::Cpu);
        assert_eq!(ExecutionDevice::from_str_lossy("unknown"), ExecutionDevice::Auto);
        assert_eq!(ExecutionDevice::from_str_lossy(""), ExecutionDevice::Auto);
    }

    #[test]
    fn device_display() {
        assert_eq!(ExecutionDevice::Auto.to_string(), "auto");
        assert_eq!(ExecutionDevice::Tensorrt.to_string(), "tensorrt");
    }

    #[test]
    fn portable_without_tables_is_configuration_error() {
        use crate::artifacts::ParameterSet;
        use ndarray::{ArrayD, IxDyn};

        let mut parameters = ParameterSet::default();
        parameters.insert("conv.weight", ArrayD::zeros(IxDyn(&[1, 1, 3, 3])));
        let artifacts = ModelArtifacts {
            parameters,
            layer_names: vec!["conv".into()],
            index_tables: None,
        };
        let err = build_backend(ModelSelector::Portable, artifacts, &DenoiseConfig::default())
            .err()
            .expect("should fail");
        assert!(err.is_configuration());
    }
}
