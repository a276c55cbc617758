//! Backend-neutral description of the DnCNN denoiser.
//!
//! Each named layer is a same-padded convolution, optionally followed by an
//! inference-mode batch normalization, followed by the network activation
//! (except the final layer unless [`Architecture::final_activation`] is set).

use ndarray::{Array1, Array2, Array4, ArrayD, Ix1, Ix4};
use serde::{Deserialize, Serialize};

use crate::artifacts::ParameterSet;
use crate::config::ModelConfig;
use crate::error::DenoiseError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    LeakyRelu(f32),
}

impl Activation {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Relu => x.max(0.0),
            Self::LeakyRelu(slope) => {
                if x >= 0.0 {
                    x
                } else {
                    x * slope
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Architecture {
    pub activation: Activation,
    pub final_activation: bool,
    pub batch_norm_epsilon: f32,
}

impl Default for Architecture {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            final_activation: false,
            batch_norm_epsilon: 1e-5,
        }
    }
}

impl From<&ModelConfig> for Architecture {
    fn from(model: &ModelConfig) -> Self {
        Self {
            activation: model.activation,
            final_activation: model.final_activation,
            batch_norm_epsilon: model.batch_norm_epsilon,
        }
    }
}

/// Stored batch-norm statistics for one layer.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    pub epsilon: f32,
}

impl BatchNorm {
    /// Per-channel `(scale, shift)` so that `bn(x) = x * scale + shift`.
    pub fn folded(&self) -> (Array1<f32>, Array1<f32>) {
        let scale: Array1<f32> = self
            .gamma
            .iter()
            .zip(self.running_var.iter())
            .map(|(&g, &v)| g / (v + self.epsilon).sqrt())
            .collect();
        let shift: Array1<f32> = self
            .beta
            .iter()
            .zip(self.running_mean.iter())
            .zip(scale.iter())
            .map(|((&b, &m), &s)| b - m * s)
            .collect();
        (scale, shift)
    }
}

#[derive(Debug, Clone)]
pub struct ConvLayer {
    pub name: String,
    /// `[out_channels, in_channels, kernel, kernel]`
    pub weight: Array4<f32>,
    pub bias: Option<Array1<f32>>,
    pub batch_norm: Option<BatchNorm>,
    pub activation: Option<Activation>,
}

impl ConvLayer {
    pub fn out_channels(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn in_channels(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn kernel_size(&self) -> usize {
        self.weight.shape()[2]
    }

    /// Zero padding that keeps the spatial size unchanged.
    pub fn pad(&self) -> usize {
        self.kernel_size() / 2
    }

    /// Kernel flattened to `(out_channels, in_channels * k * k)` in
    /// (channel, row, column) order.
    pub fn kernel_matrix(&self) -> Result<Array2<f32>, DenoiseError> {
        let out = self.out_channels();
        let flat = self.in_channels() * self.kernel_size() * self.kernel_size();
        let data: Vec<f32> = self.weight.iter().copied().collect();
        Array2::from_shape_vec((out, flat), data).map_err(|e| {
            DenoiseError::config(format!(
                "layer '{}' weight {:?} does not flatten to ({out}, {flat}): {e}",
                self.name,
                self.weight.shape()
            ))
        })
    }

    pub fn parameter_count(&self) -> usize {
        let bn = self
            .batch_norm
            .as_ref()
            .map_or(0, |bn| bn.gamma.len() * 4);
        self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len()) + bn
    }
}

#[derive(Debug, Clone)]
pub struct Network {
    layers: Vec<ConvLayer>,
    architecture: Architecture,
}

impl Network {
    /// Resolve `layer_names` against the parameter set and validate the
    /// channel chain `1 -> ... -> 1`.
    pub fn from_parameters(
        parameters: &ParameterSet,
        layer_names: &[String],
        architecture: Architecture,
    ) -> Result<Self, DenoiseError> {
        if layer_names.is_empty() {
            return Err(DenoiseError::config("layer list is empty"));
        }

        let last = layer_names.len() - 1;
        let mut layers = Vec::with_capacity(layer_names.len());
        for (index, name) in layer_names.iter().enumerate() {
            let activation = if index < last || architecture.final_activation {
                Some(architecture.activation)
            } else {
                None
            };
            layers.push(resolve_layer(parameters, name, activation, &architecture)?);
        }

        let network = Self {
            layers,
            architecture,
        };
        network.validate_chain()?;
        Ok(network)
    }

    pub fn layers(&self) -> &[ConvLayer] {
        &self.layers
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name.clone()).collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(ConvLayer::parameter_count).sum()
    }

    fn validate_chain(&self) -> Result<(), DenoiseError> {
        let first = &self.layers[0];
        if first.in_channels() != 1 {
            return Err(DenoiseError::config(format!(
                "layer '{}' expects {} input channels, images have 1",
                first.name,
                first.in_channels()
            )));
        }
        for pair in self.layers.windows(2) {
            if pair[0].out_channels() != pair[1].in_channels() {
                return Err(DenoiseError::config(format!(
                    "layer '{}' produces {} channels but '{}' expects {}",
                    pair[0].name,
                    pair[0].out_channels(),
                    pair[1].name,
                    pair[1].in_channels()
                )));
            }
        }
        let last = &self.layers[self.layers.len() - 1];
        if last.out_channels() != 1 {
            return Err(DenoiseError::config(format!(
                "final layer '{}' produces {} channels, expected a single-channel residual",
                last.name,
                last.out_channels()
            )));
        }
        Ok(())
    }
}

fn resolve_layer(
    parameters: &ParameterSet,
    name: &str,
    activation: Option<Activation>,
    architecture: &Architecture,
) -> Result<ConvLayer, DenoiseError> {
    let weight_key = format!("{name}.weight");
    let weight = into_dim::<Ix4>(parameters.require(&weight_key)?, &weight_key)?;
    let (out_c, _, kh, kw) = weight.dim();
    if kh != kw || kh % 2 == 0 {
        return Err(DenoiseError::config(format!(
            "'{weight_key}' has a {kh}x{kw} kernel; only odd square kernels are supported"
        )));
    }

    let bias = match parameters.get(&format!("{name}.bias")) {
        Some(b) => Some(channel_vector(b, &format!("{name}.bias"), out_c)?),
        None => None,
    };

    let bn_prefix = parameters
        .batch_norm_prefix(name)
        .unwrap_or_else(|| format!("{name}.bn"));
    let bn_keys = ["weight", "bias", "running_mean", "running_var"].map(|p| format!("{bn_prefix}.{p}"));
    let present = bn_keys.iter().filter(|k| parameters.get(k).is_some()).count();
    let batch_norm = match present {
        0 => None,
        4 => Some(BatchNorm {
            gamma: channel_vector(parameters.require(&bn_keys[0])?, &bn_keys[0], out_c)?,
            beta: channel_vector(parameters.require(&bn_keys[1])?, &bn_keys[1], out_c)?,
            running_mean: channel_vector(parameters.require(&bn_keys[2])?, &bn_keys[2], out_c)?,
            running_var: channel_vector(parameters.require(&bn_keys[3])?, &bn_keys[3], out_c)?,
            epsilon: architecture.batch_norm_epsilon,
        }),
        _ => {
            return Err(DenoiseError::config(format!(
                "layer '{name}' has an incomplete batch-norm parameter set ({present} of 4 tensors)"
            )))
        }
    };

    Ok(ConvLayer {
        name: name.to_string(),
        weight,
        bias,
        batch_norm,
        activation,
    })
}

fn into_dim<D: ndarray::Dimension>(
    tensor: &ArrayD<f32>,
    key: &str,
) -> Result<ndarray::Array<f32, D>, DenoiseError> {
    tensor.clone().into_dimensionality::<D>().map_err(|_| {
        DenoiseError::config(format!(
            "parameter '{key}' has unexpected rank {} (shape {:?})",
            tensor.ndim(),
            tensor.shape()
        ))
    })
}

fn channel_vector(tensor: &ArrayD<f32>, key: &str, channels: usize) -> Result<Array1<f32>, DenoiseError> {
    let vector = into_dim::<Ix1>(tensor, key)?;
    if vector.len() != channels {
        return Err(DenoiseError::config(format!(
            "parameter '{key}' has {} entries, expected {channels}",
            vector.len()
        )));
    }
    Ok(vector)
}
