//! Host-only forward pass: im2col gather + GEMM per layer.
//!
//! Each layer zero-pads its `(C, H, W)` input by `k / 2`, gathers output
//! positions in row chunks through the layer's index table, multiplies the
//! chunk by the transposed kernel matrix and applies the per-channel affine
//! (conv bias folded with inference-mode batch norm) and activation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, bail, Context};
use ndarray::{s, Array2, Array3, Array4, ArrayView3, ArrayView4, Axis};
use tracing::{debug, info};

use super::InferenceBackend;
use crate::artifacts::IndexTables;
use crate::config::{RuntimeConfig, DEFAULT_GEMM_CHUNK_ROWS, DEFAULT_PORTABLE_MEMORY_MB};
use crate::error::{DenoiseError, InferenceError};
use crate::im2col::{IndexTable, TableGeometry};
use crate::network::{Activation, ConvLayer, Network};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortableOptions {
    /// Output positions gathered per GEMM.
    pub chunk_rows: usize,
    /// Upper bound on tiles in flight, before the memory budget applies.
    pub max_concurrency: usize,
    /// Host memory shared by all tiles in flight; `0` disables the bound.
    pub memory_budget_bytes: usize,
}

impl Default for PortableOptions {
    fn default() -> Self {
        Self {
            chunk_rows: DEFAULT_GEMM_CHUNK_ROWS,
            max_concurrency: 1,
            memory_budget_bytes: DEFAULT_PORTABLE_MEMORY_MB << 20,
        }
    }
}

impl From<&RuntimeConfig> for PortableOptions {
    fn from(runtime: &RuntimeConfig) -> Self {
        Self {
            chunk_rows: runtime.gemm_chunk_rows.max(1),
            max_concurrency: runtime.resolved_workers(),
            memory_budget_bytes: runtime.portable_memory_mb.saturating_mul(1 << 20),
        }
    }
}

/// Peak host bytes one `height x width` tile holds in its widest layer: the
/// input activations, their zero-padded copy, the output, and one gathered
/// GEMM chunk with its product.
pub fn tile_footprint_bytes(network: &Network, height: usize, width: usize, chunk_rows: usize) -> usize {
    let positions = height.saturating_mul(width);
    let chunk = chunk_rows.min(positions);
    network
        .layers()
        .iter()
        .map(|layer| {
            let (c_in, c_out, k, pad) = (
                layer.in_channels(),
                layer.out_channels(),
                layer.kernel_size(),
                layer.pad(),
            );
            let padded = height
                .saturating_add(2 * pad)
                .saturating_mul(width.saturating_add(2 * pad));
            [
                c_in.saturating_mul(positions),
                c_in.saturating_mul(padded),
                c_out.saturating_mul(positions),
                chunk.saturating_mul(c_in * k * k + c_out),
            ]
            .into_iter()
            .fold(0usize, usize::saturating_add)
        })
        .max()
        .unwrap_or(0)
        .saturating_mul(std::mem::size_of::<f32>())
}

/// Tiles that fit `budget_bytes` at `footprint` each, between 1 and
/// `requested`.
pub fn concurrency_within_budget(budget_bytes: usize, footprint: usize, requested: usize) -> usize {
    let requested = requested.max(1);
    if budget_bytes == 0 || footprint == 0 {
        return requested;
    }
    (budget_bytes / footprint).clamp(1, requested)
}

/// One layer prepared for GEMM.
struct PreparedLayer {
    name: String,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    pad: usize,
    /// `(in * k * k, out)`
    kernel_t: Array2<f32>,
    scale: Vec<f32>,
    shift: Vec<f32>,
    activation: Option<Activation>,
    table: Arc<IndexTable>,
}

impl PreparedLayer {
    fn new(layer: &ConvLayer, table: IndexTable) -> Result<Self, DenoiseError> {
        let out = layer.out_channels();
        let bias = layer
            .bias
            .as_ref()
            .map_or_else(|| vec![0.0; out], |b| b.to_vec());
        let (scale, shift) = match &layer.batch_norm {
            Some(bn) => {
                let (s, t) = bn.folded();
                let shift = bias.iter().zip(s.iter()).zip(t.iter()).map(|((&b, &s), &t)| b * s + t);
                (s.to_vec(), shift.collect())
            }
            None => (vec![1.0; out], bias),
        };
        Ok(Self {
            name: layer.name.clone(),
            in_channels: layer.in_channels(),
            out_channels: out,
            kernel: layer.kernel_size(),
            pad: layer.pad(),
            kernel_t: layer.kernel_matrix()?.reversed_axes(),
            scale,
            shift,
            activation: layer.activation,
            table: Arc::new(table),
        })
    }

    fn geometry_for(&self, height: usize, width: usize) -> TableGeometry {
        TableGeometry {
            channels: self.in_channels,
            height,
            width,
            kernel: self.kernel,
            pad: self.pad,
        }
    }
}

pub struct PortableBackend {
    layers: Vec<PreparedLayer>,
    derived: Mutex<HashMap<TableGeometry, Arc<IndexTable>>>,
    options: PortableOptions,
    concurrency: usize,
}

impl PortableBackend {
    /// Every layer must come with a table whose channels, kernel and pad
    /// match the layer. The table's spatial size is the fast path; other
    /// tile sizes get a derived table on first use.
    pub fn new(
        network: Network,
        mut tables: IndexTables,
        options: PortableOptions,
    ) -> Result<Self, DenoiseError> {
        if options.chunk_rows == 0 {
            return Err(DenoiseError::config("gemm_chunk_rows must be positive"));
        }

        let mut layers = Vec::with_capacity(network.layers().len());
        for layer in network.layers() {
            let table = tables.take(&layer.name).ok_or_else(|| {
                DenoiseError::config(format!("no im2col index table for layer '{}'", layer.name))
            })?;
            let g = table.geometry();
            if g.channels != layer.in_channels() || g.kernel != layer.kernel_size() || g.pad != layer.pad() {
                return Err(DenoiseError::config(format!(
                    "index table for '{}' has geometry {:?}, layer needs channels={} kernel={} pad={}",
                    layer.name,
                    g,
                    layer.in_channels(),
                    layer.kernel_size(),
                    layer.pad()
                )));
            }
            layers.push(PreparedLayer::new(layer, table)?);
        }

        let (height, width) = layers
            .first()
            .map_or((0, 0), |l| (l.table.geometry().height, l.table.geometry().width));
        let footprint = tile_footprint_bytes(&network, height, width, options.chunk_rows);
        let concurrency =
            concurrency_within_budget(options.memory_budget_bytes, footprint, options.max_concurrency);

        info!(
            layers = layers.len(),
            parameters = network.parameter_count(),
            chunk_rows = options.chunk_rows,
            tile_mb = footprint >> 20,
            budget_mb = options.memory_budget_bytes >> 20,
            concurrency,
            "Portable backend ready"
        );

        Ok(Self {
            layers,
            derived: Mutex::new(HashMap::new()),
            options,
            concurrency,
        })
    }

    /// Number of tables built for non-default tile sizes.
    pub fn derived_table_count(&self) -> usize {
        self.derived
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn table_for(&self, layer: &PreparedLayer, height: usize, width: usize) -> anyhow::Result<Arc<IndexTable>> {
        let g = layer.table.geometry();
        if g.height == height && g.width == width {
            return Ok(Arc::clone(&layer.table));
        }

        let geometry = layer.geometry_for(height, width);
        let mut cache = self.derived.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = cache.get(&geometry) {
            return Ok(Arc::clone(table));
        }
        debug!(layer = %layer.name, height, width, "Deriving im2col table for tile size");
        let table = Arc::new(IndexTable::build(geometry)?);
        cache.insert(geometry, Arc::clone(&table));
        Ok(table)
    }

    fn forward_layer(&self, layer: &PreparedLayer, input: ArrayView3<'_, f32>) -> anyhow::Result<Array3<f32>> {
        let (channels, height, width) = input.dim();
        if channels != layer.in_channels {
            bail!(
                "layer '{}' expects {} channels, got {channels}",
                layer.name,
                layer.in_channels
            );
        }

        let table = self.table_for(layer, height, width)?;
        let padded = zero_pad(input, layer.pad);
        let positions = height * width;
        let mut output = Array2::<f32>::zeros((layer.out_channels, positions));

        let mut start = 0;
        while start < positions {
            let end = (start + self.options.chunk_rows).min(positions);
            let columns = table.gather(&padded, start, end);
            let product = columns.dot(&layer.kernel_t);
            output.slice_mut(s![.., start..end]).assign(&product.t());
            start = end;
        }

        for (mut channel, (&scale, &shift)) in output
            .axis_iter_mut(Axis(0))
            .zip(layer.scale.iter().zip(&layer.shift))
        {
            match layer.activation {
                Some(activation) => channel.mapv_inplace(|v| activation.apply(v * scale + shift)),
                None => channel.mapv_inplace(|v| v * scale + shift),
            }
        }

        output
            .into_shape_with_order((layer.out_channels, height, width))
            .with_context(|| format!("layer '{}' output reshape", layer.name))
    }

    fn forward(&self, window: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
        let (batch, channels, height, width) = window.dim();
        if batch != 1 || channels != 1 {
            bail!("expected a (1, 1, h, w) window, got {:?}", window.shape());
        }

        let mut activations = window.index_axis(Axis(0), 0).to_owned();
        for layer in &self.layers {
            activations = self.forward_layer(layer, activations.view())?;
        }

        activations
            .into_shape_with_order((1, 1, height, width))
            .map_err(|e| anyhow!("final output reshape: {e}"))
    }
}

impl InferenceBackend for PortableBackend {
    fn infer(&self, window: ArrayView4<'_, f32>) -> Result<Array4<f32>, InferenceError> {
        Ok(self.forward(window)?)
    }

    fn max_concurrency(&self) -> usize {
        self.concurrency
    }

    fn name(&self) -> &str {
        "portable"
    }
}

/// Row-major `(C, H + 2p, W + 2p)` copy with a zero border.
fn zero_pad(input: ArrayView3<'_, f32>, pad: usize) -> Vec<f32> {
    let (channels, height, width) = input.dim();
    let mut padded = Array3::<f32>::zeros((channels, height + 2 * pad, width + 2 * pad));
    padded
        .slice_mut(s![.., pad..pad + height, pad..pad + width])
        .assign(&input);
    padded.into_raw_vec_and_offset().0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ParameterSet;
    use crate::network::Architecture;
    use ndarray::{ArrayD, IxDyn};

    /// Deterministic pseudo-random values in [-1, 1).
    fn values(len: usize, seed: u32) -> Vec<f32> {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state as f32 / u32::MAX as f32) * 2.0 - 1.0
            })
            .collect()
    }

    fn tensor(shape: &[usize], seed: u32) -> ArrayD<f32> {
        let len = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), values(len, seed)).expect("shape")
    }

    fn three_layer_network() -> Network {
        let mut p = ParameterSet::default();
        p.insert("dncnn.0.weight", tensor(&[3, 1, 3, 3], 1));
        p.insert("dncnn.0.bias", tensor(&[3], 2));
        p.insert("dncnn.1.weight", tensor(&[2, 3, 3, 3], 3));
        p.insert("dncnn.1.bn.weight", tensor(&[2], 4));
        p.insert("dncnn.1.bn.bias", tensor(&[2], 5));
        p.insert("dncnn.1.bn.running_mean", tensor(&[2], 6));
        p.insert("dncnn.1.bn.running_var", tensor(&[2], 7).mapv(|v| v.abs() + 0.5));
        p.insert("dncnn.2.weight", tensor(&[1, 2, 3, 3], 8));
        let names = ["dncnn.0", "dncnn.1", "dncnn.2"].map(String::from);
        Network::from_parameters(&p, &names, Architecture::default()).expect("network")
    }

    fn identity_network() -> Network {
        let mut p = ParameterSet::default();
        let mut weight = ArrayD::zeros(IxDyn(&[1, 1, 3, 3]));
        weight[[0, 0, 1, 1]] = 1.0;
        p.insert("conv.weight", weight);
        Network::from_parameters(&p, &["conv".to_string()], Architecture::default()).expect("network")
    }

    fn backend(network: Network, height: usize, width: usize, chunk_rows: usize) -> PortableBackend {
        let tables = IndexTables::build_for(&network, height, width).expect("tables");
        let options = PortableOptions {
            chunk_rows,
            max_concurrency: 2,
            memory_budget_bytes: 0,
        };
        PortableBackend::new(network, tables, options).expect("backend")
    }

    /// Nested-loop reference: conv, bias, batch norm, activation.
    fn direct_forward(network: &Network, window: &Array4<f32>) -> Array4<f32> {
        let (_, _, h, w) = window.dim();
        let mut x = window.index_axis(Axis(0), 0).to_owned();
        for layer in network.layers() {
            let (out_c, in_c, k, _) = layer.weight.dim();
            let pad = layer.pad() as isize;
            let mut y = Array3::<f32>::zeros((out_c, h, w));
            for o in 0..out_c {
                for i in 0..h {
                    for j in 0..w {
                        let mut acc = layer.bias.as_ref().map_or(0.0, |b| b[o]);
                        for c in 0..in_c {
                            for ky in 0..k {
                                for kx in 0..k {
                                    let yy = i as isize + ky as isize - pad;
                                    let xx = j as isize + kx as isize - pad;
                                    if yy >= 0 && xx >= 0 && (yy as usize) < h && (xx as usize) < w {
                                        acc += layer.weight[[o, c, ky, kx]] * x[[c, yy as usize, xx as usize]];
                                    }
                                }
                            }
                        }
                        if let Some(bn) = &layer.batch_norm {
                            acc = bn.gamma[o] * (acc - bn.running_mean[o])
                                / (bn.running_var[o] + bn.epsilon).sqrt()
                                + bn.beta[o];
                        }
                        if let Some(act) = layer.activation {
                            acc = act.apply(acc);
                        }
                        y[[o, i, j]] = acc;
                    }
                }
            }
            x = y;
        }
        x.insert_axis(Axis(0))
    }

    fn window(h: usize, w: usize, seed: u32) -> Array4<f32> {
        Array4::from_shape_vec((1, 1, h, w), values(h * w, seed)).expect("window")
    }

    fn max_abs_diff(a: &Array4<f32>, b: &Array4<f32>) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn matches_direct_convolution() {
        let network = three_layer_network();
        let input = window(9, 7, 42);
        let expected = direct_forward(&network, &input);
        let backend = backend(network, 9, 7, 10);
        let actual = backend.infer(input.view()).expect("infer");
        assert_eq!(actual.dim(), (1, 1, 9, 7));
        assert!(max_abs_diff(&actual, &expected) < 1e-4);
        assert_eq!(backend.derived_table_count(), 0);
    }

    #[test]
    fn chunk_size_does_not_change_result() {
        let input = window(8, 8, 7);
        let a = backend(three_layer_network(), 8, 8, 1).infer(input.view()).expect("infer");
        let b = backend(three_layer_network(), 8, 8, 1_000).infer(input.view()).expect("infer");
        assert!(max_abs_diff(&a, &b) < 1e-6);
    }

    #[test]
    fn identity_kernel_returns_input() {
        let input = window(6, 5, 3);
        let output = backend(identity_network(), 6, 5, 4).infer(input.view()).expect("infer");
        assert_eq!(output, input);
    }

    #[test]
    fn other_tile_sizes_use_a_cached_derived_table() {
        let network = three_layer_network();
        let input = window(11, 6, 9);
        let expected = direct_forward(&network, &input);
        let backend = backend(network, 8, 8, 16);

        let first = backend.infer(input.view()).expect("infer");
        assert!(max_abs_diff(&first, &expected) < 1e-4);
        assert_eq!(backend.derived_table_count(), 3);

        backend.infer(input.view()).expect("infer again");
        assert_eq!(backend.derived_table_count(), 3);
    }

    #[test]
    fn missing_table_is_configuration_error() {
        let network = three_layer_network();
        let mut tables = IndexTables::build_for(&network, 4, 4).expect("tables");
        tables.take("dncnn.1");
        let err = PortableBackend::new(network, tables, PortableOptions::default())
            .err()
            .expect("should fail");
        assert!(err.is_configuration());
        assert!(err.to_string().contains("dncnn.1"));
    }

    #[test]
    fn mismatched_table_geometry_is_rejected() {
        let network = three_layer_network();
        let mut tables = IndexTables::build_for(&network, 4, 4).expect("tables");
        let wrong = TableGeometry {
            channels: 5,
            height: 4,
            width: 4,
            kernel: 3,
            pad: 1,
        };
        tables.insert("dncnn.2", IndexTable::build(wrong).expect("table"));
        let err = PortableBackend::new(network, tables, PortableOptions::default())
            .err()
            .expect("should fail");
        assert!(err.to_string().contains("dncnn.2"));
    }

    #[test]
    fn multi_channel_window_is_rejected() {
        let backend = backend(identity_network(), 4, 4, 8);
        let input = Array4::<f32>::zeros((1, 2, 4, 4));
        assert!(matches!(
            backend.infer(input.view()),
            Err(InferenceError::Failed(_))
        ));
    }

    fn dncnn_17(channels: usize) -> Network {
        let mut p = ParameterSet::default();
        let mut names = Vec::new();
        for i in 0..17 {
            let c_in = if i == 0 { 1 } else { channels };
            let c_out = if i == 16 { 1 } else { channels };
            p.insert(format!("dncnn.{i}.weight"), ArrayD::zeros(IxDyn(&[c_out, c_in, 3, 3])));
            names.push(format!("dncnn.{i}"));
        }
        Network::from_parameters(&p, &names, Architecture::default()).expect("network")
    }

    #[test]
    fn default_budget_runs_full_size_tiles_one_at_a_time() {
        let network = dncnn_17(64);
        let footprint = tile_footprint_bytes(&network, 2020, 2020, DEFAULT_GEMM_CHUNK_ROWS);
        // input, padded copy and output of a 64-channel layer
        assert!(footprint > 3 * 64 * 2020 * 2020 * 4);
        assert!(footprint < 3_300_000_000);

        let runtime = RuntimeConfig {
            workers: 16,
            ..RuntimeConfig::default()
        };
        let options = PortableOptions::from(&runtime);
        assert_eq!(options.max_concurrency, 16);
        assert_eq!(
            concurrency_within_budget(options.memory_budget_bytes, footprint, options.max_concurrency),
            1
        );
        assert_eq!(
            concurrency_within_budget(PortableOptions::default().memory_budget_bytes, footprint, 9),
            1
        );
    }

    #[test]
    fn budget_caps_reported_concurrency() {
        let network = three_layer_network();
        let tables = IndexTables::build_for(&network, 8, 8).expect("tables");
        let footprint = tile_footprint_bytes(&network, 8, 8, 16);
        let options = PortableOptions {
            chunk_rows: 16,
            max_concurrency: 8,
            memory_budget_bytes: footprint * 3 + 1,
        };
        let backend = PortableBackend::new(network, tables, options).expect("backend");
        assert_eq!(backend.max_concurrency(), 3);

        assert_eq!(concurrency_within_budget(1, footprint, 8), 1);
        assert_eq!(concurrency_within_budget(0, footprint, 8), 8);
        assert_eq!(concurrency_within_budget(usize::MAX, footprint, 0), 1);
    }
}
