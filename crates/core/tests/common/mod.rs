#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use fvcdenoise_core::artifacts::{save_layer_list, IndexTables, ParameterSet};
use fvcdenoise_core::network::{Architecture, Network};
use fvcdenoise_core::{InferenceBackend, InferenceError};
use ndarray::{Array4, ArrayD, ArrayView4, IxDyn};

/// Passes windows through unchanged and counts calls.
#[derive(Default)]
pub struct CountingIdentity {
    pub calls: AtomicUsize,
}

impl CountingIdentity {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceBackend for CountingIdentity {
    fn infer(&self, window: ArrayView4<'_, f32>) -> Result<Array4<f32>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(window.to_owned())
    }

    fn max_concurrency(&self) -> usize {
        4
    }

    fn name(&self) -> &str {
        "counting-identity"
    }
}

/// Single 3x3 layer with the given kernel.
pub fn single_layer(kernel: [[f32; 3]; 3]) -> ParameterSet {
    let mut weight = ArrayD::zeros(IxDyn(&[1, 1, 3, 3]));
    for (r, row) in kernel.iter().enumerate() {
        for (c, &v) in row.iter().enumerate() {
            weight[[0, 0, r, c]] = v;
        }
    }
    let mut parameters = ParameterSet::default();
    parameters.insert("conv.weight", weight);
    parameters
}

pub fn identity_parameters() -> ParameterSet {
    single_layer([[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]])
}

pub fn box_blur_parameters() -> ParameterSet {
    single_layer([[1.0 / 9.0; 3]; 3])
}

/// Write parameters, layer list and index tables sized for `window` into `dir`.
pub fn write_artifacts(dir: &Path, parameters: &ParameterSet, window: usize) {
    let names = parameters.derive_layer_names();
    let network =
        Network::from_parameters(parameters, &names, Architecture::default()).expect("network");
    parameters
        .save(&dir.join("dncnn_2k_params.safetensors"))
        .expect("write parameters");
    save_layer_list(&dir.join("dncnn_2k_layers.json"), &names).expect("write layer list");
    IndexTables::build_for(&network, window, window)
        .expect("index tables")
        .save(&dir.join("im2col_2k_indices.safetensors"))
        .expect("write index tables");
}
