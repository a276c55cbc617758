//! ONNX Runtime backend: CUDA EP, TensorRT EP, CPU fallback and IoBinding.
//!
//! The network is exported in memory (see [`super::onnx`]) and committed to
//! a single `ort::Session`. The execution device is resolved once in
//! [`AcceleratedBackend::new`] and reused for every tile.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use ndarray::{Array4, ArrayD, ArrayView4, Ix4};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use tracing::{debug, error, info, warn};

use super::onnx::{self, ExportedModel, INPUT_NAME, OUTPUT_NAME};
use super::{ExecutionDevice, InferenceBackend};
use crate::config::RuntimeConfig;
use crate::error::InferenceError;
use crate::network::Network;

/// Runtime messages that mean the device ran out of memory.
const ALLOCATION_FAILURE_MARKERS: &[&str] = &[
    "out of memory",
    "failed to allocate",
    "cudnn_status_alloc_failed",
    "cudaerrormemoryallocation",
    "cuda_error_out_of_memory",
    "bad_alloc",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratedOptions {
    pub device: ExecutionDevice,
    pub use_iobinding: bool,
    pub trt_cache_dir: PathBuf,
}

impl Default for AcceleratedOptions {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for AcceleratedOptions {
    fn from(runtime: &RuntimeConfig) -> Self {
        Self {
            device: runtime.device,
            use_iobinding: runtime.use_iobinding,
            trt_cache_dir: runtime.trt_cache_dir.clone(),
        }
    }
}

pub struct AcceleratedBackend {
    session: Mutex<Session>,
    device: ExecutionDevice,
    use_iobinding: bool,
    model_hash: String,
    live_leases: AtomicUsize,
}

impl AcceleratedBackend {
    pub fn new(network: &Network, options: AcceleratedOptions) -> Result<Self> {
        let model = onnx::export(network);
        let device = resolve_device(options.device);
        // IoBinding only pays off when outputs stay on a device allocator.
        let use_iobinding = options.use_iobinding && device != ExecutionDevice::Cpu;

        debug!(
            layers = network.layers().len(),
            parameters = network.parameter_count(),
            model_bytes = model.bytes.len(),
            model_hash = model.short_hash(),
            requested = %options.device,
            %device,
            use_iobinding,
            "Building accelerated backend"
        );

        let session = build_session(&model, device, &options.trt_cache_dir)?;

        info!(%device, model_hash = model.short_hash(), "Accelerated backend ready");

        Ok(Self {
            session: Mutex::new(session),
            device,
            use_iobinding,
            model_hash: model.hash,
            live_leases: AtomicUsize::new(0),
        })
    }

    /// The device chosen at construction; never `Auto`.
    pub fn device(&self) -> ExecutionDevice {
        self.device
    }

    pub fn model_hash(&self) -> &str {
        &self.model_hash
    }

    /// Tiles currently holding device-resident values.
    pub fn live_leases(&self) -> usize {
        self.live_leases.load(Ordering::Acquire)
    }

    fn run_tile(&self, window: ArrayView4<'_, f32>) -> Result<ArrayD<f32>> {
        // Declared first so it is dropped after every device value below.
        let _lease = DeviceLease::acquire(&self.live_leases);

        let input_tensor = Tensor::from_array(window.to_owned())?;
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if self.use_iobinding {
            run_with_iobinding(&mut session, &input_tensor)
        } else {
            let outputs = session.run(ort::inputs![INPUT_NAME => &input_tensor])?;
            let output_view = outputs[OUTPUT_NAME].try_extract_array::<f32>()?;
            Ok(output_view.to_owned())
        }
    }
}

impl InferenceBackend for AcceleratedBackend {
    fn infer(&self, window: ArrayView4<'_, f32>) -> Result<Array4<f32>, InferenceError> {
        let output = self.run_tile(window).map_err(classify_failure)?;
        let output = output
            .into_dimensionality::<Ix4>()
            .context("accelerated output is not 4-dimensional")?;
        Ok(output)
    }

    fn name(&self) -> &str {
        "accelerated"
    }
}

/// Scoped ownership of one tile's device-resident values. The counter is
/// decremented on every exit path, including errors and panics.
pub(crate) struct DeviceLease<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> DeviceLease<'a> {
    pub(crate) fn acquire(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for DeviceLease<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

fn run_with_iobinding(session: &mut Session, input_tensor: &Tensor<f32>) -> Result<ArrayD<f32>> {
    let mut binding = session.create_binding()?;
    binding.bind_input(INPUT_NAME, input_tensor)?;
    binding.bind_output_to_device(OUTPUT_NAME, &session.allocator().memory_info())?;
    let outputs = session.run_binding(&binding)?;
    let output_view = outputs[OUTPUT_NAME].try_extract_array::<f32>()?;
    Ok(output_view.to_owned())
}

fn classify_failure(error: anyhow::Error) -> InferenceError {
    let message = format!("{error:#}");
    if is_allocation_failure(&message) {
        InferenceError::ResourceExhausted(message)
    } else {
        InferenceError::Failed(error)
    }
}

pub(crate) fn is_allocation_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ALLOCATION_FAILURE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Resolve `Auto` by probing the CUDA EP. Explicit devices are kept; if they
/// cannot be registered, session construction fails.
pub fn resolve_device(requested: ExecutionDevice) -> ExecutionDevice {
    match requested {
        ExecutionDevice::Auto => {
            if CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                ExecutionDevice::Cuda
            } else {
                warn!("CUDA EP is not available; the accelerated backend will run on CPU");
                ExecutionDevice::Cpu
            }
        }
        explicit => explicit,
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                stats.file_count += 1;
                stats.total_bytes += meta.len();
            }
        }
    }

    stats
}

/// Engines are cached per exported model so weight changes never reuse a
/// stale engine.
pub fn trt_cache_dir_for(base_dir: &Path, model: &ExportedModel) -> PathBuf {
    base_dir.join(model.short_hash())
}

/// Build an `ort::Session` for `device` from in-memory model bytes.
///
/// - `Tensorrt`: TRT EP with engine caching, then CUDA EP as fallback.
/// - `Cuda`: CUDA EP; registration failure is an error.
/// - `Cpu`: no execution providers.
fn build_session(model: &ExportedModel, device: ExecutionDevice, trt_cache_root: &Path) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match device {
        ExecutionDevice::Tensorrt => {
            let cache_dir = trt_cache_dir_for(trt_cache_root, model);
            if let Err(e) = std::fs::create_dir_all(&cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let cache_path = cache_dir.to_string_lossy().to_string();
            let before = cache_stats(&cache_dir);
            let started = Instant::now();

            info!(
                cache_dir = %cache_dir.display(),
                cache_files = before.file_count,
                cache_bytes = before.total_bytes,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let (stop_tx, stop_rx) = channel::<()>();
            let progress_thread = thread::spawn(move || {
                let tick = Duration::from_secs(15);
                let mut elapsed = 15_u64;
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            info!(elapsed_secs = elapsed, "TensorRT session initialization still in progress");
                            elapsed += 15;
                        }
                    }
                }
            });

            // TRT EP fails at runtime without libnvinfer; the CUDA EP keeps inference on the GPU.
            let session_result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_memory(&model.bytes)
                .context("Failed to build TensorRT session from exported model");

            let _ = stop_tx.send(());
            let _ = progress_thread.join();

            let elapsed = started.elapsed().as_secs_f64();
            let after = cache_stats(&cache_dir);
            match session_result {
                Ok(session) => {
                    info!(
                        elapsed_secs = elapsed,
                        cache_updated = after.total_bytes != before.total_bytes,
                        cache_files = after.file_count,
                        cache_bytes = after.total_bytes,
                        "TensorRT session ready"
                    );
                    session
                }
                Err(error_value) => {
                    error!(
                        elapsed_secs = elapsed,
                        cache_dir = %cache_dir.display(),
                        error = %error_value,
                        "TensorRT session initialization failed"
                    );
                    return Err(error_value);
                }
            }
        }
        ExecutionDevice::Cuda => {
            debug!(device = "cuda", "Building session with CUDA EP");
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build().error_on_failure()])?
                .commit_from_memory(&model.bytes)
                .context("Failed to build CUDA session from exported model")?
        }
        ExecutionDevice::Cpu => {
            debug!(device = "cpu", "Building session on the CPU provider");
            builder
                .commit_from_memory(&model.bytes)
                .context("Failed to build CPU session from exported model")?
        }
        ExecutionDevice::Auto => bail!("execution device must be resolved before building a session"),
    };

    Ok(session)
}
