use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use fvcdenoise_core::artifacts::{save_layer_list, ArtifactFiles, ArtifactStore, IndexTables};
use fvcdenoise_core::backend::onnx;
use fvcdenoise_core::backend::{AcceleratedBackend, AcceleratedOptions, PortableBackend, PortableOptions};
use fvcdenoise_core::config::{config_path, data_dir, initialize_data_dir, resolve_relative_to, DenoiseConfig};
use fvcdenoise_core::image::{read_raw, write_raw_f32, RawFormat};
use fvcdenoise_core::logging::{self, FileSink, LogOptions, DEFAULT_LOG_FILTER};
use fvcdenoise_core::network::{Architecture, Network};
use fvcdenoise_core::verify::{compare_backends, synthetic_window};
use fvcdenoise_core::{Denoiser, ExecutionDevice, ModelSelector};

const DEFAULT_COMPARE_TOLERANCE: f32 = 1e-3;

#[derive(Parser)]
#[command(name = "fvcdenoise", about = "Patch-based DnCNN denoising for FVC images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Config file (default: <data-dir>/config.toml)")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Denoise a raw square image and write it as little-endian f32.
    Denoise(DenoiseArgs),
    /// Build the im2col index table file for the portable backend.
    ExportIndices(ExportIndicesArgs),
    /// Print the network resolved from the artifact directory.
    Inspect(ArtifactArgs),
    /// Run both backends on a synthetic window and report their difference.
    Compare(CompareArgs),
}

#[derive(Args, Default)]
struct ArtifactArgs {
    #[arg(long)]
    artifact_dir: Option<PathBuf>,
}

#[derive(Args, Default)]
struct DenoiseArgs {
    input: PathBuf,
    #[arg(short = 'o', long)]
    output: PathBuf,
    #[arg(long, default_value = "u16le", value_parser = parse_raw_format)]
    format: RawFormat,
    #[arg(long, value_parser = parse_selector)]
    model: Option<ModelSelector>,
    #[command(flatten)]
    artifacts: ArtifactArgs,
    #[arg(long)]
    patch_size: Option<usize>,
    #[arg(long)]
    padding: Option<usize>,
    #[arg(long, help = "auto, cuda, tensorrt or cpu")]
    device: Option<String>,
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args)]
struct ExportIndicesArgs {
    #[command(flatten)]
    artifacts: ArtifactArgs,
    #[arg(long, help = "Window edge length (default: patch_size + 2 * padding)")]
    tile_size: Option<usize>,
}

#[derive(Args)]
struct CompareArgs {
    #[command(flatten)]
    artifacts: ArtifactArgs,
    #[arg(long)]
    tile_size: Option<usize>,
    #[arg(long, default_value_t = DEFAULT_COMPARE_TOLERANCE)]
    tolerance: f32,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn parse_raw_format(value: &str) -> Result<RawFormat, String> {
    value.parse().map_err(|e: anyhow::Error| e.to_string())
}

fn parse_selector(value: &str) -> Result<ModelSelector, String> {
    value.parse().map_err(|e: anyhow::Error| e.to_string())
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_libs = fvcdenoise_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    fvcdenoise_core::runtime::log_runtime_lib_status(&runtime_libs);

    let cfg_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config_path(&resolved_data_dir));
    log_startup_metadata(&resolved_data_dir, &cfg_path);
    let config = load_config(&resolved_data_dir, &cfg_path, cli.config.is_some())?;

    match cli.command {
        Commands::Denoise(args) => run_denoise(&resolved_data_dir, config, args),
        Commands::ExportIndices(args) => run_export_indices(&resolved_data_dir, config, args),
        Commands::Inspect(args) => run_inspect(&resolved_data_dir, config, args),
        Commands::Compare(args) => run_compare(&resolved_data_dir, config, args),
    }
}

fn load_config(data_dir: &Path, cfg_path: &Path, explicit: bool) -> Result<DenoiseConfig> {
    if !explicit {
        if let Err(e) = initialize_data_dir(data_dir) {
            warn!(error = %e, "Failed to initialize data directory");
        }
    }
    DenoiseConfig::load_from_path(cfg_path)
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let plan = logging::plan(&LogOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        env_filter: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    });

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&plan.filters.console, "console"));

    let (file_layer, disabled) = match plan.file_sink {
        FileSink::Rolling { appender, .. } => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&plan.filters.file, "file"));
            (Some(layer), None)
        }
        FileSink::Disabled { dir, reason } => (None, Some((dir, reason))),
    };

    let subscriber = tracing_subscriber::registry().with(console_layer).with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
        return;
    }

    if let Some((dir, reason)) = disabled {
        warn!(
            attempted_log_dir = ?dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path, cfg_path: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

/// Apply `denoise` flags on top of the file config. Relative paths from the
/// config file resolve against the data directory.
fn apply_denoise_overrides(data_dir: &Path, mut config: DenoiseConfig, args: &DenoiseArgs) -> DenoiseConfig {
    config = resolve_paths(data_dir, config, &args.artifacts);
    if let Some(model) = args.model {
        config.model.selector = model;
    }
    if let Some(patch_size) = args.patch_size {
        config.tiling.patch_size = patch_size;
    }
    if let Some(padding) = args.padding {
        config.tiling.padding = padding;
    }
    if let Some(device) = args.device.as_deref() {
        config.runtime.device = ExecutionDevice::from_str_lossy(device);
    }
    if let Some(workers) = args.workers {
        config.runtime.workers = workers;
    }
    config
}

fn resolve_paths(data_dir: &Path, mut config: DenoiseConfig, artifacts: &ArtifactArgs) -> DenoiseConfig {
    config.model.artifact_dir = match &artifacts.artifact_dir {
        Some(dir) => dir.clone(),
        None => resolve_relative_to(data_dir, &config.model.artifact_dir),
    };
    config.runtime.trt_cache_dir = resolve_relative_to(data_dir, &config.runtime.trt_cache_dir);
    config
}

fn run_denoise(data_dir: &Path, config: DenoiseConfig, args: DenoiseArgs) -> Result<()> {
    let config = apply_denoise_overrides(data_dir, config, &args);
    let selector = config.model.selector;

    let image = read_raw(&args.input, args.format)?;
    info!(
        input = %args.input.display(),
        format = %args.format,
        height = image.nrows(),
        width = image.ncols(),
        "Read input image"
    );

    let started = Instant::now();
    let denoiser = Denoiser::open(selector, &config.model.artifact_dir, &config)?;
    let denoised = denoiser.denoise(image.view())?;
    write_raw_f32(&args.output, denoised.view())?;

    info!(
        output = %args.output.display(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Denoised image written"
    );
    Ok(())
}

fn load_network(config: &DenoiseConfig) -> Result<(ArtifactStore, Network)> {
    let store = ArtifactStore::new(&config.model.artifact_dir, ArtifactFiles::from(&config.model));
    let artifacts = store.load(ModelSelector::Accelerated)?;
    let network = Network::from_parameters(
        &artifacts.parameters,
        &artifacts.layer_names,
        Architecture::from(&config.model),
    )?;
    Ok((store, network))
}

fn run_export_indices(data_dir: &Path, config: DenoiseConfig, args: ExportIndicesArgs) -> Result<()> {
    let config = resolve_paths(data_dir, config, &args.artifacts);
    let tile_size = args.tile_size.unwrap_or_else(|| config.tiling.window_size());
    let (store, network) = load_network(&config)?;

    let layer_list_path = store.layer_list_path();
    if !layer_list_path.is_file() {
        save_layer_list(&layer_list_path, &network.layer_names())?;
        info!(path = %layer_list_path.display(), "Wrote derived layer list");
    }

    let tables = IndexTables::build_for(&network, tile_size, tile_size)
        .with_context(|| format!("failed to build index tables for {tile_size}x{tile_size} tiles"))?;
    let path = store.index_tables_path();
    tables.save(&path)?;
    info!(
        path = %path.display(),
        layers = tables.len(),
        tile_size,
        "Wrote im2col index tables"
    );
    Ok(())
}

fn run_inspect(data_dir: &Path, config: DenoiseConfig, args: ArtifactArgs) -> Result<()> {
    let config = resolve_paths(data_dir, config, &args);
    let (store, network) = load_network(&config)?;

    println!("artifacts: {}", store.dir().display());
    println!("{}", describe_network(&network));

    let exported = onnx::export(&network);
    let summary = onnx::summarize(&exported.bytes)?;
    println!(
        "onnx: opset {} | {} nodes | {} initializers | sha256 {}",
        summary.opset_version,
        summary.op_types.len(),
        summary.initializer_count,
        exported.short_hash()
    );
    Ok(())
}

fn describe_network(network: &Network) -> String {
    let mut lines = Vec::with_capacity(network.layers().len() + 1);
    for (index, layer) in network.layers().iter().enumerate() {
        lines.push(format!(
            "{index:>3} {:<24} {:>3} -> {:<3} k={} bias={} bn={} act={}",
            layer.name,
            layer.in_channels(),
            layer.out_channels(),
            layer.kernel_size(),
            if layer.bias.is_some() { "yes" } else { "no" },
            if layer.batch_norm.is_some() { "yes" } else { "no" },
            layer
                .activation
                .map_or_else(|| "none".to_string(), |a| format!("{a:?}").to_lowercase()),
        ));
    }
    lines.push(format!(
        "{} layers, {} parameters",
        network.layers().len(),
        network.parameter_count()
    ));
    lines.join("\n")
}

fn run_compare(data_dir: &Path, config: DenoiseConfig, args: CompareArgs) -> Result<()> {
    let config = resolve_paths(data_dir, config, &args.artifacts);
    let tile_size = args.tile_size.unwrap_or_else(|| config.tiling.window_size());

    let store = ArtifactStore::new(&config.model.artifact_dir, ArtifactFiles::from(&config.model));
    let artifacts = store.load(ModelSelector::Portable)?;
    let network = Network::from_parameters(
        &artifacts.parameters,
        &artifacts.layer_names,
        Architecture::from(&config.model),
    )?;
    let tables = artifacts.index_tables.unwrap_or_default();

    let accelerated = AcceleratedBackend::new(&network, AcceleratedOptions::from(&config.runtime))?;
    let portable = PortableBackend::new(network, tables, PortableOptions::from(&config.runtime))?;

    let window = synthetic_window(tile_size, args.seed);
    let diff = compare_backends(&accelerated, &portable, window.view(), args.tolerance)?;
    println!(
        "max abs diff {diff:.3e} (tolerance {:.1e}, device {}, {tile_size}x{tile_size})",
        args.tolerance,
        accelerated.device()
    );
    Ok(())
}
