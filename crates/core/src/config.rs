use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::{ExecutionDevice, ModelSelector};
use crate::error::DenoiseError;
use crate::network::Activation;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "FVCDENOISE_DATA_DIR";

/// Edge length of the FVC raster.
pub const FVC_IMAGE_SIZE: usize = 6000;
pub const DEFAULT_PATCH_SIZE: usize = 2000;
pub const DEFAULT_PADDING: usize = 10;
pub const DEFAULT_GEMM_CHUNK_ROWS: usize = 16_384;
/// Enough for one full-size 64-channel DnCNN tile (about 3 GB) on the
/// portable backend, so default runs process tiles one after another.
pub const DEFAULT_PORTABLE_MEMORY_MB: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DenoiseConfig {
    pub model: ModelConfig,
    pub tiling: TilingConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub selector: ModelSelector,
    pub artifact_dir: PathBuf,
    pub parameters: String,
    pub layer_list: String,
    pub index_tables: String,
    pub activation: Activation,
    /// Apply the activation after the last layer too. DnCNN leaves the
    /// residual layer linear.
    pub final_activation: bool,
    pub batch_norm_epsilon: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TilingConfig {
    pub image_size: usize,
    pub patch_size: usize,
    pub padding: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub device: ExecutionDevice,
    /// Tile worker threads; `0` uses the available parallelism.
    pub workers: usize,
    pub use_iobinding: bool,
    pub trt_cache_dir: PathBuf,
    pub gemm_chunk_rows: usize,
    /// Host memory the portable backend may spend on concurrent tiles;
    /// `0` lets `workers` alone decide.
    pub portable_memory_mb: usize,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            tiling: TilingConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            selector: ModelSelector::default(),
            artifact_dir: PathBuf::from("models"),
            parameters: "dncnn_2k_params.safetensors".to_string(),
            layer_list: "dncnn_2k_layers.json".to_string(),
            index_tables: "im2col_2k_indices.safetensors".to_string(),
            activation: Activation::Relu,
            final_activation: false,
            batch_norm_epsilon: 1e-5,
        }
    }
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            image_size: FVC_IMAGE_SIZE,
            patch_size: DEFAULT_PATCH_SIZE,
            padding: DEFAULT_PADDING,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: ExecutionDevice::default(),
            workers: 0,
            use_iobinding: true,
            trt_cache_dir: PathBuf::from("trt_cache"),
            gemm_chunk_rows: DEFAULT_GEMM_CHUNK_ROWS,
            portable_memory_mb: DEFAULT_PORTABLE_MEMORY_MB,
        }
    }
}

impl TilingConfig {
    /// Reject patch/padding combinations before any artifact is touched.
    pub fn validate(&self) -> Result<(), DenoiseError> {
        if self.image_size == 0 {
            return Err(DenoiseError::config("image_size must be positive"));
        }
        if self.patch_size == 0 {
            return Err(DenoiseError::config("patch_size must be positive"));
        }
        if self.patch_size > self.image_size {
            return Err(DenoiseError::config(format!(
                "patch_size ({}) exceeds image size ({})",
                self.patch_size, self.image_size
            )));
        }
        if self.padding >= self.patch_size {
            return Err(DenoiseError::config(format!(
                "padding ({}) must be smaller than patch_size ({})",
                self.padding, self.patch_size
            )));
        }
        Ok(())
    }

    /// Edge length of a full-size tile window including its padding.
    pub fn window_size(&self) -> usize {
        self.patch_size + 2 * self.padding
    }
}

impl RuntimeConfig {
    pub fn resolved_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl DenoiseConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. FVCDENOISE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml if either is missing.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        DenoiseConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = DenoiseConfig::default();

        assert_eq!(cfg.model.selector, ModelSelector::Accelerated);
        assert_eq!(cfg.model.artifact_dir, PathBuf::from("models"));
        assert_eq!(cfg.model.activation, Activation::Relu);
        assert!(!cfg.model.final_activation);
        assert_eq!(cfg.tiling.image_size, 6000);
        assert_eq!(cfg.tiling.patch_size, 2000);
        assert_eq!(cfg.tiling.padding, 10);
        assert_eq!(cfg.runtime.device, ExecutionDevice::Auto);
        assert_eq!(cfg.runtime.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.runtime.portable_memory_mb, 4096);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = DenoiseConfig::default();
        original.model.activation = Activation::LeakyRelu(0.1);
        original.model.selector = ModelSelector::Portable;
        original.runtime.device = ExecutionDevice::Tensorrt;
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: DenoiseConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_keys() {
        let raw = "[tiling]\npatch_size = 1500\n\n[model]\nselector = \"portable\"\n";
        let decoded: DenoiseConfig = toml::from_str(raw).expect("deserialize config");
        assert_eq!(decoded.tiling.patch_size, 1500);
        assert_eq!(decoded.tiling.padding, DEFAULT_PADDING);
        assert_eq!(decoded.model.selector, ModelSelector::Portable);
        assert_eq!(decoded.runtime, RuntimeConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded = DenoiseConfig::load_from_path(&temp.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, DenoiseConfig::default());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[tiling\npatch_size = ").expect("write config");
        let err = DenoiseConfig::load_from_path(&path).expect_err("parse should fail");
        assert!(format!("{err:#}").contains("failed to parse config TOML"));
    }

    #[test]
    fn tiling_validation_rejects_bad_geometry() {
        let zero = TilingConfig {
            patch_size: 0,
            ..Default::default()
        };
        assert!(zero.validate().unwrap_err().is_configuration());

        let too_big = TilingConfig {
            patch_size: 7000,
            ..Default::default()
        };
        assert!(too_big.validate().is_err());

        let wide_padding = TilingConfig {
            patch_size: 16,
            padding: 16,
            image_size: 64,
        };
        assert!(wide_padding.validate().is_err());

        assert!(TilingConfig::default().validate().is_ok());
        assert_eq!(TilingConfig::default().window_size(), 2020);
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[tiling]\npatch_size = 1000\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn initialize_writes_default_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("nested");
        initialize_data_dir(&dir).expect("initialize data dir");
        let loaded = DenoiseConfig::load_from_path(&config_path(&dir)).expect("load config");
        assert_eq!(loaded, DenoiseConfig::default());
    }

    #[test]
    fn resolve_relative_to_handles_both_forms() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }
}
