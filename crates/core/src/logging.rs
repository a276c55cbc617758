//! Filter selection and the rolling file sink used by the CLI subscriber.

use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "fvcdenoise";
const LOG_FILE_SUFFIX: &str = "log";

/// Per-tile timings always reach the log file, even when the console only
/// shows `info`.
const TILE_DETAIL_DIRECTIVE: &str = "fvcdenoise_core::stitch=debug";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_filter: Option<String>,
    pub env_filter: Option<String>,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_filter: None,
            env_filter: None,
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

/// `EnvFilter` directive strings for each sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogFilters {
    /// `--log-filter` wins, then `-v`/`-vv`, then `RUST_LOG`, then `info`.
    /// Only an implicit choice (no flag, no `-v`) gets the noise filter and
    /// the tile detail directive.
    pub fn compose(options: &LogOptions) -> Self {
        let (base, implicit) = match (&options.cli_filter, options.verbose) {
            (Some(filter), _) => (filter.clone(), false),
            (None, v) if v >= 2 => ("trace".to_string(), false),
            (None, 1) => ("debug".to_string(), false),
            (None, _) => (
                options
                    .env_filter
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
                true,
            ),
        };

        if !implicit {
            return Self {
                console: base.clone(),
                file: base,
            };
        }

        let noise: Vec<&str> = options
            .noise_filter
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .collect();
        let tile_target = TILE_DETAIL_DIRECTIVE.split('=').next().unwrap_or_default();
        let file_noise = noise
            .iter()
            .copied()
            .filter(|d| d.split('=').next().map(str::trim) != Some(tile_target))
            .chain(std::iter::once(TILE_DETAIL_DIRECTIVE));

        Self {
            console: join_directives(noise.iter().copied(), &base),
            file: join_directives(file_noise, &base),
        }
    }
}

fn join_directives<'a>(prefix: impl Iterator<Item = &'a str>, base: &'a str) -> String {
    prefix
        .chain(std::iter::once(base))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug)]
pub enum FileSink {
    Rolling {
        dir: PathBuf,
        appender: RollingFileAppender,
    },
    /// Console-only logging; `dir` is the directory that was attempted.
    Disabled {
        dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSink {
    /// Daily rolling files under `<data_dir>/logs`, keeping `retention_files`
    /// (0 means the default).
    pub fn open(data_dir: Option<&Path>, retention_files: usize) -> Self {
        let Some(data_dir) = data_dir else {
            return Self::Disabled {
                dir: None,
                reason: "no data directory configured".to_string(),
            };
        };

        let dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
        if let Err(error) = fs::create_dir_all(&dir) {
            return Self::Disabled {
                dir: Some(dir),
                reason: format!("cannot create log directory: {error}"),
            };
        }

        let retention = if retention_files == 0 {
            DEFAULT_LOG_RETENTION_FILES
        } else {
            retention_files
        };
        let built = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix(LOG_FILE_SUFFIX)
            .max_log_files(retention)
            .build(&dir);
        match built {
            Ok(appender) => Self::Rolling { dir, appender },
            Err(error) => Self::Disabled {
                dir: Some(dir),
                reason: format!("cannot open rolling log file: {error}"),
            },
        }
    }
}

#[derive(Debug)]
pub struct LogPlan {
    pub filters: LogFilters,
    pub file_sink: FileSink,
}

pub fn plan(options: &LogOptions) -> LogPlan {
    LogPlan {
        filters: LogFilters::compose(options),
        file_sink: FileSink::open(options.data_dir.as_deref(), options.retention_files),
    }
}
