//! Engine configuration
//!
//! Values are layered, later sources winning:
//!
//! 1. built-in defaults
//! 2. a TOML file: the explicit path, else `STRAND_CONFIG_PATH`, else
//!    `./strand.toml` when it exists
//! 3. `STRAND__SECTION__KEY` environment variables (after `.env` is loaded)
//! 4. overrides set on the [`ConfigBuilder`]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::scheduler::DEFAULT_MAX_NON_BLOCKING_ACTIONS;

const CONFIG_PATH_VAR: &str = "STRAND_CONFIG_PATH";
const DEFAULT_CONFIG_FILE: &str = "strand.toml";
const ENV_PREFIX: &str = "STRAND";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker tasks running threads
    pub workers: usize,
    /// Actions a thread runs before yielding its worker
    pub max_non_blocking_actions: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_non_blocking_actions: DEFAULT_MAX_NON_BLOCKING_ACTIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// How long a process start request may take before it times out
    pub start_timeout_ms: u64,
    /// Ask targets to echo a correlation key in process end notifications
    pub use_notify_key: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 60_000,
            use_notify_key: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCacheConfig {
    pub enabled: bool,
    /// Documents kept before the least recently used is evicted
    pub capacity: usize,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestcaseConfig {
    pub log_elapsed_time: bool,
    pub log_num_starts: bool,
    pub log_start_stop: bool,
}

impl Default for TestcaseConfig {
    fn default() -> Self {
        Self {
            log_elapsed_time: true,
            log_num_starts: true,
            log_start_stop: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub process: ProcessConfig,
    pub file_cache: FileCacheConfig,
    pub testcase: TestcaseConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load from the default sources with no overrides
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    workers: Option<usize>,
    start_timeout_ms: Option<u64>,
    log_level: Option<String>,
    skip_env: bool,
}

impl ConfigBuilder {
    /// Read this file instead of searching for one
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn start_timeout_ms(mut self, timeout: u64) -> Self {
        self.start_timeout_ms = Some(timeout);
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Ignore `.env` and `STRAND__*` variables
    pub fn without_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    fn config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            return Some(path.clone());
        }
        if !self.skip_env {
            if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
                return Some(PathBuf::from(path));
            }
        }
        let default = Path::new(DEFAULT_CONFIG_FILE);
        default.exists().then(|| default.to_path_buf())
    }

    pub fn build(self) -> Result<Config> {
        if !self.skip_env {
            // A missing .env file is fine
            let _ = dotenvy::dotenv();
        }

        let mut builder = config::Config::builder();

        if let Some(path) = self.config_file() {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            tracing::debug!(path = %path.display(), "Loading config file");
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        if !self.skip_env {
            builder = builder.add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        if let Some(workers) = self.workers {
            builder = builder.set_override("scheduler.workers", workers as i64)?;
        }
        if let Some(timeout) = self.start_timeout_ms {
            builder = builder.set_override("process.start_timeout_ms", timeout as i64)?;
        }
        if let Some(level) = self.log_level {
            builder = builder.set_override("logging.level", level)?;
        }

        let config: Config = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        if config.scheduler.workers == 0 {
            anyhow::bail!("scheduler.workers must be at least 1");
        }
        Ok(config)
    }
}
