use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::BackoffPolicy;
use crate::OrchestratorError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Parallel phase settings
    pub orchestrator: OrchestratorConfig,

    /// Recovery pass settings
    pub retry: RetryConfig,

    /// Application settings
    pub app: AppConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent worker slots (host parallelism if not set)
    pub pool_size: Option<usize>,

    /// Jobs handed to a worker per dispatch
    pub batch_size: usize,

    /// Wall-clock budget for one dispatched batch
    pub per_worker_deadline_ms: u64,

    /// Re-run failed jobs sequentially after the parallel phase
    pub retry_failed: bool,

    /// How workers report results back to their supervisor
    pub reporting: ReportingMode,
}

/// How a worker's results reach the coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportingMode {
    /// One message at batch end; a timeout discards the whole batch
    #[default]
    Aggregated,
    /// One message per job; a timeout only discards unfinished jobs.
    ///
    /// A job finishing while its worker is being aborted can still be recorded as a
    /// timeout even though its side effects happened; the retry pass re-runs it.
    Streaming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Invocations per failed job during the retry pass
    pub attempts: u32,

    /// Optional cap per retry attempt (no deadline if unset)
    pub attempt_deadline_ms: Option<u64>,

    /// Delay policy between attempts of the same job
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Default command run per job, `{}` replaced by the job id
    pub command: Vec<String>,

    /// Default output format
    pub default_output_format: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool_size: None,
            batch_size: 1,
            per_worker_deadline_ms: 600_000,
            retry_failed: true,
            reporting: ReportingMode::Aggregated,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 1,
            attempt_deadline_ms: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            default_output_format: "text".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Pool size to use, falling back to the host's available parallelism
    pub fn effective_pool_size(&self) -> usize {
        self.pool_size.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.per_worker_deadline_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), OrchestratorError> {
        if self.batch_size == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.pool_size == Some(0) {
            return Err(OrchestratorError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.per_worker_deadline_ms == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "per_worker_deadline_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl RetryConfig {
    pub fn attempt_deadline(&self) -> Option<Duration> {
        self.attempt_deadline_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> std::result::Result<(), OrchestratorError> {
        if self.attempts == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "retry.attempts must be at least 1".to_string(),
            ));
        }
        if self.attempt_deadline_ms == Some(0) {
            return Err(OrchestratorError::InvalidConfig(
                "retry.attempt_deadline_ms must be positive".to_string(),
            ));
        }
        self.backoff.validate()
    }
}

impl Config {
    /// Load configuration from `path`, the local directory or the user config
    /// directory, writing a default file when none exists yet
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };

        if config_path.exists() {
            let content = fs_err::read_to_string(&config_path)
                .context("Failed to read config file")?;

            let config: Config = serde_yaml::from_str(&content)
                .context("Failed to parse config file")?;

            config.validate()?;
            tracing::debug!("Loaded configuration from {}", config_path.display());
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(&config_path)?;
            tracing::info!("Wrote default configuration to {}", config_path.display());
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs_err::create_dir_all(parent)?;
            }
        }

        let content = serde_yaml::to_string(self)
            .context("Failed to serialize config")?;

        fs_err::write(config_path, content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let local_config = PathBuf::from("batch.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?;

        Ok(config_dir.join("batch-transcriptor").join("config.yaml"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.orchestrator.validate()?;
        self.retry.validate()?;
        Ok(())
    }

    /// Display current configuration
    pub fn display(&self) {
        let orchestrator = &self.orchestrator;
        println!("Current Configuration:");
        match orchestrator.pool_size {
            Some(size) => println!("  Pool Size: {}", size),
            None => println!("  Pool Size: auto ({})", orchestrator.effective_pool_size()),
        }
        println!("  Batch Size: {}", orchestrator.batch_size);
        println!("  Worker Deadline: {}ms", orchestrator.per_worker_deadline_ms);
        println!("  Reporting: {:?}", orchestrator.reporting);
        println!("  Retry Failed: {}", orchestrator.retry_failed);
        println!("  Retry Attempts: {}", self.retry.attempts);
        if let Some(cap) = self.retry.attempt_deadline_ms {
            println!("  Retry Attempt Cap: {}ms", cap);
        }
        if !self.app.command.is_empty() {
            println!("  Command: {}", self.app.command.join(" "));
        }
        println!("  Default Format: {}", self.app.default_output_format);
    }
}
