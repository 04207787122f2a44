use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::batch::Job;
use crate::config::{Config, ReportingMode};
use crate::utils;

#[derive(Parser)]
#[command(
    name = "transcriptor-batch",
    about = "Batch Transcriptor - Run long transcription jobs across a bounded worker pool",
    version,
    long_about = "Runs a command once per job (a media file, a video id, a caption key) across a bounded pool of workers. Each dispatched batch gets a hard deadline; failed jobs are retried sequentially once the parallel phase is over."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable progress indicators
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Configuration file (defaults to ./batch.yaml or the user config directory)
    #[arg(short, long, global = true, value_name = "FILE", env = "TRANSCRIPTOR_BATCH_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command for every job across the worker pool
    Run(RunArgs),

    /// Show or locate the configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Job ids to process
    #[arg(value_name = "JOB_ID")]
    pub jobs: Vec<String>,

    /// Read job ids from a file, one per line ('#' starts a comment)
    #[arg(short, long, value_name = "FILE")]
    pub jobs_file: Option<PathBuf>,

    /// Concurrent worker slots (default: host parallelism)
    #[arg(short, long, value_name = "N")]
    pub pool_size: Option<usize>,

    /// Jobs handed to a worker per dispatch
    #[arg(short, long, value_name = "N")]
    pub batch_size: Option<usize>,

    /// Deadline per dispatched batch in milliseconds
    #[arg(short, long, value_name = "MS")]
    pub deadline_ms: Option<u64>,

    /// Skip the sequential retry pass
    #[arg(long)]
    pub no_retry: bool,

    /// Attempts per failed job during the retry pass
    #[arg(long, value_name = "N")]
    pub retry_attempts: Option<u32>,

    /// Cap each retry attempt at this many milliseconds
    #[arg(long, value_name = "MS")]
    pub retry_deadline_ms: Option<u64>,

    /// Report each job as it finishes so a timeout only loses unfinished jobs
    #[arg(long)]
    pub streaming: bool,

    /// Output format
    #[arg(short, long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Write the run report to a file (prints to console if not specified)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Program and arguments to run per job; `{}` is replaced by the job id
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable summary
    Text,
    /// Full JSON run report
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => anyhow::bail!("Unknown output format: {}", other),
        }
    }
}

impl RunArgs {
    /// Layer command-line overrides on top of the loaded configuration
    pub fn apply_to(&self, config: &mut Config) -> Result<()> {
        let orchestrator = &mut config.orchestrator;
        if let Some(pool_size) = self.pool_size {
            orchestrator.pool_size = Some(pool_size);
        }
        if let Some(batch_size) = self.batch_size {
            orchestrator.batch_size = batch_size;
        }
        if let Some(deadline_ms) = self.deadline_ms {
            orchestrator.per_worker_deadline_ms = deadline_ms;
        }
        if self.no_retry {
            orchestrator.retry_failed = false;
        }
        if self.streaming {
            orchestrator.reporting = ReportingMode::Streaming;
        }
        if let Some(attempts) = self.retry_attempts {
            config.retry.attempts = attempts;
        }
        if let Some(cap) = self.retry_deadline_ms {
            config.retry.attempt_deadline_ms = Some(cap);
        }
        if !self.command.is_empty() {
            config.app.command = self.command.clone();
        }

        config.validate()
    }

    /// Jobs from the positional arguments followed by the jobs file
    pub fn load_jobs(&self) -> Result<Vec<Job>> {
        let mut ids = self.jobs.clone();

        if let Some(path) = &self.jobs_file {
            let content = fs_err::read_to_string(path)
                .with_context(|| format!("Failed to read jobs file {}", path.display()))?;
            ids.extend(utils::parse_job_lines(&content));
        }

        Ok(ids.into_iter().map(Job::new).collect())
    }

    /// Output format from the flag, else the configured default
    pub fn output_format(&self, config: &Config) -> Result<OutputFormat> {
        match self.format {
            Some(format) => Ok(format),
            None => config.app.default_output_format.parse(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_run_with_trailing_command() {
        let cli = Cli::try_parse_from([
            "transcriptor-batch",
            "run",
            "a.mp4",
            "b.mp4",
            "--pool-size",
            "3",
            "--no-retry",
            "--",
            "transcribe",
            "{}",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.jobs, vec!["a.mp4", "b.mp4"]);
        assert_eq!(args.pool_size, Some(3));
        assert!(args.no_retry);
        assert_eq!(args.command, vec!["transcribe", "{}"]);
    }

    #[test]
    fn test_overrides_apply_and_validate() {
        let args = RunArgs {
            jobs: Vec::new(),
            jobs_file: None,
            pool_size: Some(2),
            batch_size: Some(5),
            deadline_ms: Some(1_000),
            no_retry: true,
            retry_attempts: None,
            retry_deadline_ms: Some(200),
            streaming: true,
            format: None,
            output: None,
            command: vec!["echo".to_string()],
        };

        let mut config = Config::default();
        args.apply_to(&mut config).unwrap();
        assert_eq!(config.orchestrator.pool_size, Some(2));
        assert_eq!(config.orchestrator.batch_size, 5);
        assert_eq!(config.orchestrator.per_worker_deadline_ms, 1_000);
        assert!(!config.orchestrator.retry_failed);
        assert_eq!(config.orchestrator.reporting, ReportingMode::Streaming);
        assert_eq!(config.retry.attempt_deadline_ms, Some(200));
        assert_eq!(config.app.command, vec!["echo"]);
        assert_eq!(args.output_format(&config).unwrap(), OutputFormat::Text);

        let bad = RunArgs {
            batch_size: Some(0),
            ..args
        };
        assert!(bad.apply_to(&mut Config::default()).is_err());
    }
}
