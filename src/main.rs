use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use batch_transcriptor::cli::{Cli, Commands, RunArgs};
use batch_transcriptor::orchestrator::Orchestrator;
use batch_transcriptor::output;
use batch_transcriptor::processors::CommandProcessor;
use batch_transcriptor::Config;

/// Exit status when the run finished but some jobs are still failed
const EXIT_JOBS_FAILED: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_json);

    let config = Config::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Run(args) => run(args, config, cli.quiet).await,
        Commands::Config { show } => {
            if show {
                config.display();
            } else {
                match &cli.config {
                    Some(path) => println!("Configuration file: {}", path.display()),
                    None => println!("Configuration file: {}", Config::config_path()?.display()),
                }
                println!("Use --show to print the current values.");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "batch_transcriptor=debug,transcriptor_batch=debug"
    } else {
        "batch_transcriptor=info,transcriptor_batch=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    // Logs go to stderr so a report printed on stdout stays machine-readable.
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(args: RunArgs, mut config: Config, quiet: bool) -> Result<ExitCode> {
    args.apply_to(&mut config)?;
    let format = args.output_format(&config)?;

    let jobs = args.load_jobs()?;
    if jobs.is_empty() {
        tracing::warn!("No jobs given; pass job ids or --jobs-file");
    }

    let processor = CommandProcessor::new(config.app.command.clone())?;
    tracing::info!(
        program = processor.program(),
        jobs = jobs.len(),
        "Running `{}` per job",
        config.app.command.join(" ")
    );

    let progress = if quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(jobs.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style);
        }
        bar
    };

    let report = Orchestrator::new(Arc::new(processor), &config)
        .with_progress(progress)
        .run(&jobs)
        .await?;

    match &args.output {
        Some(path) => {
            output::save_to_file(&report, path, format).await?;
            println!("Run report saved to: {}", path.display());
        }
        None => {
            output::print_to_console(&report, format)?;
        }
    }

    if report.summary.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_JOBS_FAILED))
    }
}
