use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use crate::cli::OutputFormat;
use crate::orchestrator::RunReport;
use crate::utils::format_millis;

/// Render a run report in the requested format
pub fn render(report: &RunReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(format_as_text(report)),
        OutputFormat::Json => format_as_json(report),
    }
}

pub fn format_as_json(report: &RunReport) -> Result<String> {
    serde_json::to_string_pretty(report).context("Failed to serialize run report")
}

pub fn format_as_text(report: &RunReport) -> String {
    let summary = &report.summary;
    let failed = if summary.failed == 0 {
        style(summary.failed).green()
    } else {
        style(summary.failed).red()
    };

    let mut lines = vec![
        format!("Run {}", report.run_id),
        format!("  Jobs:                 {}", summary.total_jobs),
        format!("  Succeeded:            {}", style(summary.succeeded).green()),
        format!("  Failed:               {}", failed),
        format!(
            "  Parallel phase:       {} ok, {} failed ({} timed out)",
            summary.originally_succeeded, summary.originally_failed, summary.timed_out
        ),
        format!("  Recovered by retry:   {}", summary.recovered_by_retry),
        format!("  Total processing:     {}", format_millis(summary.total_processing_ms)),
        format!(
            "  Average per job:      {}",
            format_millis(summary.average_processing_ms.round() as u64)
        ),
        format!("  Wall clock:           {}", format_millis(summary.elapsed_ms)),
    ];

    let failures: Vec<_> = report.failures().collect();
    if !failures.is_empty() {
        lines.push(String::new());
        lines.push(style("Failed jobs:").red().bold().to_string());
        lines.extend(failures.iter().map(|result| {
            format!(
                "  • {} [{}] {}",
                result.job_id,
                result.error_kind.map(|k| k.as_str()).unwrap_or("unknown"),
                result.error_message.as_deref().unwrap_or_default()
            )
        }));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Save the run report to file
pub async fn save_to_file(report: &RunReport, path: &Path, format: OutputFormat) -> Result<()> {
    let content = match format {
        // Files get plain text without terminal styling.
        OutputFormat::Text => console::strip_ansi_codes(&format_as_text(report)).into_owned(),
        OutputFormat::Json => format_as_json(report)?,
    };

    fs_err::write(path, content)?;
    Ok(())
}

/// Print the run report to console
pub fn print_to_console(report: &RunReport, format: OutputFormat) -> Result<()> {
    println!("{}", render(report, format)?);
    Ok(())
}
