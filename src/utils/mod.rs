/// Format a millisecond duration in human-readable form
pub fn format_millis(ms: u64) -> String {
    if ms < 1_000 {
        return format!("{}ms", ms);
    }

    let total_seconds = ms / 1_000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{:.1}s", ms as f64 / 1_000.0)
    }
}

/// Job ids from a jobs file: trimmed lines, skipping blanks and `#` comments
pub fn parse_job_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
