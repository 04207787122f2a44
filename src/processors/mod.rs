use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

use crate::batch::Job;
use crate::worker::JobProcessor;

/// Placeholder replaced by the job id in command arguments
pub const JOB_PLACEHOLDER: &str = "{}";

/// Runs an external program once per job (a transcription script, a caption
/// uploader...). Stdout becomes the job output; a non-zero exit is a failure.
///
/// The child is killed when the future is dropped, so a worker terminated at its
/// deadline does not leave the program running.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
}

impl CommandProcessor {
    /// `command[0]` is the program, the rest are its arguments. If no argument
    /// contains `{}` the job id is appended as the last argument.
    pub fn new(command: Vec<String>) -> Result<Self> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .context("No command given to run per job")?;

        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn render_args(&self, job: &Job) -> Vec<String> {
        let id = job.id.as_str();
        if self.args.iter().any(|a| a.contains(JOB_PLACEHOLDER)) {
            self.args
                .iter()
                .map(|a| a.replace(JOB_PLACEHOLDER, id))
                .collect()
        } else {
            let mut args = self.args.clone();
            args.push(id.to_string());
            args
        }
    }
}

#[async_trait]
impl JobProcessor for CommandProcessor {
    async fn process(&self, job: &Job) -> Result<String> {
        let mut command = Command::new(&self.program);
        command
            .args(self.render_args(job))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} exited with {}: {}", self.program, output.status, stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_rejects_empty_command() {
        assert!(CommandProcessor::new(Vec::new()).is_err());
        assert!(CommandProcessor::new(command(&["  "])).is_err());
    }

    #[test]
    fn test_placeholder_substitution() {
        let processor = CommandProcessor::new(command(&["transcribe", "--input", "{}", "-o", "{}.vtt"])).unwrap();
        let args = processor.render_args(&Job::new("talk.mp4"));
        assert_eq!(args, vec!["--input", "talk.mp4", "-o", "talk.mp4.vtt"]);
    }

    #[test]
    fn test_job_id_appended_without_placeholder() {
        let processor = CommandProcessor::new(command(&["transcribe", "--fast"])).unwrap();
        let args = processor.render_args(&Job::new("talk.mp4"));
        assert_eq!(args, vec!["--fast", "talk.mp4"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_becomes_output() {
        let processor = CommandProcessor::new(command(&["echo", "captioned", "{}"])).unwrap();
        let output = processor.process(&Job::new("ep-01")).await.unwrap();
        assert_eq!(output, "captioned ep-01");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_an_error() {
        let processor = CommandProcessor::new(command(&["sh", "-c", "echo nope >&2; exit 3", "{}"])).unwrap();
        let err = processor.process(&Job::new("ep-02")).await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let processor = CommandProcessor::new(command(&["definitely-not-a-real-binary-4711"])).unwrap();
        assert!(processor.process(&Job::new("x")).await.is_err());
    }
}
