//! External command execution
//!
//! Everything the store does to the host (syntax checks, reloads, probes)
//! goes through [`CommandRunner`], so tests can substitute a fake.

use crate::error::{Result, RouterError};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// The tool's own diagnostic text, preferring stderr
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.status {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Runs a program to completion and captures its output.
///
/// A non-zero exit is *not* an error at this layer; callers decide whether
/// a failure is critical. Spawn failures and timeouts are errors.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Render a command line for messages
pub fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs real processes with a hard timeout
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let command_line = display_command(program, args);
        debug!(command = %command_line, "Running command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RouterError::ExternalCommand {
                    command: command_line,
                    message: format!("failed to start: {}", e),
                })
            }
            Err(_) => {
                return Err(RouterError::ExternalCommand {
                    command: command_line,
                    message: format!("timed out after {}s", self.timeout.as_secs()),
                })
            }
        };

        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(command = %command_line, status = ?result.status, "Command finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_prefers_stderr() {
        let output = CommandOutput {
            status: Some(1),
            stdout: "stdout text".to_string(),
            stderr: "nginx: [emerg] unexpected \"}\"\n".to_string(),
        };
        assert!(!output.success());
        assert_eq!(output.diagnostic(), "nginx: [emerg] unexpected \"}\"");

        let output = CommandOutput {
            status: Some(3),
            ..Default::default()
        };
        assert_eq!(output.diagnostic(), "exited with status 3");
    }

    #[test]
    fn test_display_command() {
        let args = vec!["reload".to_string(), "nginx".to_string()];
        assert_eq!(display_command("systemctl", &args), "systemctl reload nginx");
        assert_eq!(display_command("nginx", &[]), "nginx");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner::new(Duration::from_secs(5));
        let output = runner
            .run("sh", &["-c".to_string(), "echo out; echo err >&2; exit 2".to_string()])
            .await
            .unwrap();

        assert_eq!(output.status, Some(2));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_times_out() {
        let runner = SystemRunner::new(Duration::from_millis(100));
        let err = runner
            .run("sleep", &["5".to_string()])
            .await
            .unwrap_err();

        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let runner = SystemRunner::new(Duration::from_secs(5));
        let err = runner
            .run("definitely-not-a-real-binary-n8s", &[])
            .await
            .unwrap_err();

        assert!(err.to_string().contains("failed to start"));
    }
}
