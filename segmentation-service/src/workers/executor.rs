use service_core::error::AppError;
use std::ffi::OsString;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// Longest stderr excerpt carried into an error message.
const STDERR_EXCERPT: usize = 2000;

#[derive(Clone)]
pub struct CommandExecutor {
    timeout: Option<Duration>,
}

impl CommandExecutor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub async fn execute(
        &self,
        program: &str,
        args: &[OsString],
        working_dir: Option<&Path>,
    ) -> Result<Output, AppError> {
        let mut cmd = Command::new(program);
        cmd.args(args);

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            program = %program,
            args = ?args,
            timeout_secs = ?self.timeout.map(|t| t.as_secs()),
            "Executing command"
        );

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, cmd.output())
                .await
                .map_err(|_| {
                    AppError::ProcessingFailed(format!(
                        "{} timed out after {} seconds",
                        program,
                        timeout.as_secs()
                    ))
                })?,
            None => cmd.output().await,
        }
        .map_err(|e| {
            tracing::error!(program = %program, error = %e, "Failed to start command");
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::ProcessingFailed(format!("{} is not installed or not on PATH", program))
            } else {
                AppError::InternalError(anyhow::anyhow!("Failed to run {}: {}", program, e))
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(
                program = %program,
                args = ?args,
                status = %output.status,
                stderr = %stderr,
                "Command failed"
            );
            return Err(AppError::ProcessingFailed(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                excerpt(stderr.trim())
            )));
        }

        tracing::debug!(
            program = %program,
            output_size = output.stdout.len(),
            "Command succeeded"
        );

        Ok(output)
    }
}

fn excerpt(text: &str) -> &str {
    if text.len() <= STDERR_EXCERPT {
        return text;
    }
    let mut start = text.len() - STDERR_EXCERPT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
