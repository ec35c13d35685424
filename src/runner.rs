//! Bounded external processes: `asterisk -rx` and `systemctl`.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::{Child, Command};
#[cfg(feature = "docs")]
use utoipa::ToSchema;

use crate::{CliOptions, ObserverError};

/// Exit code `systemctl is-active` and `asterisk -rx` use for an inactive service.
pub const INACTIVE_EXIT_CODE: i32 = 3;

#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Exit code 0 or 3.
    pub success: bool,
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Short description of a failed run for error lists.
    pub fn failure_summary(&self) -> String {
        let status = self
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = [self.stderr.trim(), self.stdout.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or("no output");
        format!("exited with status {status}: {detail}")
    }
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    options: CliOptions,
}

impl CommandRunner {
    pub fn new(options: CliOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CliOptions {
        &self.options
    }

    /// `asterisk -rx "<command>"`.
    pub async fn asterisk_rx(&self, command: &str) -> Result<CommandOutput, ObserverError> {
        self.run(&self.options.asterisk_binary, &["-rx", command])
            .await
    }

    pub async fn systemctl(&self, args: &[&str]) -> Result<CommandOutput, ObserverError> {
        self.run(&self.options.systemctl_binary, args).await
    }

    /// Run `program` once with the configured timeout.
    ///
    /// A non-zero exit is not an error here: it is reported through
    /// [`CommandOutput::success`]. Errors mean the process could not be started
    /// or did not finish in time.
    pub async fn run(&self, program: &Path, args: &[&str]) -> Result<CommandOutput, ObserverError> {
        let started = Instant::now();
        let mut command = Command::new(program);
        command.kill_on_drop(true);
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        log::debug!("Running {} {}", program.display(), args.join(" "));
        let child = spawn_with_text_file_busy_retry(&mut command, program).await?;

        let timeout = self.options.command_timeout();
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                log::warn!(
                    "{} timed out after {}ms",
                    program.display(),
                    timeout.as_millis()
                );
                ObserverError::Timeout(self.options.command_timeout_ms)
            })?
            .map_err(|e| {
                ObserverError::CommandFailed(format!("{} failed: {e}", program.display()))
            })?;

        let exit_code = output.status.code();
        let success = matches!(exit_code, Some(0) | Some(INACTIVE_EXIT_CODE));
        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
            success,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if !success {
            log::debug!("{} {}", program.display(), result.failure_summary());
        }
        Ok(result)
    }
}

async fn spawn_with_text_file_busy_retry(
    command: &mut Command,
    program: &Path,
) -> Result<Child, ObserverError> {
    const MAX_TEXT_FILE_BUSY_RETRIES: u32 = 5;
    const TEXT_FILE_BUSY_ERRNO: i32 = 26;
    for attempt in 0..=MAX_TEXT_FILE_BUSY_RETRIES {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(error) => {
                if error.raw_os_error() == Some(TEXT_FILE_BUSY_ERRNO)
                    && attempt < MAX_TEXT_FILE_BUSY_RETRIES
                {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    continue;
                }
                return Err(ObserverError::Connection(format!(
                    "failed to spawn '{}': {error}",
                    program.display()
                )));
            }
        }
    }

    Err(ObserverError::Connection(format!(
        "failed to spawn '{}': unknown error",
        program.display()
    )))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::write_script;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn runner_with(asterisk: PathBuf, systemctl: PathBuf, timeout_ms: u64) -> CommandRunner {
        CommandRunner::new(CliOptions {
            asterisk_binary: asterisk,
            systemctl_binary: systemctl,
            command_timeout_ms: timeout_ms,
        })
    }

    #[tokio::test]
    async fn test_asterisk_rx_passes_command_as_one_argument() {
        let dir = tempdir().expect("tempdir");
        let script = write_script(
            dir.path(),
            "asterisk",
            r#"
if [ "$1" != "-rx" ]; then
  echo "expected -rx" >&2
  exit 11
fi
printf '%s' "$2""#,
        );
        let runner = runner_with(script, PathBuf::from("systemctl"), 5_000);
        let output = runner.asterisk_rx("core show version").await.unwrap();
        assert!(output.success);
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout, "core show version");
    }

    #[tokio::test]
    async fn test_exit_code_three_is_success() {
        let dir = tempdir().expect("tempdir");
        let systemctl = write_script(dir.path(), "systemctl", "echo inactive\nexit 3");
        let runner = runner_with(PathBuf::from("asterisk"), systemctl, 5_000);
        let output = runner.systemctl(&["is-active", "asterisk"]).await.unwrap();
        assert!(output.success);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "inactive");
    }

    #[tokio::test]
    async fn test_other_exit_codes_fail_with_output() {
        let dir = tempdir().expect("tempdir");
        let script = write_script(
            dir.path(),
            "asterisk",
            "echo 'Unable to connect to remote asterisk' >&2\nexit 1",
        );
        let runner = runner_with(script, PathBuf::from("systemctl"), 5_000);
        let output = runner.asterisk_rx("core show version").await.unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(1));
        assert!(output
            .failure_summary()
            .contains("status 1: Unable to connect to remote asterisk"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_connection_error() {
        let dir = tempdir().expect("tempdir");
        let runner = runner_with(dir.path().join("missing"), PathBuf::from("systemctl"), 5_000);
        let err = runner.asterisk_rx("core show version").await.unwrap_err();
        assert!(matches!(err, ObserverError::Connection(_)));
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempdir().expect("tempdir");
        let script = write_script(dir.path(), "asterisk", "sleep 5");
        let runner = runner_with(script, PathBuf::from("systemctl"), 100);
        let started = Instant::now();
        let err = runner.asterisk_rx("core show calls").await.unwrap_err();
        assert!(matches!(err, ObserverError::Timeout(100)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
