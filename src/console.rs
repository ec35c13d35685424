//! Operator console: guarded `asterisk -rx` commands, live log and service state.

use std::io::SeekFrom;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
#[cfg(feature = "docs")]
use utoipa::ToSchema;

use crate::logs::{LogEvent, LogEventParser, LogTailer};
use crate::runner::INACTIVE_EXIT_CODE;
use crate::status::check_identifier;
use crate::{CommandRunner, ObserverConfig, ObserverError};

/// Commands that stop the PBX or reach outside of it. Matched as
/// case-insensitive prefixes.
const DENIED_PREFIXES: &[&str] = &[
    "core stop",
    "core restart",
    "core shutdown",
    "module unload",
    "database",
    "shell",
    "system",
];

const LIVE_CHANNEL_CAPACITY: usize = 1024;

#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub command: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub active: bool,
    /// The word `systemctl is-active` printed, or `unknown`.
    pub state: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConsoleCommandGateway {
    config: ObserverConfig,
    runner: CommandRunner,
}

impl ConsoleCommandGateway {
    pub fn new(config: ObserverConfig) -> Self {
        let runner = CommandRunner::new(config.cli.clone());
        Self { config, runner }
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    /// Run one console command.
    ///
    /// Returns `Err(CommandRejected)` for commands refused by the safety checks;
    /// nothing is spawned in that case. Every other outcome, including a missing
    /// binary or a timeout, is an `Ok` result with `success == false`.
    pub async fn execute_command(&self, command: &str) -> Result<CommandResult, ObserverError> {
        let command = check_command(command)?;
        log::info!("Console command: {command}");

        let result = match self.runner.asterisk_rx(&command).await {
            Ok(output) => CommandResult {
                success: output.success,
                error: (!output.success).then(|| output.failure_summary()),
                exit_code: output.exit_code,
                duration_ms: output.duration_ms,
                output: output.stdout,
                command,
            },
            Err(e) => {
                log::warn!("Console command '{command}' could not run: {e}");
                CommandResult {
                    command,
                    success: false,
                    output: String::new(),
                    error: Some(e.to_string()),
                    exit_code: None,
                    duration_ms: 0,
                }
            }
        };
        Ok(result)
    }

    pub async fn core_version(&self) -> Result<CommandResult, ObserverError> {
        self.execute_command("core show version").await
    }

    /// `module reload [module]`; `None` reloads everything.
    pub async fn reload_module(&self, module: Option<&str>) -> Result<CommandResult, ObserverError> {
        match module {
            Some(module) => {
                check_identifier(module).map_err(ObserverError::CommandRejected)?;
                self.execute_command(&format!("module reload {module}")).await
            }
            None => self.execute_command("module reload").await,
        }
    }

    pub async fn hangup_channel(&self, channel: &str) -> Result<CommandResult, ObserverError> {
        check_identifier(channel).map_err(ObserverError::CommandRejected)?;
        self.execute_command(&format!("channel request hangup {channel}"))
            .await
    }

    /// Dial `channel` and, once answered, send it to `extension@context`.
    pub async fn originate_call(
        &self,
        channel: &str,
        extension: &str,
        context: &str,
    ) -> Result<CommandResult, ObserverError> {
        for value in [channel, extension, context] {
            check_identifier(value).map_err(ObserverError::CommandRejected)?;
        }
        self.execute_command(&format!(
            "channel originate {channel} extension {extension}@{context}"
        ))
        .await
    }

    /// Follow the Asterisk log from its current end.
    ///
    /// The tail runs on its own task until `cancel` fires or the returned stream
    /// is dropped; either is noticed within one poll interval.
    pub async fn stream_live_output(
        &self,
        verbosity: u8,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<LogEvent>, ObserverError> {
        let logs = &self.config.logs;
        let mut tailer = LogTailer::start(&logs.candidates, verbosity, logs.poll_interval()).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(LIVE_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut sink = tx;
            tailer.run(&mut sink, &cancel).await;
        });
        Ok(ReceiverStream::new(rx))
    }

    /// The newest `limit` error and warning lines near the end of the log, oldest first.
    ///
    /// Only the last `recent_window_bytes` of the file are scanned. A missing or
    /// unreadable log gives an empty list.
    pub async fn get_recent_errors(&self, limit: usize) -> Vec<LogEvent> {
        let logs = &self.config.logs;
        let text = match LogTailer::resolve_log_path(&logs.candidates).await {
            Ok(path) => match read_tail(&path, logs.recent_window_bytes).await {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("Cannot read {}: {e}", path.display());
                    return Vec::new();
                }
            },
            Err(e) => {
                log::warn!("{e}");
                return Vec::new();
            }
        };

        let errors: Vec<LogEvent> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(LogEventParser::parse_line)
            .filter(|event| event.is_error)
            .collect();
        let skip = errors.len().saturating_sub(limit);
        errors.into_iter().skip(skip).collect()
    }

    /// `systemctl is-active asterisk`. An inactive service is a successful answer.
    pub async fn service_status(&self) -> ServiceStatus {
        match self.runner.systemctl(&["is-active", "asterisk"]).await {
            Ok(output) if output.success => {
                let state = output
                    .stdout
                    .split_whitespace()
                    .next()
                    .unwrap_or("unknown")
                    .to_string();
                ServiceStatus {
                    active: output.exit_code != Some(INACTIVE_EXIT_CODE),
                    state,
                    error: None,
                }
            }
            Ok(output) => ServiceStatus {
                active: false,
                state: "unknown".to_string(),
                error: Some(output.failure_summary()),
            },
            Err(e) => ServiceStatus {
                active: false,
                state: "unknown".to_string(),
                error: Some(e.to_string()),
            },
        }
    }
}

/// Normalize a console command and refuse the ones that must never run.
pub fn check_command(command: &str) -> Result<String, ObserverError> {
    if command.chars().any(|c| c.is_control() && c != '\t') {
        return Err(ObserverError::CommandRejected(
            "command contains control characters".to_string(),
        ));
    }
    let normalized = command.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return Err(ObserverError::CommandRejected("command is empty".to_string()));
    }

    let lowered = normalized.to_ascii_lowercase();
    if let Some(prefix) = DENIED_PREFIXES
        .iter()
        .find(|prefix| lowered.starts_with(*prefix))
    {
        log::warn!("Refusing console command '{normalized}'");
        return Err(ObserverError::CommandRejected(format!(
            "'{normalized}' is not allowed ({prefix})"
        )));
    }
    Ok(normalized)
}

/// Complete lines within the last `window` bytes of `path`.
async fn read_tail(path: &std::path::Path, window: u64) -> Result<String, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(window);
    file.seek(SeekFrom::Start(start)).await?;

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await?;
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if start > 0 {
        // First line is cut off by the window.
        text = match text.split_once('\n') {
            Some((_, rest)) => rest.to_string(),
            None => String::new(),
        };
    }
    Ok(text)
}
