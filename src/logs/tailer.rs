//! Rotation-aware log file follower.

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{LogEvent, LogEventParser, LogLevel, LogSink};
use crate::ObserverError;

/// Where the tailer is in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TailState {
    pub path: PathBuf,
    /// Byte offset just past the last complete line handed out.
    pub offset: u64,
    /// `None` on platforms without inode numbers.
    pub inode: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TailPhase {
    Disconnected,
    Streaming,
    Rotated,
    Stopped,
}

/// Pause between polls.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

pub struct LogTailer {
    state: TailState,
    phase: TailPhase,
    parser: LogEventParser,
    poll_interval: Duration,
    sleeper: Arc<dyn Sleeper>,
    instance_id: String,
}

impl std::fmt::Debug for LogTailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTailer")
            .field("state", &self.state)
            .field("phase", &self.phase)
            .field("verbosity", &self.parser.verbosity())
            .field("poll_interval", &self.poll_interval)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl LogTailer {
    /// First candidate that exists and can be opened for reading.
    pub async fn resolve_log_path(candidates: &[PathBuf]) -> Result<PathBuf, ObserverError> {
        for candidate in candidates {
            match File::open(candidate).await {
                Ok(file) => match file.metadata().await {
                    Ok(meta) if meta.is_file() => return Ok(candidate.clone()),
                    Ok(_) => log::debug!("{} is not a regular file", candidate.display()),
                    Err(e) => log::debug!("Cannot stat {}: {e}", candidate.display()),
                },
                Err(e) => log::debug!("Cannot open {}: {e}", candidate.display()),
            }
        }
        let listed = candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(ObserverError::LogUnavailable(listed))
    }

    /// Resolve the log file and position at its current end.
    pub async fn start(
        candidates: &[PathBuf],
        verbosity: u8,
        poll_interval: Duration,
    ) -> Result<Self, ObserverError> {
        let path = Self::resolve_log_path(candidates).await?;
        Self::open(path, verbosity, poll_interval).await
    }

    /// Follow `path` from its current end. Existing content is never replayed.
    pub async fn open(
        path: impl Into<PathBuf>,
        verbosity: u8,
        poll_interval: Duration,
    ) -> Result<Self, ObserverError> {
        let path = path.into();
        let meta = fs::metadata(&path).await?;
        let instance_id = Uuid::new_v4().to_string()[..8].to_string();
        log::info!(
            "[{instance_id}] Tailing {} from offset {}",
            path.display(),
            meta.len()
        );
        Ok(Self {
            state: TailState {
                inode: inode_of(&meta),
                offset: meta.len(),
                path,
            },
            phase: TailPhase::Disconnected,
            parser: LogEventParser::new(verbosity),
            poll_interval,
            sleeper: Arc::new(TokioSleeper),
            instance_id,
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> &TailState {
        &self.state
    }

    pub fn phase(&self) -> TailPhase {
        self.phase
    }

    pub fn path(&self) -> &Path {
        &self.state.path
    }

    /// One poll: detect rotation, then read whatever was appended.
    ///
    /// On rotation only the synthetic rotation event is returned; the new file is
    /// read from offset 0 on the next poll. Events below the verbosity threshold
    /// are dropped, rotation events never are.
    pub async fn poll_once(&mut self) -> Vec<LogEvent> {
        let id = self.instance_id.clone();
        let meta = match fs::metadata(&self.state.path).await {
            Ok(meta) => meta,
            Err(e) => {
                if self.phase != TailPhase::Disconnected {
                    log::warn!(
                        "[{id}] Lost sight of {}: {e}",
                        self.state.path.display()
                    );
                    self.phase = TailPhase::Disconnected;
                }
                return Vec::new();
            }
        };

        let inode = inode_of(&meta);
        let replaced = inode.is_some() && self.state.inode.is_some() && inode != self.state.inode;
        let truncated = meta.len() < self.state.offset;
        if replaced || truncated {
            log::info!(
                "[{id}] {} was {}, restarting from the beginning",
                self.state.path.display(),
                if replaced { "rotated" } else { "truncated" }
            );
            self.state.offset = 0;
            self.state.inode = inode;
            self.phase = TailPhase::Rotated;
            return vec![LogEvent::synthetic(
                LogLevel::Info,
                format!("Log file rotated: {}", self.state.path.display()),
            )];
        }

        if self.phase == TailPhase::Disconnected {
            log::debug!("[{id}] Streaming {}", self.state.path.display());
        }
        self.phase = TailPhase::Streaming;
        if meta.len() == self.state.offset {
            return Vec::new();
        }

        let chunk = match self.read_appended().await {
            Ok(chunk) => chunk,
            Err(e) => {
                log::warn!("[{id}] Reading {} failed: {e}", self.state.path.display());
                return Vec::new();
            }
        };

        // A trailing partial line stays in the file until its newline arrives.
        let Some(end) = chunk.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        self.state.offset += (end + 1) as u64;

        String::from_utf8_lossy(&chunk[..end])
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| self.parser.parse_filtered(line))
            .collect()
    }

    async fn read_appended(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut file = File::open(&self.state.path).await?;
        file.seek(SeekFrom::Start(self.state.offset)).await?;
        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk).await?;
        Ok(chunk)
    }

    /// Poll until `cancel` fires or the sink stops accepting events. A closed sink
    /// is noticed on the next poll even when the log is quiet.
    pub async fn run<S>(&mut self, sink: &mut S, cancel: &CancellationToken)
    where
        S: LogSink + ?Sized,
    {
        let id = self.instance_id.clone();
        log::debug!(
            "[{id}] Tail loop started, polling every {}ms",
            self.poll_interval.as_millis()
        );
        'tail: while !cancel.is_cancelled() {
            if sink.is_closed() {
                log::debug!("[{id}] Log sink closed");
                break;
            }
            for event in self.poll_once().await {
                if !sink.emit(event) {
                    log::debug!("[{id}] Log sink closed");
                    break 'tail;
                }
            }
            let sleeper = self.sleeper.clone();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleeper.sleep(self.poll_interval) => {}
            }
        }
        self.phase = TailPhase::Stopped;
        log::info!("[{id}] Stopped tailing {}", self.state.path.display());
    }
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}
