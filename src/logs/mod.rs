//! # Asterisk log following
//!
//! [`LogTailer`] follows the Asterisk log file the way `tail -F` does: it starts
//! at the current end of the file, picks up appended lines on every poll and
//! starts over when the file is rotated or truncated. Each line is turned into a
//! [`LogEvent`] by [`LogEventParser`] and handed to a [`LogSink`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use asterisk_observer::{LogOptions, LogTailer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = LogOptions::default();
//!     let mut tailer = LogTailer::start(&options.candidates, 4, options.poll_interval()).await?;
//!
//!     let (tx, mut rx) = tokio::sync::mpsc::channel(256);
//!     let cancel = CancellationToken::new();
//!     let worker_cancel = cancel.clone();
//!     tokio::spawn(async move {
//!         let mut sink = tx;
//!         tailer.run(&mut sink, &worker_cancel).await;
//!     });
//!
//!     while let Some(event) = rx.recv().await {
//!         println!("{} {}", event.level.label(), event.message);
//!     }
//!     Ok(())
//! }
//! ```

pub mod event;
pub mod tailer;


pub use event::{LogEvent, LogEventParser, LogLevel};
pub use tailer::{LogTailer, Sleeper, TailPhase, TailState, TokioSleeper};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Destination for tailed events.
///
/// `emit` returns `false` once the sink can no longer accept events; the tailer
/// stops at that point.
pub trait LogSink: Send {
    fn emit(&mut self, event: LogEvent) -> bool;

    /// Whether the consuming side is gone, checked before every poll.
    fn is_closed(&self) -> bool {
        false
    }
}

impl LogSink for Vec<LogEvent> {
    fn emit(&mut self, event: LogEvent) -> bool {
        self.push(event);
        true
    }
}

/// A full channel drops the event; a closed one ends the tail.
impl LogSink for mpsc::Sender<LogEvent> {
    fn emit(&mut self, event: LogEvent) -> bool {
        match self.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                log::warn!("Log consumer is behind, dropping: {}", event.raw);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

impl LogSink for mpsc::UnboundedSender<LogEvent> {
    fn emit(&mut self, event: LogEvent) -> bool {
        self.send(event).is_ok()
    }

    fn is_closed(&self) -> bool {
        mpsc::UnboundedSender::is_closed(self)
    }
}
