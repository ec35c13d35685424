//! # Asterisk Observer
//!
//! Exposes the runtime state of an Asterisk PBX to a management layer by talking
//! to the two surfaces Asterisk offers operators: the Manager Interface (AMI) and
//! the `asterisk -rx` CLI.
//!
//! - **AMI transport**: one owned TCP connection per instance, login, actions and
//!   deadline-bounded multi-line reads.
//! - **Status normalization**: AMI and CLI text parsed into typed endpoint, trunk,
//!   channel codec and RTP records that always carry a status.
//! - **PJSIP validation**: trunk reachability, extension registration and dialplan
//!   routing checks that accumulate errors instead of failing fast.
//! - **Live observability**: a rotation-safe tail of the Asterisk log file emitted
//!   as structured [`LogEvent`]s.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use asterisk_observer::{AsteriskStatusService, ObserverConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ObserverConfig::from_env();
//!     let service = AsteriskStatusService::new(config.ami.clone());
//!
//!     let endpoint = service.get_endpoint_details("100").await;
//!     println!("{} is {:?} ({:?})", endpoint.name, endpoint.status, endpoint.ip_address);
//!
//!     for trunk in ["provider-a", "provider-b"] {
//!         let trunk = service.get_trunk_status(trunk).await;
//!         println!("{}: reachable={} latency={:?}", trunk.endpoint.name, trunk.reachable, trunk.latency_ms);
//!     }
//! }
//! ```
//!
//! ## Live log
//!
//! ```rust,no_run
//! use asterisk_observer::{ConsoleCommandGateway, ObserverConfig};
//! use tokio_stream::StreamExt;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = ConsoleCommandGateway::new(ObserverConfig::from_env());
//!     let cancel = CancellationToken::new();
//!     let mut events = gateway.stream_live_output(4, cancel.clone()).await?;
//!     while let Some(event) = events.next().await {
//!         println!("[{:?}] {}", event.level, event.message);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Errors
//!
//! Transport and process failures never escape the façades ([`AsteriskStatusService`],
//! [`PjsipValidation`], [`ConsoleCommandGateway`]); they are folded into `status`,
//! `error` and `errors` fields. The only failure surfaced as an `Err` by the gateway
//! is a rejected console command, which is refused before any process is spawned.

use std::fmt::Write as _;

use serde::Serialize;
use thiserror::Error;
#[cfg(feature = "docs")]
use utoipa::ToSchema;
use uuid::Uuid;

pub mod config;
pub mod console;
pub mod extract;
pub mod logs;
pub mod runner;
pub mod status;
pub mod transport;
pub mod validation;

#[cfg(test)]
mod test_support;

pub use config::{CliOptions, LogOptions, ManagerOptions, ObserverConfig};
pub use console::{CommandResult, ConsoleCommandGateway, ServiceStatus};
pub use extract::{ChannelCodecInfo, DeviceState, EndpointState, EndpointStatus, RtpStats};
pub use logs::{LogEvent, LogEventParser, LogLevel, LogSink, LogTailer, TailState};
pub use runner::{CommandOutput, CommandRunner};
pub use status::{AsteriskStatusService, TrunkStatus};
pub use transport::{AmiTransport, ConnectionState, Terminator};
pub use validation::{CallRoutingResult, ExtensionValidation, PjsipValidation, TrunkValidation};

/// A request sent to the manager interface.
///
/// Serialized as CRLF separated `Key: value` lines followed by a blank line. Field
/// order is preserved, with `Action` always first and `ActionID` always last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmiAction {
    Login {
        username: String,
        secret: String,
        events: Option<String>,
        action_id: Option<String>,
    },
    Logoff {
        action_id: Option<String>,
    },
    Command {
        command: String,
        action_id: Option<String>,
    },
    PjsipShowEndpoint {
        endpoint: String,
        action_id: Option<String>,
    },
    PjsipShowEndpoints {
        action_id: Option<String>,
    },
    Custom {
        action: String,
        params: Vec<(String, String)>,
        action_id: Option<String>,
    },
}

impl AmiAction {
    pub fn login(username: impl Into<String>, secret: impl Into<String>) -> Self {
        AmiAction::Login {
            username: username.into(),
            secret: secret.into(),
            events: Some("off".to_string()),
            action_id: None,
        }
    }

    pub fn command(command: impl Into<String>) -> Self {
        AmiAction::Command {
            command: command.into(),
            action_id: None,
        }
    }

    pub fn show_endpoint(endpoint: impl Into<String>) -> Self {
        AmiAction::PjsipShowEndpoint {
            endpoint: endpoint.into(),
            action_id: None,
        }
    }

    pub fn show_endpoints() -> Self {
        AmiAction::PjsipShowEndpoints { action_id: None }
    }

    /// The value of the `Action:` line.
    pub fn name(&self) -> &str {
        match self {
            AmiAction::Login { .. } => "Login",
            AmiAction::Logoff { .. } => "Logoff",
            AmiAction::Command { .. } => "Command",
            AmiAction::PjsipShowEndpoint { .. } => "PJSIPShowEndpoint",
            AmiAction::PjsipShowEndpoints { .. } => "PJSIPShowEndpoints",
            AmiAction::Custom { action, .. } => action,
        }
    }

    pub fn action_id(&self) -> Option<&str> {
        match self {
            AmiAction::Login { action_id, .. }
            | AmiAction::Logoff { action_id }
            | AmiAction::Command { action_id, .. }
            | AmiAction::PjsipShowEndpoint { action_id, .. }
            | AmiAction::PjsipShowEndpoints { action_id }
            | AmiAction::Custom { action_id, .. } => action_id.as_deref(),
        }
    }

    /// Ordered `(key, value)` pairs, excluding `Action` and `ActionID`.
    pub fn fields(&self) -> Vec<(&str, &str)> {
        match self {
            AmiAction::Login {
                username,
                secret,
                events,
                ..
            } => {
                let mut fields = vec![("Username", username.as_str()), ("Secret", secret.as_str())];
                if let Some(events) = events {
                    fields.push(("Events", events.as_str()));
                }
                fields
            }
            AmiAction::Logoff { .. } | AmiAction::PjsipShowEndpoints { .. } => Vec::new(),
            AmiAction::Command { command, .. } => vec![("Command", command.as_str())],
            AmiAction::PjsipShowEndpoint { endpoint, .. } => vec![("Endpoint", endpoint.as_str())],
            AmiAction::Custom { params, .. } => params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
        }
    }
}

/// Raw text read back from the manager interface.
///
/// `complete` is false when the read deadline elapsed before the terminator was
/// seen; whatever arrived up to that point is still kept in `raw`.
#[cfg_attr(feature = "docs", derive(ToSchema))]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmiResponse {
    pub raw: String,
    pub complete: bool,
}

impl AmiResponse {
    pub fn is_incomplete(&self) -> bool {
        !self.complete
    }

    /// Blocks of `Key: value` pairs, one per blank-line separated message.
    pub fn messages(&self) -> Vec<AmiMessage> {
        parse_ami_protocol_message(&self.raw)
    }

    /// Value of the `Response:` header of the first message that has one.
    pub fn response(&self) -> Option<String> {
        self.messages()
            .iter()
            .find_map(|m| m.get("Response").map(str::to_string))
    }

    pub fn is_error(&self) -> bool {
        self.response()
            .map(|r| r.eq_ignore_ascii_case("Error"))
            .unwrap_or(false)
    }

    pub fn message(&self) -> Option<String> {
        self.messages()
            .iter()
            .find_map(|m| m.get("Message").map(str::to_string))
    }
}

/// One AMI message block with its header order preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmiMessage {
    pub fields: Vec<(String, String)>,
}

impl AmiMessage {
    /// First value for `key`, compared case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Command rejected: {0}")]
    CommandRejected(String),
    #[error("Command failed: {0}")]
    CommandFailed(String),
    #[error("No readable log file among: {0}")]
    LogUnavailable(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

pub(crate) fn parse_ami_protocol_message(raw_data: &str) -> Vec<AmiMessage> {
    let normalized = raw_data.replace("\r\n", "\n");
    let mut messages = Vec::new();
    for block in normalized.split("\n\n") {
        let mut message = AmiMessage::default();
        for line in block.lines() {
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                if key.is_empty() || key.contains(' ') {
                    continue;
                }
                message
                    .fields
                    .push((key.to_string(), value.trim().to_string()));
            }
        }
        if !message.fields.is_empty() {
            messages.push(message);
        }
    }
    messages
}

pub(crate) fn serialize_ami_action(action: &AmiAction) -> String {
    let mut s = String::new();
    let _ = write!(s, "Action: {}\r\n", action.name());
    for (key, value) in action.fields() {
        let _ = write!(s, "{key}: {value}\r\n");
    }
    if let Some(id) = action.action_id() {
        let _ = write!(s, "ActionID: {id}\r\n");
    }
    s.push_str("\r\n");
    s
}

pub(crate) fn get_or_set_action_id(action: &mut AmiAction) -> String {
    match action {
        AmiAction::Login { action_id, .. }
        | AmiAction::Logoff { action_id }
        | AmiAction::Command { action_id, .. }
        | AmiAction::PjsipShowEndpoint { action_id, .. }
        | AmiAction::PjsipShowEndpoints { action_id }
        | AmiAction::Custom { action_id, .. } => {
            if let Some(id) = action_id {
                id.clone()
            } else {
                let new_id = Uuid::new_v4().to_string();
                *action_id = Some(new_id.clone());
                new_id
            }
        }
    }
}
