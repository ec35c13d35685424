//! Single-connection AMI transport.
//!
//! An [`AmiTransport`] owns at most one TCP socket to the manager port. It is never
//! shared: callers that need concurrent queries create independent transports.
//! Responses are read against an explicit deadline; when it elapses whatever text
//! arrived is returned with `complete == false` instead of an error.

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use uuid::Uuid;

use crate::{
    get_or_set_action_id, parse_ami_protocol_message, serialize_ami_action, AmiAction, AmiResponse,
    ManagerOptions, ObserverError,
};

/// Upper bound for a single socket read inside the deadline loop.
const READ_SLICE: Duration = Duration::from_millis(50);
const LOGOFF_DEADLINE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Authenticated,
}

/// What ends a response read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// A blank line after some content.
    BlankLine,
    /// A block carrying `EventList: Complete`, or a single response block that
    /// did not open an event list (e.g. `Response: Error`).
    EventListComplete,
}

pub struct AmiTransport {
    options: ManagerOptions,
    stream: Option<TcpStream>,
    state: ConnectionState,
    banner: Option<String>,
    pending: Vec<u8>,
    instance_id: String,
}

impl AmiTransport {
    pub fn new(options: ManagerOptions) -> Self {
        let instance_id = Uuid::new_v4().to_string()[..8].to_string();
        log::debug!(
            "[{instance_id}] Creating AMI transport for {}:{}",
            options.host,
            options.port
        );
        Self {
            options,
            stream: None,
            state: ConnectionState::Disconnected,
            banner: None,
            pending: Vec::new(),
            instance_id,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Greeting line sent by Asterisk on connect, e.g. `Asterisk Call Manager/7.0.3`.
    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Open and authenticate a connection, reusing the current one if it is still alive.
    ///
    /// Fails with `Connection` when the socket cannot be opened and with `Auth` when
    /// the login reply lacks `Success`. A login that gets no reply at all before the
    /// response deadline is reported as `Timeout`.
    pub async fn connect(&mut self) -> Result<(), ObserverError> {
        if self.state == ConnectionState::Authenticated && self.probe_alive() {
            log::trace!("[{}] Reusing authenticated AMI connection", self.instance_id);
            return Ok(());
        }
        self.drop_connection();

        let addr = format!("{}:{}", self.options.host, self.options.port);
        let stream = timeout(
            self.options.connect_timeout(),
            TcpStream::connect((self.options.host.as_str(), self.options.port)),
        )
        .await
        .map_err(|_| {
            ObserverError::Connection(format!(
                "connect to {addr} timed out after {}ms",
                self.options.connect_timeout_ms
            ))
        })?
        .map_err(|e| ObserverError::Connection(format!("connect to {addr} failed: {e}")))?;

        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        log::debug!("[{}] Connected to AMI at {addr}", self.instance_id);

        self.banner = self.read_banner(self.options.response_timeout()).await?;

        let login = AmiAction::login(self.options.username.clone(), self.options.secret.clone());
        self.send_action(login).await?;
        let response = self
            .read_response(Terminator::BlankLine, self.options.response_timeout())
            .await?;

        if response.raw.to_ascii_lowercase().contains("success") {
            self.state = ConnectionState::Authenticated;
            log::debug!(
                "[{}] Authenticated as '{}'",
                self.instance_id,
                self.options.username
            );
            Ok(())
        } else {
            self.drop_connection();
            if response.raw.trim().is_empty() {
                return Err(ObserverError::Timeout(self.options.response_timeout_ms));
            }
            let reason = response
                .message()
                .unwrap_or_else(|| response.raw.trim().to_string());
            log::warn!(
                "[{}] AMI login rejected for '{}': {reason}",
                self.instance_id,
                self.options.username
            );
            Err(ObserverError::Auth(reason))
        }
    }

    /// Write one action. The response must be collected with [`read_response`](Self::read_response).
    ///
    /// Returns the `ActionID` the action was sent with.
    pub async fn send_action(&mut self, mut action: AmiAction) -> Result<String, ObserverError> {
        let action_id = get_or_set_action_id(&mut action);
        let payload = serialize_ami_action(&action);
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ObserverError::Connection("not connected to AMI".to_string()))?;

        log::trace!(
            "[{}] Sending action {} ({action_id})",
            self.instance_id,
            action.name()
        );
        let written = stream.write_all(payload.as_bytes()).await;
        if let Err(e) = written {
            self.drop_connection();
            return Err(ObserverError::Io(e));
        }
        Ok(action_id)
    }

    /// Accumulate text until `terminator` is seen or `deadline` elapses.
    pub async fn read_response(
        &mut self,
        terminator: Terminator,
        deadline: Duration,
    ) -> Result<AmiResponse, ObserverError> {
        let started = Instant::now();
        let mut buffer = std::mem::take(&mut self.pending);
        let mut chunk = [0u8; 4096];

        loop {
            if is_terminated(&buffer, terminator) {
                return Ok(AmiResponse {
                    raw: String::from_utf8_lossy(&buffer).into_owned(),
                    complete: true,
                });
            }

            let elapsed = started.elapsed();
            if elapsed >= deadline {
                log::debug!(
                    "[{}] Response deadline of {}ms elapsed with {} bytes read",
                    self.instance_id,
                    deadline.as_millis(),
                    buffer.len()
                );
                return Ok(AmiResponse {
                    raw: String::from_utf8_lossy(&buffer).into_owned(),
                    complete: false,
                });
            }

            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| ObserverError::Connection("not connected to AMI".to_string()))?;
            let slice = (deadline - elapsed).min(READ_SLICE);
            let read = timeout(slice, stream.read(&mut chunk)).await;
            match read {
                Err(_) => continue,
                Ok(Ok(0)) => {
                    log::debug!("[{}] AMI connection closed by peer", self.instance_id);
                    self.drop_connection();
                    if buffer.is_empty() {
                        return Err(ObserverError::Connection(
                            "connection closed by peer".to_string(),
                        ));
                    }
                    return Ok(AmiResponse {
                        raw: String::from_utf8_lossy(&buffer).into_owned(),
                        complete: false,
                    });
                }
                Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => {
                    self.drop_connection();
                    return Err(ObserverError::Io(e));
                }
            }
        }
    }

    /// Connect if needed, send `action` and read its response.
    pub async fn request(
        &mut self,
        action: AmiAction,
        terminator: Terminator,
        deadline: Duration,
    ) -> Result<AmiResponse, ObserverError> {
        self.connect().await?;
        self.send_action(action).await?;
        self.read_response(terminator, deadline).await
    }

    /// Run a CLI command over `Action: Command` and return its text output.
    pub async fn command(&mut self, command: &str) -> Result<(String, bool), ObserverError> {
        let deadline = self.options.response_timeout();
        let response = self
            .request(AmiAction::command(command), Terminator::BlankLine, deadline)
            .await?;
        if response.is_error() {
            return Err(ObserverError::Protocol(
                response
                    .message()
                    .unwrap_or_else(|| format!("command '{command}' failed")),
            ));
        }
        Ok((command_output(&response.raw), response.complete))
    }

    /// Send `Logoff` (best effort) and close the socket.
    pub async fn logoff(&mut self) {
        if self.stream.is_some() && self.probe_alive() {
            let logoff = AmiAction::Logoff { action_id: None };
            if self.send_action(logoff).await.is_ok() {
                let _ = self
                    .read_response(Terminator::BlankLine, LOGOFF_DEADLINE)
                    .await;
            }
        }
        if self.stream.is_some() {
            log::debug!("[{}] Logged off from AMI", self.instance_id);
        }
        self.drop_connection();
    }

    /// End-of-stream probe. Unsolicited bytes waiting on the socket are discarded.
    fn probe_alive(&mut self) -> bool {
        let Some(stream) = self.stream.as_ref() else {
            return false;
        };
        let mut scratch = [0u8; 1024];
        loop {
            match stream.try_read(&mut scratch) {
                Ok(0) => {
                    log::debug!("[{}] Stale AMI socket detected", self.instance_id);
                    return false;
                }
                Ok(n) => {
                    log::trace!("[{}] Discarding {n} unsolicited bytes", self.instance_id);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.pending.clear();
                    return true;
                }
                Err(_) => return false,
            }
        }
    }

    async fn read_banner(&mut self, deadline: Duration) -> Result<Option<String>, ObserverError> {
        let started = Instant::now();
        let mut chunk = [0u8; 512];
        while !self.pending.contains(&b'\n') {
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Ok(None);
            }
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| ObserverError::Connection("not connected to AMI".to_string()))?;
            let read = timeout((deadline - elapsed).min(READ_SLICE), stream.read(&mut chunk)).await;
            match read {
                Err(_) => continue,
                Ok(Ok(0)) => {
                    self.drop_connection();
                    return Err(ObserverError::Connection(
                        "connection closed before greeting".to_string(),
                    ));
                }
                Ok(Ok(n)) => self.pending.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => {
                    self.drop_connection();
                    return Err(ObserverError::Io(e));
                }
            }
        }

        let Some(end) = self.pending.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        let banner = String::from_utf8_lossy(&line).trim().to_string();
        log::debug!("[{}] AMI greeting: {banner}", self.instance_id);
        Ok(Some(banner))
    }

    fn drop_connection(&mut self) {
        self.stream = None;
        self.pending.clear();
        self.state = ConnectionState::Disconnected;
    }
}

impl std::fmt::Debug for AmiTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiTransport")
            .field("instance_id", &self.instance_id)
            .field("endpoint", &format!("{}:{}", self.options.host, self.options.port))
            .field("state", &self.state)
            .finish()
    }
}

fn is_terminated(buffer: &[u8], terminator: Terminator) -> bool {
    let text = String::from_utf8_lossy(buffer).replace("\r\n", "\n");
    let content = text.trim_start();
    if content.is_empty() {
        return false;
    }
    match terminator {
        Terminator::BlankLine => content.contains("\n\n"),
        Terminator::EventListComplete => {
            let Some(last_blank) = content.rfind("\n\n") else {
                return false;
            };
            let blocks = parse_ami_protocol_message(&content[..last_blank]);
            let Some(first) = blocks.first() else {
                return false;
            };
            let opened_list = first
                .get("EventList")
                .map(|v| v.eq_ignore_ascii_case("start"))
                .unwrap_or(false);
            if first.get("Response").is_some() && !opened_list {
                return true;
            }
            blocks.iter().any(|block| {
                block
                    .get("EventList")
                    .map(|v| v.eq_ignore_ascii_case("Complete"))
                    .unwrap_or(false)
            })
        }
    }
}

/// CLI text carried by an AMI `Command` response.
///
/// Handles both the `Output:` line framing of Asterisk 14+ and the legacy
/// `Response: Follows` body terminated by `--END COMMAND--`.
pub fn command_output(raw: &str) -> String {
    let mut lines = Vec::new();
    let mut legacy_body = false;
    for line in raw.lines() {
        let trimmed_end = line.trim_end_matches('\r');
        if let Some(output) = trimmed_end.strip_prefix("Output:") {
            lines.push(output.strip_prefix(' ').unwrap_or(output).to_string());
            continue;
        }
        if trimmed_end.starts_with("Response:") {
            legacy_body = trimmed_end.contains("Follows");
            continue;
        }
        if trimmed_end.starts_with("--END COMMAND--") {
            break;
        }
        if legacy_body {
            let is_header = ["Privilege:", "ActionID:", "Message:"]
                .iter()
                .any(|h| trimmed_end.starts_with(h));
            if !is_header {
                lines.push(trimmed_end.to_string());
            }
        }
    }
    lines.join("\n").trim_end().to_string()
}
