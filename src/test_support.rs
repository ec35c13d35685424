//! Fixtures shared by the unit tests: a scripted AMI server and fake executables.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub(crate) const LOGIN_OK: &str =
    "Response: Success\r\nMessage: Authentication accepted\r\n\r\n";

#[derive(Default)]
struct FakeState {
    requests: Vec<String>,
    connections: usize,
    clients: Vec<JoinHandle<()>>,
}

/// AMI server on `127.0.0.1` that answers each request block with `handler(block)`.
///
/// Login requests are answered with the configured login reply; an empty handler
/// reply sends nothing.
pub(crate) struct FakeAmi {
    pub port: u16,
    state: Arc<Mutex<FakeState>>,
    accept_task: JoinHandle<()>,
}

impl FakeAmi {
    pub async fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self::spawn_with_login(LOGIN_OK, handler).await
    }

    pub async fn spawn_with_login<F>(login_reply: &'static str, handler: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake ami");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(Mutex::new(FakeState::default()));
        let handler = Arc::new(handler);

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let client = tokio::spawn(serve_client(
                    socket,
                    login_reply,
                    handler.clone(),
                    accept_state.clone(),
                ));
                let mut guard = accept_state.lock().expect("fake ami state");
                guard.connections += 1;
                guard.clients.push(client);
            }
        });

        Self {
            port,
            state,
            accept_task,
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().expect("fake ami state").requests.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().expect("fake ami state").connections
    }

    /// Close every client socket from the server side.
    pub fn drop_clients(&self) {
        let mut guard = self.state.lock().expect("fake ami state");
        for client in guard.clients.drain(..) {
            client.abort();
        }
    }
}

impl Drop for FakeAmi {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_clients();
    }
}

async fn serve_client<F>(
    socket: TcpStream,
    login_reply: &'static str,
    handler: Arc<F>,
    state: Arc<Mutex<FakeState>>,
) where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    if writer
        .write_all(b"Asterisk Call Manager/7.0.3\r\n")
        .await
        .is_err()
    {
        return;
    }

    loop {
        let mut block = String::new();
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            if line == "\r\n" {
                break;
            }
            block.push_str(&line);
        }

        state
            .lock()
            .expect("fake ami state")
            .requests
            .push(block.clone());

        let reply = if block.contains("Action: Login") {
            login_reply.to_string()
        } else {
            handler(&block)
        };
        if !reply.is_empty() && writer.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// A localhost port with nothing listening on it.
pub(crate) fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}

#[cfg(unix)]
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut permissions = std::fs::metadata(&path).expect("metadata").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod");
    path
}

/// Fake `asterisk` binary answering `-rx "<command>"` from a fixed table.
///
/// Every invocation is appended to `invocations.log` next to the script.
/// Unknown commands print `No such command` and exit 1.
#[cfg(unix)]
pub(crate) fn fake_asterisk(dir: &Path, outputs: &[(&str, &str)]) -> PathBuf {
    let mut body = String::from(
        "echo \"$2\" >> \"$(dirname \"$0\")/invocations.log\"\n\
         if [ \"$1\" != \"-rx\" ]; then\n  echo \"expected -rx\" >&2\n  exit 1\nfi\n\
         case \"$2\" in\n",
    );
    for (command, output) in outputs {
        body.push_str(&format!(
            "  '{command}')\n    cat <<'__FAKE_OUTPUT__'\n{output}\n__FAKE_OUTPUT__\n    ;;\n"
        ));
    }
    body.push_str("  *)\n    echo \"No such command '$2'\" >&2\n    exit 1\n    ;;\nesac\n");
    write_script(dir, "asterisk", &body)
}

pub(crate) fn invocations(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("invocations.log"))
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}
