//! Local command server
//!
//! An unprivileged client talks to the service over one well-known local
//! channel: a Unix domain socket, or a named pipe on Windows. Each connection
//! carries exactly one newline-terminated JSON request and gets exactly one
//! newline-terminated reply:
//!
//! ```text
//! -> {"command":"connect","payload":"[Interface]\n..."}
//! <- Connected
//! -> {"command":"status"}
//! <- {"rx":1024,"tx":2048}
//! -> {"command":"disconnect"}
//! <- disconnected
//! ```
//!
//! Anything that fails, including a request that cannot be read or parsed,
//! is answered with `false`. Connections are served one at a time.

use crate::error::{TunnelError, TunnelResult};
use crate::supervisor::SupervisorHandle;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;

/// Reply to a successful connect
pub const REPLY_CONNECTED: &str = "Connected";
/// Reply to a successful disconnect
pub const REPLY_DISCONNECTED: &str = "disconnected";
/// Reply to any failure
pub const REPLY_FAILURE: &str = "false";

/// Longest request line accepted
pub const MAX_REQUEST_BYTES: u64 = 64 * 1024;

/// Default Unix socket path
#[cfg(unix)]
pub const DEFAULT_ENDPOINT: &str = "/run/tunwarden/tunwarden.sock";

/// Default named pipe
#[cfg(windows)]
pub const DEFAULT_ENDPOINT: &str = r"\\.\pipe\tunwarden";

/// One request as sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// `connect`, `disconnect` or `status`
    #[serde(alias = "Command")]
    pub command: String,
    /// Config text for connect
    #[serde(default, alias = "Payload", skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl CommandRequest {
    /// A connect request carrying config text
    pub fn connect(config_text: impl Into<String>) -> Self {
        Self {
            command: "connect".into(),
            payload: Some(config_text.into()),
        }
    }

    /// A disconnect request
    pub fn disconnect() -> Self {
        Self {
            command: "disconnect".into(),
            payload: None,
        }
    }

    /// A status request
    pub fn status() -> Self {
        Self {
            command: "status".into(),
            payload: None,
        }
    }
}

/// Status reply body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    /// Bytes received
    pub rx: u64,
    /// Bytes sent
    pub tx: u64,
}

/// Recognised commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Bring the tunnel up
    Connect,
    /// Take the tunnel down
    Disconnect,
    /// Heartbeat and counters
    Status,
}

impl FromStr for Command {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "connect" => Ok(Command::Connect),
            "disconnect" => Ok(Command::Disconnect),
            "status" => Ok(Command::Status),
            other => Err(TunnelError::Channel(format!("unknown command '{}'", other))),
        }
    }
}

/// Parse one request line
pub fn parse_request(line: &str) -> TunnelResult<(Command, Option<String>)> {
    let line = line.trim();
    if line.is_empty() {
        return Err(TunnelError::Channel("empty request".into()));
    }
    let request: CommandRequest = serde_json::from_str(line)
        .map_err(|e| TunnelError::Channel(format!("invalid JSON: {}", e)))?;
    let command = request.command.parse()?;
    Ok((command, request.payload))
}

/// Run one request line against the supervisor and produce the reply line
/// (without the newline)
pub async fn dispatch(supervisor: &SupervisorHandle, line: &str) -> String {
    let (command, payload) = match parse_request(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!("Rejected request: {}", e);
            return REPLY_FAILURE.to_string();
        }
    };

    match command {
        Command::Connect => {
            let Some(text) = payload.filter(|p| !p.trim().is_empty()) else {
                tracing::warn!(command = "connect", "connect without a payload");
                return REPLY_FAILURE.to_string();
            };
            match supervisor.connect(text).await {
                Ok(()) => REPLY_CONNECTED.to_string(),
                Err(e) => {
                    tracing::error!(command = "connect", "Connect failed: {}", e);
                    REPLY_FAILURE.to_string()
                }
            }
        }
        Command::Disconnect => match supervisor.disconnect().await {
            Ok(()) => REPLY_DISCONNECTED.to_string(),
            Err(e) => {
                tracing::error!(command = "disconnect", "Disconnect failed: {}", e);
                REPLY_FAILURE.to_string()
            }
        },
        Command::Status => match supervisor.status().await {
            Ok(report) => {
                let reply = StatusReply {
                    rx: report.rx(),
                    tx: report.tx(),
                };
                serde_json::to_string(&reply).unwrap_or_else(|_| REPLY_FAILURE.to_string())
            }
            Err(e) => {
                tracing::warn!(command = "status", "Status failed: {}", e);
                REPLY_FAILURE.to_string()
            }
        },
    }
}

/// Serve one connection: read one line, dispatch, write one line
pub async fn handle_connection<S>(
    stream: S,
    supervisor: &SupervisorHandle,
    read_timeout: Duration,
) -> TunnelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    let read = {
        let mut limited = (&mut reader).take(MAX_REQUEST_BYTES);
        tokio::time::timeout(read_timeout, limited.read_line(&mut line)).await
    };

    let reply = match read {
        Ok(Ok(_)) => dispatch(supervisor, &line).await,
        Ok(Err(e)) => {
            tracing::warn!("Failed to read request: {}", e);
            REPLY_FAILURE.to_string()
        }
        Err(_) => {
            tracing::warn!("Client sent no request within {:?}", read_timeout);
            REPLY_FAILURE.to_string()
        }
    };

    let mut stream = reader.into_inner();
    stream.write_all(reply.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;
    // The client may already be gone
    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(any(windows, test))]
const RECREATE_BACKOFF_MIN: Duration = Duration::from_millis(100);
#[cfg(any(windows, test))]
const RECREATE_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Call `create` until it succeeds, doubling the pause between failures.
/// Returns `None` once shutdown is requested.
#[cfg(any(windows, test))]
async fn recreate_until<T, F>(
    endpoint: &str,
    mut create: F,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<T>
where
    F: FnMut() -> std::io::Result<T>,
{
    let mut backoff = RECREATE_BACKOFF_MIN;
    loop {
        if *shutdown.borrow() {
            return None;
        }
        match create() {
            Ok(value) => return Some(value),
            Err(e) => tracing::error!(
                "Cannot recreate command endpoint {}: {} (retry in {:?})",
                endpoint,
                e,
                backoff
            ),
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
        }
        backoff = (backoff * 2).min(RECREATE_BACKOFF_MAX);
    }
}

/// Accept loop on the local channel
pub struct CommandServer {
    endpoint: String,
    supervisor: SupervisorHandle,
    read_timeout: Duration,
}

impl CommandServer {
    /// Create a server for `endpoint`
    pub fn new(endpoint: impl Into<String>, supervisor: SupervisorHandle, read_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            supervisor,
            read_timeout,
        }
    }

    /// Endpoint the server listens on
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Serve until `shutdown` flips to true
    #[cfg(unix)]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> TunnelResult<()> {
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;
        use tokio::net::UnixListener;

        let path = Path::new(&self.endpoint);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            tracing::debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        // Unprivileged clients must be able to connect
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
        tracing::info!("Command server listening on {}", path.display());

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        if let Err(e) = handle_connection(stream, &self.supervisor, self.read_timeout).await {
                            tracing::warn!("Client connection error: {}", e);
                        }
                    }
                    Err(e) => tracing::error!("Command server accept error: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let _ = std::fs::remove_file(path);
        tracing::info!("Command server stopped");
        Ok(())
    }

    /// Serve until `shutdown` flips to true
    #[cfg(windows)]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> TunnelResult<()> {
        let mut server = crate::windows::create_pipe_instance(&self.endpoint, true)?;
        tracing::info!("Command server listening on {}", self.endpoint);

        loop {
            tokio::select! {
                connected = server.connect() => {
                    // The next instance must exist before this one is handed off
                    let endpoint = self.endpoint.as_str();
                    let next = recreate_until(
                        endpoint,
                        || crate::windows::create_pipe_instance(endpoint, false),
                        &mut shutdown,
                    )
                    .await;
                    let Some(next) = next else {
                        break;
                    };
                    let client = std::mem::replace(&mut server, next);
                    match connected {
                        Ok(()) => {
                            if let Err(e) = handle_connection(client, &self.supervisor, self.read_timeout).await {
                                tracing::warn!("Client connection error: {}", e);
                            }
                        }
                        Err(e) => tracing::error!("Command server accept error: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Command server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterManager, DEFAULT_TUNNEL_TYPE};
    use crate::driver::MemoryDriver;
    use crate::netops::MemoryNetwork;
    use crate::routes::RouteReconciler;
    use crate::supervisor::{ManualClock, SessionState, Supervisor, SupervisorConfig};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tunwarden_protocol::encode_key;

    fn supervisor() -> (Arc<MemoryDriver>, SupervisorHandle) {
        let driver = Arc::new(MemoryDriver::new());
        let (handle, _task) = Supervisor::new(
            SupervisorConfig {
                adapter_name: "wg-ipc".into(),
                liveness_timeout: Duration::from_secs(60),
            },
            AdapterManager::new(driver.clone(), DEFAULT_TUNNEL_TYPE, Duration::from_secs(5)),
            RouteReconciler::new(Arc::new(MemoryNetwork::new()), Duration::from_secs(5)),
            Arc::new(ManualClock::new()),
        )
        .spawn();
        (driver, handle)
    }

    fn config_text() -> String {
        format!(
            "[Interface]\nPrivateKey = {}\nAddress = 10.53.0.14/32\n[Peer]\nPublicKey = {}\n\
             Endpoint = 203.0.113.5:51820\nAllowedIPs = 0.0.0.0/0\n",
            encode_key(&[1u8; 32]),
            encode_key(&[2u8; 32])
        )
    }

    async fn round_trip(handle: &SupervisorHandle, request: &str) -> String {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let handle = handle.clone();
        let serve = tokio::spawn(async move {
            handle_connection(server, &handle, Duration::from_secs(2)).await
        });

        client.write_all(request.as_bytes()).await.unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        serve.await.unwrap().unwrap();
        reply
    }

    #[test]
    fn test_command_names_are_case_insensitive() {
        assert_eq!("Connect".parse::<Command>().unwrap(), Command::Connect);
        assert_eq!("STATUS".parse::<Command>().unwrap(), Command::Status);
        assert!("reboot".parse::<Command>().is_err());
    }

    #[test]
    fn test_parse_request_accepts_both_casings() {
        let (cmd, payload) = parse_request(r#"{"Command":"connect","Payload":"x"}"#).unwrap();
        assert_eq!(cmd, Command::Connect);
        assert_eq!(payload.as_deref(), Some("x"));

        let (cmd, payload) = parse_request(r#"{"command":"status","payload":null}"#).unwrap();
        assert_eq!(cmd, Command::Status);
        assert!(payload.is_none());

        assert!(parse_request("").is_err());
        assert!(parse_request("connect").is_err());
    }

    #[tokio::test]
    async fn test_connect_status_disconnect() {
        let (driver, handle) = supervisor();

        let request = serde_json::to_string(&CommandRequest::connect(config_text())).unwrap();
        assert_eq!(round_trip(&handle, &format!("{}\n", request)).await, "Connected\n");
        assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Connected);

        driver.simulate_traffic("wg-ipc", 10, 20);
        let reply = round_trip(&handle, "{\"command\":\"status\"}\n").await;
        let status: StatusReply = serde_json::from_str(reply.trim()).unwrap();
        assert_eq!(status, StatusReply { rx: 10, tx: 20 });

        let reply = round_trip(&handle, "{\"Command\":\"Disconnect\"}\n").await;
        assert_eq!(reply, "disconnected\n");
        assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_status_when_idle_is_zero() {
        let (_driver, handle) = supervisor();
        let reply = round_trip(&handle, "{\"command\":\"status\"}\n").await;
        assert_eq!(reply, "{\"rx\":0,\"tx\":0}\n");
    }

    #[tokio::test]
    async fn test_malformed_requests_get_failure_token() {
        let (driver, handle) = supervisor();

        assert_eq!(round_trip(&handle, "not json\n").await, "false\n");
        assert_eq!(round_trip(&handle, "\n").await, "false\n");
        assert_eq!(round_trip(&handle, "{\"command\":\"connect\"}\n").await, "false\n");
        assert_eq!(
            round_trip(
                &handle,
                "{\"command\":\"connect\",\"payload\":\"[Interface]\\nPrivateKey = c2hvcnQ=\"}\n"
            )
            .await,
            "false\n"
        );
        assert_eq!(driver.created_total(), 0);
        assert_eq!(handle.snapshot().await.unwrap().state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (_driver, handle) = supervisor();
        let request = format!(
            "{}\n",
            serde_json::to_string(&CommandRequest::connect(config_text())).unwrap()
        );
        assert_eq!(round_trip(&handle, &request).await, "Connected\n");
        assert_eq!(round_trip(&handle, &request).await, "false\n");
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let (_driver, handle) = supervisor();
        let (mut client, server) = tokio::io::duplex(1024);
        let serve = tokio::spawn(async move {
            handle_connection(server, &handle, Duration::from_millis(50)).await
        });

        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        serve.await.unwrap().unwrap();
        assert_eq!(reply, "false\n");
    }

    #[tokio::test]
    async fn test_recreate_retries_after_failures() {
        let (_tx, mut rx) = watch::channel(false);
        let mut attempts = 0;
        let created = recreate_until(
            "test-pipe",
            || {
                attempts += 1;
                if attempts < 3 {
                    Err(std::io::Error::other("no more pipe instances"))
                } else {
                    Ok(attempts)
                }
            },
            &mut rx,
        )
        .await;
        assert_eq!(created, Some(3));
    }

    #[tokio::test]
    async fn test_recreate_gives_up_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            tx.send(true).unwrap();
            tx
        });

        let created: Option<()> = recreate_until(
            "test-pipe",
            || Err(std::io::Error::other("no more pipe instances")),
            &mut rx,
        )
        .await;
        assert!(created.is_none());
        drop(stop.await.unwrap());
    }
}
