//! Client side of the command channel

use crate::error::{TunnelError, TunnelResult};
use crate::server::{CommandRequest, StatusReply, REPLY_FAILURE};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

async fn exchange<S>(stream: S, request: &CommandRequest) -> TunnelResult<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let json = serde_json::to_string(request)
        .map_err(|e| TunnelError::Channel(format!("cannot encode request: {}", e)))?;

    let mut reader = BufReader::new(stream);
    let stream = reader.get_mut();
    stream.write_all(json.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if line.is_empty() {
        return Err(TunnelError::Channel("service closed the connection".into()));
    }
    Ok(line.trim_end().to_string())
}

#[cfg(unix)]
async fn connect_and_exchange(endpoint: &str, request: &CommandRequest) -> TunnelResult<String> {
    let stream = tokio::net::UnixStream::connect(endpoint).await?;
    exchange(stream, request).await
}

#[cfg(windows)]
async fn connect_and_exchange(endpoint: &str, request: &CommandRequest) -> TunnelResult<String> {
    let stream = tokio::net::windows::named_pipe::ClientOptions::new().open(endpoint)?;
    exchange(stream, request).await
}

/// Send one request to the service at `endpoint` and return the reply line
pub async fn send_command(
    endpoint: &str,
    request: &CommandRequest,
    timeout: Duration,
) -> TunnelResult<String> {
    tokio::time::timeout(timeout, connect_and_exchange(endpoint, request))
        .await
        .map_err(|_| TunnelError::Timeout(format!("request to {}", endpoint)))?
}

/// Interpret a status reply
pub fn parse_status(reply: &str) -> TunnelResult<StatusReply> {
    if reply == REPLY_FAILURE {
        return Err(TunnelError::Channel("service reported failure".into()));
    }
    serde_json::from_str(reply)
        .map_err(|e| TunnelError::Channel(format!("unexpected status reply '{}': {}", reply, e)))
}
