use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use std::io;
use std::time::Duration;

use crate::rpc::{Request, Response};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("service not running")]
    ServiceNotRunning,
    #[error("error connecting to `{endpoint}`: {error}")]
    Connect { endpoint: String, error: io::Error },
    #[error("failed serializing request: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("error writing to control channel: {0}")]
    Write(io::Error),
    #[error("error reading from control channel: {0}")]
    Read(io::Error),
    #[error("control channel closed before the response arrived")]
    ConnectionClosed,
    #[error("request timed out")]
    Timeout,
}

/// Sends one request and waits for its response, skipping interleaved
/// notifications. Used by the control CLI; the UI keeps its own client.
pub async fn process_request(endpoint: &str, request: &Request) -> Result<Response, Error> {
    tokio::time::timeout(REQUEST_TIMEOUT, roundtrip(endpoint, request))
        .await
        .map_err(|_| Error::Timeout)?
}

async fn roundtrip(endpoint: &str, request: &Request) -> Result<Response, Error> {
    let stream = connect(endpoint).await?;
    let (read_half, mut write_half) = tokio::io::split(stream);

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await.map_err(Error::Write)?;
    write_half.flush().await.map_err(Error::Write)?;

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await.map_err(Error::Read)? {
        let Ok(response) = serde_json::from_str::<Response>(&line) else {
            continue;
        };
        if response.id.as_deref() == Some(request.id.as_str()) {
            return Ok(response);
        }
    }
    Err(Error::ConnectionClosed)
}

#[cfg(windows)]
async fn connect(endpoint: &str) -> Result<tokio::net::windows::named_pipe::NamedPipeClient, Error> {
    use tokio::net::windows::named_pipe::ClientOptions;

    ClientOptions::new().open(endpoint).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::ServiceNotRunning,
        _ => Error::Connect {
            endpoint: endpoint.to_string(),
            error: e,
        },
    })
}

#[cfg(unix)]
async fn connect(endpoint: &str) -> Result<tokio::net::UnixStream, Error> {
    tokio::net::UnixStream::connect(endpoint).await.map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::ServiceNotRunning,
        _ => Error::Connect {
            endpoint: endpoint.to_string(),
            error: e,
        },
    })
}
