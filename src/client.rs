//! Client for a running node's control socket.

#![allow(unsafe_code)] // getuid() call

use crate::protocol::{BridgeItem, ControlRequest, PeerInfo, Request, Response};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to node at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send request: {0}")]
    Send(#[source] std::io::Error),

    #[error("failed to receive response: {0}")]
    Receive(#[source] std::io::Error),

    #[error("failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize response: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("node returned error: {0}")]
    Node(String),

    #[error("unexpected response: {0:?}")]
    Unexpected(Response),

    #[error("connection lost")]
    ConnectionLost,
}

/// Default control socket path.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join("botlink.sock")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/botlink-{uid}.sock"))
    }
}

/// Connection to one node's control socket.
pub struct Client {
    socket_path: PathBuf,
    stream: Option<BufReader<UnixStream>>,
}

impl Client {
    #[must_use]
    pub const fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            stream: None,
        }
    }

    #[must_use]
    pub fn with_default_path() -> Self {
        Self::new(default_socket_path())
    }

    /// Connect if not already connected.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;
        debug!(path = %self.socket_path.display(), "Connected to node");
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    /// Send one request and wait for its response line.
    pub async fn request(&mut self, request: impl Into<Request>) -> Result<Response, ClientError> {
        self.connect().await?;
        let stream = self.stream.as_mut().ok_or(ClientError::ConnectionLost)?;

        let mut json = serde_json::to_string(&request.into()).map_err(ClientError::Serialize)?;
        json.push('\n');
        stream
            .get_mut()
            .write_all(json.as_bytes())
            .await
            .map_err(ClientError::Send)?;

        let mut line = String::new();
        let n = stream
            .read_line(&mut line)
            .await
            .map_err(ClientError::Receive)?;
        if n == 0 {
            self.stream = None;
            return Err(ClientError::ConnectionLost);
        }

        let response: Response = serde_json::from_str(&line).map_err(ClientError::Deserialize)?;
        if let Response::Error { message } = &response {
            warn!("Node returned error: {}", message);
        }
        Ok(response)
    }

    /// Queue a bridge item on the node.
    pub async fn submit(&mut self, item: BridgeItem) -> Result<(), ClientError> {
        match self.request(item).await? {
            Response::Queued => Ok(()),
            Response::Error { message } => Err(ClientError::Node(message)),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    pub async fn peers(&mut self) -> Result<Vec<PeerInfo>, ClientError> {
        match self.request(ControlRequest::Peers).await? {
            Response::Peers { peers } => Ok(peers),
            Response::Error { message } => Err(ClientError::Node(message)),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        match self.request(ControlRequest::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    /// Ask the node to close its links and exit.
    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        match self.request(ControlRequest::Shutdown).await? {
            Response::Ok => Ok(()),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}
