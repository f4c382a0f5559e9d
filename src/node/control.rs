//! Unix control socket.
//!
//! Line-delimited JSON: one [`Request`] per line in, one [`Response`] per
//! line out. Bridge items are queued, everything else is answered here.

use super::{NodeError, NodeHandle};
use crate::protocol::{ControlRequest, Request, Response};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Bind the control socket, replacing a stale one.
pub(crate) fn bind(path: &Path) -> Result<UnixListener, NodeError> {
    if path.exists() {
        let metadata = std::fs::symlink_metadata(path).map_err(NodeError::Io)?;
        if metadata.file_type().is_symlink() {
            return Err(NodeError::Bind(std::io::Error::other(
                "control socket path is a symlink",
            )));
        }
        if metadata.file_type().is_socket() || metadata.file_type().is_file() {
            std::fs::remove_file(path).ok();
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(NodeError::Io)?;
    }

    let listener = UnixListener::bind(path).map_err(NodeError::Bind)?;

    // Owner-only
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms).map_err(NodeError::Io)?;
    }

    info!(path = %path.display(), "Control socket listening");
    Ok(listener)
}

/// Accept control connections until shutdown, then remove the socket file.
pub(crate) async fn serve(
    listener: UnixListener,
    path: PathBuf,
    node: NodeHandle,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        debug!("Accepted control connection");
                        let node = node.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, node).await {
                                error!("Control connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Control accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    std::fs::remove_file(&path).ok();
    debug!(path = %path.display(), "Control socket removed");
}

async fn handle_connection(stream: UnixStream, node: NodeHandle) -> Result<(), NodeError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await.map_err(NodeError::Io)?;
        if n == 0 {
            debug!("Control client disconnected");
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let (response, stop) = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!(?request, "Control request");
                let stop = matches!(request, Request::Control(ControlRequest::Shutdown));
                (handle_request(request, &node).await, stop)
            }
            Err(e) => (Response::error(format!("invalid request: {e}")), false),
        };

        let mut json = serde_json::to_string(&response).map_err(NodeError::Serialize)?;
        json.push('\n');
        writer.write_all(json.as_bytes()).await.map_err(NodeError::Io)?;

        if stop {
            node.shutdown().await;
            return Ok(());
        }
    }
}

async fn handle_request(request: Request, node: &NodeHandle) -> Response {
    match request {
        Request::Bridge(item) => match node.submit(item) {
            Ok(()) => Response::Queued,
            Err(e) => {
                warn!(error = %e, "Rejected bridge item");
                Response::error(e.to_string())
            }
        },
        Request::Control(ControlRequest::Ping) => Response::Pong,
        Request::Control(ControlRequest::Peers) => match node.peers().await {
            Ok(peers) => Response::Peers { peers },
            Err(e) => Response::error(e.to_string()),
        },
        Request::Control(ControlRequest::Shutdown) => {
            info!("Shutdown requested over control socket");
            Response::Ok
        }
    }
}
