//! Protocol types for the control socket.
//!
//! Other processes drive a running node over a Unix socket using
//! JSON-serialized Request/Response lines. The four bridge item shapes are
//! queued onto the node's command bridge; the rest are answered directly.

use serde::{Deserialize, Serialize};

/// Lifecycle of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Outbound TCP connect in progress.
    Connecting,
    /// Connected, waiting for `BOTLINK`/`LINKACK`.
    AwaitingHandshake,
    /// Secret established, waiting for the peer's proof.
    AwaitingAuth,
    Authenticated,
    Closed,
}

impl LinkState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::AwaitingHandshake => "awaiting_handshake",
            Self::AwaitingAuth => "awaiting_auth",
            Self::Authenticated => "authenticated",
            Self::Closed => "closed",
        }
    }
}

/// Who opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }
}

/// Work submitted to a node through its command bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeItem {
    /// Open a link to a bot from the directory.
    Link { handle: String },

    /// Drop a link.
    Unlink { handle: String },

    /// Partyline chat line to relay across the botnet.
    Chat {
        user: String,
        text: String,
        /// Partyline channel (0 = global).
        #[serde(default)]
        channel: u32,
    },

    /// Dot-command line issued by a partyline user, e.g. `.relay botnet say hi`.
    Cmd { cmd: String, user: String },
}

impl BridgeItem {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Link { .. } => "link",
            Self::Unlink { .. } => "unlink",
            Self::Chat { .. } => "chat",
            Self::Cmd { .. } => "cmd",
        }
    }
}

/// Requests that are answered by the node rather than queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// List current links.
    Peers,

    /// Health check.
    Ping,

    /// Close every link and stop the node.
    Shutdown,
}

/// Any request accepted on the control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Request {
    Bridge(BridgeItem),
    Control(ControlRequest),
}

impl From<BridgeItem> for Request {
    fn from(item: BridgeItem) -> Self {
        Self::Bridge(item)
    }
}

impl From<ControlRequest> for Request {
    fn from(request: ControlRequest) -> Self {
        Self::Control(request)
    }
}

/// One link as reported by `peers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub handle: String,
    pub host: String,
    pub port: u16,
    pub subnet_id: Option<u32>,
    pub state: LinkState,
    pub direction: Direction,
}

/// Responses from the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Generic success with no data.
    Ok,

    /// Pong response to Ping.
    Pong,

    /// The bridge item was accepted into the inbox.
    Queued,

    /// Current links.
    Peers { peers: Vec<PeerInfo> },

    /// Error response.
    Error { message: String },
}

impl Response {
    /// Create an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_item_wire_shapes() {
        let link: Request = serde_json::from_str(r#"{"type":"link","handle":"leaf1"}"#)
            .expect("deserialize link");
        assert_eq!(
            link,
            Request::Bridge(BridgeItem::Link {
                handle: "leaf1".into()
            })
        );

        let chat: Request =
            serde_json::from_str(r#"{"type":"chat","user":"alice","text":"hi all"}"#)
                .expect("deserialize chat");
        assert!(matches!(
            chat,
            Request::Bridge(BridgeItem::Chat { channel: 0, .. })
        ));

        let cmd: Request =
            serde_json::from_str(r#"{"type":"cmd","cmd":".relay botnet say hi","user":"alice"}"#)
                .expect("deserialize cmd");
        assert!(matches!(cmd, Request::Bridge(BridgeItem::Cmd { .. })));
    }

    #[test]
    fn test_control_requests_fall_through_untagged() {
        let ping: Request = serde_json::from_str(r#"{"type":"ping"}"#).expect("deserialize");
        assert_eq!(ping, Request::Control(ControlRequest::Ping));

        let json = serde_json::to_string(&Request::from(ControlRequest::Shutdown))
            .expect("serialize");
        assert_eq!(json, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn test_unknown_request_type_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"type":"spawn"}"#).is_err());
        assert!(serde_json::from_str::<Request>(r#"{"type":"link"}"#).is_err());
    }

    #[test]
    fn test_peers_response_serialization() {
        let response = Response::Peers {
            peers: vec![PeerInfo {
                handle: "leaf1".into(),
                host: "10.0.0.2".into(),
                port: 3333,
                subnet_id: Some(1),
                state: LinkState::AwaitingAuth,
                direction: Direction::Outbound,
            }],
        };
        let json = serde_json::to_string(&response).expect("serialize");
        assert!(json.contains(r#""type":"peers""#));
        assert!(json.contains(r#""state":"awaiting_auth""#));

        let parsed: Response = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(parsed, Response::Peers { peers } if peers[0].handle == "leaf1"));
    }

    #[test]
    fn test_error_response() {
        let json = serde_json::to_string(&Response::error("bot not linked")).expect("serialize");
        assert_eq!(json, r#"{"type":"error","message":"bot not linked"}"#);
    }
}
