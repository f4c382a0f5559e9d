//! Wire codec for the bot-to-bot link protocol.
//!
//! Every frame is one newline-terminated UTF-8 line. Handshake and chat
//! frames are space-separated words; commands and state sync carry a JSON
//! payload after a `KIND:` prefix. Lines are parsed once, here, into a
//! closed [`Frame`] enum so nothing downstream looks at raw text again.

use crate::directory::{ChannelRecord, UserRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Product tag carried in handshake frames.
pub const PRODUCT: &str = "WBS";

/// Errors produced while decoding a line.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown frame kind: {0}")]
    UnknownKind(String),

    #[error("malformed {kind} frame: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("invalid JSON in {kind} frame: {source}")]
    Json {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl FrameError {
    fn malformed(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            reason: reason.into(),
        }
    }
}

/// Where a relayed command should run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    /// Only the bot that receives it.
    Me,
    /// Every linked bot sharing the sender's subnet.
    Subnet,
    /// Every linked bot.
    Botnet,
    /// One bot, by handle.
    Bot(String),
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        match value.as_str() {
            "me" => Self::Me,
            "subnet" => Self::Subnet,
            "botnet" | "all" => Self::Botnet,
            _ => Self::Bot(value),
        }
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Target> for String {
    fn from(value: Target) -> Self {
        match value {
            Target::Me => "me".to_string(),
            Target::Subnet => "subnet".to_string(),
            Target::Botnet => "botnet".to_string(),
            Target::Bot(handle) => handle,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Me => f.write_str("me"),
            Self::Subnet => f.write_str("subnet"),
            Self::Botnet => f.write_str("botnet"),
            Self::Bot(handle) => f.write_str(handle),
        }
    }
}

/// JSON body of a `CMD:` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCommand {
    pub cmd: String,
    #[serde(default)]
    pub args: String,
    pub target: Target,
    /// Bot that first put the command on the botnet. Older peers omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// One decoded line of the link protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Handshake offer from the initiating bot.
    Botlink {
        from: String,
        to: String,
        version: u32,
        software: String,
        nonce: Option<String>,
    },
    /// Handshake reply from the accepting bot.
    LinkAck {
        from: String,
        to: String,
        version: u32,
        software: String,
        nonce: Option<String>,
    },
    /// Proof of possession of the shared secret.
    LinkAuth { from: String, proof: String },
    /// Sent once the peer's proof checked out.
    LinkReady { from: String, software: String },
    /// Partyline chat line relayed across the botnet.
    Chat {
        from: String,
        nick: String,
        text: String,
    },
    Cmd(RelayCommand),
    ShareUsers(Vec<UserRecord>),
    ShareChans(Vec<ChannelRecord>),
}

impl Frame {
    /// Build a `CHAT` frame. `from` and `nick` must be single words and
    /// `text` must stay on one line, otherwise the peer would read the
    /// fields (or a second frame) differently.
    pub fn chat(
        from: impl Into<String>,
        nick: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Self, FrameError> {
        let (from, nick, text) = (from.into(), nick.into(), text.into());
        if !is_word(&from) || !is_word(&nick) {
            return Err(FrameError::malformed(
                "CHAT",
                "origin and nick must be single words",
            ));
        }
        if text.contains(['\r', '\n']) {
            return Err(FrameError::malformed("CHAT", "text contains a line break"));
        }
        Ok(Self::Chat { from, nick, text })
    }

    /// Decode one line. A trailing `\n` or `\r\n` is ignored.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(FrameError::Empty);
        }

        if let Some(json) = line.strip_prefix("CMD:") {
            return serde_json::from_str(json)
                .map(Self::Cmd)
                .map_err(|source| FrameError::Json { kind: "CMD", source });
        }
        if let Some(json) = line.strip_prefix("SHAREUSERS:") {
            return serde_json::from_str(json)
                .map(Self::ShareUsers)
                .map_err(|source| FrameError::Json {
                    kind: "SHAREUSERS",
                    source,
                });
        }
        if let Some(json) = line.strip_prefix("SHARECHANS:") {
            return serde_json::from_str(json)
                .map(Self::ShareChans)
                .map_err(|source| FrameError::Json {
                    kind: "SHARECHANS",
                    source,
                });
        }

        let keyword = line.split(' ').next().unwrap_or_default();
        match keyword {
            "BOTLINK" => {
                let (from, to, version, software, nonce) = parse_greeting("BOTLINK", line)?;
                Ok(Self::Botlink {
                    from,
                    to,
                    version,
                    software,
                    nonce,
                })
            }
            "LINKACK" => {
                let (from, to, version, software, nonce) = parse_greeting("LINKACK", line)?;
                Ok(Self::LinkAck {
                    from,
                    to,
                    version,
                    software,
                    nonce,
                })
            }
            "LINKAUTH" => {
                let parts: Vec<&str> = line.split_whitespace().collect();
                let [_, from, proof] = parts.as_slice() else {
                    return Err(FrameError::malformed("LINKAUTH", "expected <handle> <proof>"));
                };
                if !is_hex(proof) {
                    return Err(FrameError::malformed("LINKAUTH", "proof is not hex"));
                }
                Ok(Self::LinkAuth {
                    from: (*from).to_string(),
                    proof: (*proof).to_string(),
                })
            }
            "LINKREADY" => {
                let parts: Vec<&str> = line.split_whitespace().collect();
                let [_, from, product, software] = parts.as_slice() else {
                    return Err(FrameError::malformed(
                        "LINKREADY",
                        "expected <handle> WBS <version>",
                    ));
                };
                if *product != PRODUCT {
                    return Err(FrameError::malformed("LINKREADY", "missing product tag"));
                }
                Ok(Self::LinkReady {
                    from: (*from).to_string(),
                    software: (*software).to_string(),
                })
            }
            "CHAT" => {
                let mut parts = line.splitn(4, ' ');
                parts.next();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(from), Some(nick), Some(text)) => Self::chat(from, nick, text),
                    _ => Err(FrameError::malformed("CHAT", "expected <from> <nick> <text>")),
                }
            }
            other => Err(FrameError::UnknownKind(other.to_string())),
        }
    }

    /// Whether this frame belongs to the link handshake.
    #[must_use]
    pub const fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::Botlink { .. } | Self::LinkAck { .. } | Self::LinkAuth { .. } | Self::LinkReady { .. }
        )
    }

    /// Short name of the frame kind, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Botlink { .. } => "BOTLINK",
            Self::LinkAck { .. } => "LINKACK",
            Self::LinkAuth { .. } => "LINKAUTH",
            Self::LinkReady { .. } => "LINKREADY",
            Self::Chat { .. } => "CHAT",
            Self::Cmd(_) => "CMD",
            Self::ShareUsers(_) => "SHAREUSERS",
            Self::ShareChans(_) => "SHARECHANS",
        }
    }

    /// Encode as a wire line, including the trailing newline.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut line = self.to_string();
        line.push('\n');
        line
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Botlink {
                from,
                to,
                version,
                software,
                nonce,
            } => write_greeting(f, "BOTLINK", from, to, *version, software, nonce.as_deref()),
            Self::LinkAck {
                from,
                to,
                version,
                software,
                nonce,
            } => write_greeting(f, "LINKACK", from, to, *version, software, nonce.as_deref()),
            Self::LinkAuth { from, proof } => write!(f, "LINKAUTH {from} {proof}"),
            Self::LinkReady { from, software } => write!(f, "LINKREADY {from} {PRODUCT} {software}"),
            Self::Chat { from, nick, text } => write!(f, "CHAT {from} {nick} {text}"),
            Self::Cmd(command) => {
                let json = serde_json::to_string(command).map_err(|_| fmt::Error)?;
                write!(f, "CMD:{json}")
            }
            Self::ShareUsers(users) => {
                let json = serde_json::to_string(users).map_err(|_| fmt::Error)?;
                write!(f, "SHAREUSERS:{json}")
            }
            Self::ShareChans(channels) => {
                let json = serde_json::to_string(channels).map_err(|_| fmt::Error)?;
                write!(f, "SHARECHANS:{json}")
            }
        }
    }
}

type Greeting = (String, String, u32, String, Option<String>);

fn parse_greeting(kind: &'static str, line: &str) -> Result<Greeting, FrameError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if !(6..=7).contains(&parts.len()) {
        return Err(FrameError::malformed(
            kind,
            "expected <from> <to> <ver> WBS <version> [nonce]",
        ));
    }
    let version = parts[3]
        .parse::<u32>()
        .map_err(|_| FrameError::malformed(kind, format!("bad protocol version: {}", parts[3])))?;
    if parts[4] != PRODUCT {
        return Err(FrameError::malformed(kind, "missing product tag"));
    }
    let nonce = match parts.get(6) {
        Some(n) if is_hex(n) => Some((*n).to_string()),
        Some(_) => return Err(FrameError::malformed(kind, "nonce is not hex")),
        None => None,
    };
    Ok((
        parts[1].to_string(),
        parts[2].to_string(),
        version,
        parts[5].to_string(),
        nonce,
    ))
}

fn write_greeting(
    f: &mut fmt::Formatter<'_>,
    kind: &str,
    from: &str,
    to: &str,
    version: u32,
    software: &str,
    nonce: Option<&str>,
) -> fmt::Result {
    write!(f, "{kind} {from} {to} {version} {PRODUCT} {software}")?;
    if let Some(nonce) = nonce {
        write!(f, " {nonce}")?;
    }
    Ok(())
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && !s.contains(char::is_whitespace)
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}
