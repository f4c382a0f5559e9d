//! Link handshake: shared-secret bootstrap followed by mutual proof.
//!
//! The initiator offers a nonce when it holds no secret for the peer; the
//! acceptor answers with its own nonce and both sides derive
//! `H(initiator_nonce : acceptor_nonce)`. Each side then proves possession
//! with `H(sender : secret : receiver)`. `H` is SHA-256, hex encoded.
//!
//! The nonces travel in the clear, so the bootstrap only guards against
//! misconfigured links, not against an attacker on the wire.
//!
//! [`Negotiator`] is a plain state machine: feed it frames, send whatever it
//! returns. It owns no socket, which keeps it testable in isolation.

use crate::directory::{BotDirectory, DirectoryError};
use crate::frame::Frame;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Link protocol version carried in `BOTLINK`/`LINKACK`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Software version carried in handshake frames.
pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

const NONCE_BYTES: usize = 16;

/// Reasons a handshake is abandoned. Every one of them closes the link.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake mismatch: {0}")]
    Mismatch(String),

    #[error("unknown bot: {0}")]
    UnknownPeer(String),

    #[error("no credential for {0}: no stored secret and no nonce offered")]
    NoCredential(String),

    #[error("authentication failed for {0}")]
    AuthFailure(String),

    #[error("directory error: {0}")]
    Directory(#[source] DirectoryError),
}

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Initiator,
    Acceptor,
}

/// Progress of the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for `BOTLINK` (acceptor) or `LINKACK` (initiator).
    AwaitingHandshake,
    /// Secret established, waiting for the peer's `LINKAUTH`.
    AwaitingAuth,
    Authenticated,
    Failed,
}

/// Derive the shared secret from both nonces, initiator nonce first.
#[must_use]
pub fn derive_secret(initiator_nonce: &str, acceptor_nonce: &str) -> String {
    digest(&[initiator_nonce, acceptor_nonce])
}

/// Proof that `sender` holds `secret`, addressed to `receiver`.
#[must_use]
pub fn proof(sender: &str, secret: &str, receiver: &str) -> String {
    digest(&[sender, secret, receiver])
}

/// A fresh random nonce, hex encoded.
#[must_use]
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn digest(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            hasher.update(b":");
        }
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

/// Handshake state for one connection.
pub struct Negotiator {
    side: Side,
    me: String,
    peer: Option<String>,
    directory: Arc<dyn BotDirectory>,
    phase: Phase,
    my_nonce: Option<String>,
    secret: Option<String>,
    peer_verified: bool,
    ready_sent: bool,
}

impl Negotiator {
    /// Negotiator for a link we open to `peer`.
    pub fn initiator(
        me: impl Into<String>,
        peer: impl Into<String>,
        directory: Arc<dyn BotDirectory>,
    ) -> Self {
        Self::new(Side::Initiator, me.into(), Some(peer.into()), directory)
    }

    /// Negotiator for a connection someone opened to us.
    pub fn acceptor(me: impl Into<String>, directory: Arc<dyn BotDirectory>) -> Self {
        Self::new(Side::Acceptor, me.into(), None, directory)
    }

    fn new(side: Side, me: String, peer: Option<String>, directory: Arc<dyn BotDirectory>) -> Self {
        Self {
            side,
            me,
            peer,
            directory,
            phase: Phase::AwaitingHandshake,
            my_nonce: None,
            secret: None,
            peer_verified: false,
            ready_sent: false,
        }
    }

    #[must_use]
    pub const fn side(&self) -> Side {
        self.side
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Remote handle; known from the start for initiators, after `BOTLINK`
    /// for acceptors.
    #[must_use]
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self.phase, Phase::Authenticated)
    }

    /// Build the opening `BOTLINK`. Only valid for initiators.
    pub fn start(&mut self) -> Result<Frame, HandshakeError> {
        let peer = match (self.side, &self.peer) {
            (Side::Initiator, Some(peer)) => peer.clone(),
            _ => {
                return Err(HandshakeError::Mismatch(
                    "only the initiator opens a handshake".into(),
                ));
            }
        };
        let record = self.lookup(&peer)?;
        self.secret = record.shared_secret;
        if self.secret.is_none() {
            self.my_nonce = Some(generate_nonce());
            debug!(%peer, "No stored secret, offering nonce");
        }
        Ok(Frame::Botlink {
            from: self.me.clone(),
            to: peer,
            version: PROTOCOL_VERSION,
            software: SOFTWARE_VERSION.to_string(),
            nonce: self.my_nonce.clone(),
        })
    }

    /// Consume one handshake frame and return the frames to send back.
    ///
    /// Any error leaves the negotiator in [`Phase::Failed`]; the caller must
    /// close the connection.
    pub fn handle(&mut self, frame: &Frame) -> Result<Vec<Frame>, HandshakeError> {
        if self.phase == Phase::Failed {
            return Err(HandshakeError::Mismatch("handshake already failed".into()));
        }
        let result = self.step(frame);
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }

    fn step(&mut self, frame: &Frame) -> Result<Vec<Frame>, HandshakeError> {
        match (self.side, self.phase, frame) {
            (
                Side::Acceptor,
                Phase::AwaitingHandshake,
                Frame::Botlink {
                    from,
                    to,
                    version,
                    nonce,
                    ..
                },
            ) => self.on_botlink(from, to, *version, nonce.as_deref()),

            (
                Side::Initiator,
                Phase::AwaitingHandshake,
                Frame::LinkAck {
                    from,
                    to,
                    version,
                    nonce,
                    ..
                },
            ) => self.on_linkack(from, to, *version, nonce.as_deref()),

            (_, Phase::AwaitingAuth, Frame::LinkAuth { from, proof }) => {
                self.on_linkauth(from, proof)
            }

            (_, Phase::AwaitingAuth | Phase::Authenticated, Frame::LinkReady { from, .. }) => {
                self.expect_peer(from)?;
                if !self.peer_verified {
                    warn!(peer = %from, "LINKREADY before a verified LINKAUTH, ignoring");
                }
                Ok(Vec::new())
            }

            (_, Phase::Authenticated, Frame::LinkAuth { from, .. }) => {
                debug!(peer = %from, "Duplicate LINKAUTH after authentication, ignoring");
                Ok(Vec::new())
            }

            (side, phase, other) => Err(HandshakeError::Mismatch(format!(
                "unexpected {} for {side:?} in {phase:?}",
                other.kind()
            ))),
        }
    }

    fn on_botlink(
        &mut self,
        from: &str,
        to: &str,
        version: u32,
        nonce: Option<&str>,
    ) -> Result<Vec<Frame>, HandshakeError> {
        if to != self.me {
            return Err(HandshakeError::Mismatch(format!(
                "BOTLINK addressed to {to}, I am {}",
                self.me
            )));
        }
        if version != PROTOCOL_VERSION {
            return Err(HandshakeError::Mismatch(format!(
                "protocol version {version}, expected {PROTOCOL_VERSION}"
            )));
        }
        let record = self.lookup(from)?;
        self.peer = Some(from.to_string());

        let (secret, reply_nonce) = match (record.shared_secret, nonce) {
            (Some(secret), _) => (secret, None),
            (None, Some(initiator_nonce)) => {
                let acceptor_nonce = generate_nonce();
                let secret = derive_secret(initiator_nonce, &acceptor_nonce);
                self.directory
                    .set_secret(from, &secret)
                    .map_err(HandshakeError::Directory)?;
                info!(peer = %from, "Derived new shared secret");
                (secret, Some(acceptor_nonce))
            }
            (None, None) => return Err(HandshakeError::NoCredential(from.to_string())),
        };
        self.secret = Some(secret);
        self.my_nonce = reply_nonce.clone();

        let ack = Frame::LinkAck {
            from: self.me.clone(),
            to: from.to_string(),
            version: PROTOCOL_VERSION,
            software: SOFTWARE_VERSION.to_string(),
            nonce: reply_nonce,
        };
        let auth = self.auth_frame(from)?;
        self.phase = Phase::AwaitingAuth;
        Ok(vec![ack, auth])
    }

    fn on_linkack(
        &mut self,
        from: &str,
        to: &str,
        version: u32,
        nonce: Option<&str>,
    ) -> Result<Vec<Frame>, HandshakeError> {
        self.expect_peer(from)?;
        if to != self.me {
            return Err(HandshakeError::Mismatch(format!(
                "LINKACK addressed to {to}, I am {}",
                self.me
            )));
        }
        if version != PROTOCOL_VERSION {
            return Err(HandshakeError::Mismatch(format!(
                "protocol version {version}, expected {PROTOCOL_VERSION}"
            )));
        }

        if self.secret.is_none() {
            match (self.my_nonce.as_deref(), nonce) {
                (Some(initiator_nonce), Some(acceptor_nonce)) => {
                    let secret = derive_secret(initiator_nonce, acceptor_nonce);
                    self.directory
                        .set_secret(from, &secret)
                        .map_err(HandshakeError::Directory)?;
                    info!(peer = %from, "Derived new shared secret");
                    self.secret = Some(secret);
                }
                _ => return Err(HandshakeError::NoCredential(from.to_string())),
            }
        }

        let auth = self.auth_frame(from)?;
        self.phase = Phase::AwaitingAuth;
        Ok(vec![auth])
    }

    fn on_linkauth(&mut self, from: &str, presented: &str) -> Result<Vec<Frame>, HandshakeError> {
        self.expect_peer(from)?;
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| HandshakeError::NoCredential(from.to_string()))?;
        let expected = proof(from, secret, &self.me);
        if !constant_time_eq(&expected, &presented.to_ascii_lowercase()) {
            return Err(HandshakeError::AuthFailure(from.to_string()));
        }

        self.peer_verified = true;
        self.phase = Phase::Authenticated;
        info!(peer = %from, side = ?self.side, "Link authenticated");

        if self.ready_sent {
            return Ok(Vec::new());
        }
        self.ready_sent = true;
        Ok(vec![Frame::LinkReady {
            from: self.me.clone(),
            software: SOFTWARE_VERSION.to_string(),
        }])
    }

    fn auth_frame(&self, peer: &str) -> Result<Frame, HandshakeError> {
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| HandshakeError::NoCredential(peer.to_string()))?;
        Ok(Frame::LinkAuth {
            from: self.me.clone(),
            proof: proof(&self.me, secret, peer),
        })
    }

    fn expect_peer(&self, from: &str) -> Result<(), HandshakeError> {
        match &self.peer {
            Some(peer) if peer == from => Ok(()),
            Some(peer) => Err(HandshakeError::Mismatch(format!(
                "frame from {from}, expected {peer}"
            ))),
            None => Err(HandshakeError::Mismatch(format!(
                "frame from {from} before BOTLINK"
            ))),
        }
    }

    fn lookup(&self, handle: &str) -> Result<crate::directory::BotRecord, HandshakeError> {
        self.directory.get(handle).map_err(|e| match e {
            DirectoryError::NotFound(h) => HandshakeError::UnknownPeer(h),
            other => HandshakeError::Directory(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{BotRecord, MemoryDirectory};

    fn directory(records: Vec<BotRecord>) -> Arc<MemoryDirectory> {
        let dir = MemoryDirectory::new();
        for r in records {
            dir.add_bot(r).expect("add bot");
        }
        Arc::new(dir)
    }

    /// Pump frames between two negotiators until neither has anything to say.
    fn run_pair(initiator: &mut Negotiator, acceptor: &mut Negotiator) -> Result<(), HandshakeError> {
        let mut to_acceptor = vec![initiator.start()?];
        let mut to_initiator: Vec<Frame> = Vec::new();
        while !to_acceptor.is_empty() || !to_initiator.is_empty() {
            for frame in std::mem::take(&mut to_acceptor) {
                to_initiator.extend(acceptor.handle(&frame)?);
            }
            for frame in std::mem::take(&mut to_initiator) {
                to_acceptor.extend(initiator.handle(&frame)?);
            }
        }
        Ok(())
    }

    #[test]
    fn test_bootstrap_derives_identical_secret() {
        let hub_dir = directory(vec![BotRecord::new("leaf1").at("127.0.0.1", 3333)]);
        let leaf_dir = directory(vec![BotRecord::new("hub1")]);

        let mut hub = Negotiator::initiator("hub1", "leaf1", hub_dir.clone());
        let mut leaf = Negotiator::acceptor("leaf1", leaf_dir.clone());
        run_pair(&mut hub, &mut leaf).expect("handshake");

        assert!(hub.is_authenticated());
        assert!(leaf.is_authenticated());
        assert_eq!(leaf.peer(), Some("hub1"));

        let hub_secret = hub_dir.get("leaf1").expect("get").shared_secret;
        let leaf_secret = leaf_dir.get("hub1").expect("get").shared_secret;
        assert!(hub_secret.is_some());
        assert_eq!(hub_secret, leaf_secret);
    }

    #[test]
    fn test_stored_secret_skips_nonces() {
        let hub_dir = directory(vec![BotRecord::new("leaf1").with_secret("s3cret")]);
        let leaf_dir = directory(vec![BotRecord::new("hub1").with_secret("s3cret")]);

        let mut hub = Negotiator::initiator("hub1", "leaf1", hub_dir);
        let offer = hub.start().expect("start");
        assert!(matches!(offer, Frame::Botlink { nonce: None, .. }));

        let mut leaf = Negotiator::acceptor("leaf1", leaf_dir);
        let replies = leaf.handle(&offer).expect("botlink");
        assert!(matches!(replies[0], Frame::LinkAck { nonce: None, .. }));
        assert!(matches!(replies[1], Frame::LinkAuth { .. }));
    }

    #[test]
    fn test_proof_order_is_sender_secret_receiver() {
        let secret = derive_secret("aa", "bb");
        assert_ne!(derive_secret("aa", "bb"), derive_secret("bb", "aa"));

        // Initiator -> acceptor direction.
        let from_hub = proof("hub1", &secret, "leaf1");
        let leaf_dir = directory(vec![BotRecord::new("hub1").with_secret(secret.clone())]);
        let mut leaf = Negotiator::acceptor("leaf1", leaf_dir);
        leaf.handle(&Frame::Botlink {
            from: "hub1".into(),
            to: "leaf1".into(),
            version: PROTOCOL_VERSION,
            software: SOFTWARE_VERSION.into(),
            nonce: None,
        })
        .expect("botlink");
        let replies = leaf
            .handle(&Frame::LinkAuth {
                from: "hub1".into(),
                proof: from_hub,
            })
            .expect("valid proof");
        assert!(leaf.is_authenticated());
        assert!(matches!(&replies[..], [Frame::LinkReady { from, .. }] if from == "leaf1"));

        // Acceptor -> initiator direction.
        let from_leaf = proof("leaf1", &secret, "hub1");
        let hub_dir = directory(vec![BotRecord::new("leaf1").with_secret(secret.clone())]);
        let mut hub = Negotiator::initiator("hub1", "leaf1", hub_dir);
        hub.start().expect("start");
        hub.handle(&Frame::LinkAck {
            from: "leaf1".into(),
            to: "hub1".into(),
            version: PROTOCOL_VERSION,
            software: SOFTWARE_VERSION.into(),
            nonce: None,
        })
        .expect("linkack");
        hub.handle(&Frame::LinkAuth {
            from: "leaf1".into(),
            proof: from_leaf,
        })
        .expect("valid proof");
        assert!(hub.is_authenticated());

        // Swapped handles must not verify.
        assert_ne!(proof("hub1", &secret, "leaf1"), proof("leaf1", &secret, "hub1"));
    }

    #[test]
    fn test_wrong_proof_fails_and_never_sends_ready() {
        let leaf_dir = directory(vec![BotRecord::new("hub1").with_secret("s3cret")]);
        let mut leaf = Negotiator::acceptor("leaf1", leaf_dir);
        let replies = leaf
            .handle(&Frame::Botlink {
                from: "hub1".into(),
                to: "leaf1".into(),
                version: PROTOCOL_VERSION,
                software: SOFTWARE_VERSION.into(),
                nonce: None,
            })
            .expect("botlink");
        assert!(!replies.iter().any(|f| matches!(f, Frame::LinkReady { .. })));

        let bogus = proof("hub1", "other-secret", "leaf1");
        let err = leaf
            .handle(&Frame::LinkAuth {
                from: "hub1".into(),
                proof: bogus,
            })
            .expect_err("should fail");
        assert!(matches!(err, HandshakeError::AuthFailure(h) if h == "hub1"));
        assert_eq!(leaf.phase(), Phase::Failed);
        assert!(!leaf.is_authenticated());
    }

    #[test]
    fn test_linkready_alone_does_not_authenticate() {
        let leaf_dir = directory(vec![BotRecord::new("hub1").with_secret("s3cret")]);
        let mut leaf = Negotiator::acceptor("leaf1", leaf_dir);
        leaf.handle(&Frame::Botlink {
            from: "hub1".into(),
            to: "leaf1".into(),
            version: PROTOCOL_VERSION,
            software: SOFTWARE_VERSION.into(),
            nonce: None,
        })
        .expect("botlink");
        let replies = leaf
            .handle(&Frame::LinkReady {
                from: "hub1".into(),
                software: SOFTWARE_VERSION.into(),
            })
            .expect("ignored");
        assert!(replies.is_empty());
        assert_eq!(leaf.phase(), Phase::AwaitingAuth);
    }

    #[test]
    fn test_botlink_for_someone_else_is_mismatch() {
        let leaf_dir = directory(vec![BotRecord::new("hub1")]);
        let mut leaf = Negotiator::acceptor("leaf1", leaf_dir);
        let err = leaf
            .handle(&Frame::Botlink {
                from: "hub1".into(),
                to: "leaf7".into(),
                version: PROTOCOL_VERSION,
                software: SOFTWARE_VERSION.into(),
                nonce: Some("00".into()),
            })
            .expect_err("mismatch");
        assert!(matches!(err, HandshakeError::Mismatch(_)));
    }

    #[test]
    fn test_version_mismatch() {
        let leaf_dir = directory(vec![BotRecord::new("hub1")]);
        let mut leaf = Negotiator::acceptor("leaf1", leaf_dir);
        let err = leaf
            .handle(&Frame::Botlink {
                from: "hub1".into(),
                to: "leaf1".into(),
                version: PROTOCOL_VERSION + 1,
                software: "9.9.9".into(),
                nonce: Some("00".into()),
            })
            .expect_err("mismatch");
        assert!(matches!(err, HandshakeError::Mismatch(_)));
    }

    #[test]
    fn test_no_secret_and_no_nonce_is_no_credential() {
        let leaf_dir = directory(vec![BotRecord::new("hub1")]);
        let mut leaf = Negotiator::acceptor("leaf1", leaf_dir);
        let err = leaf
            .handle(&Frame::Botlink {
                from: "hub1".into(),
                to: "leaf1".into(),
                version: PROTOCOL_VERSION,
                software: SOFTWARE_VERSION.into(),
                nonce: None,
            })
            .expect_err("no credential");
        assert!(matches!(err, HandshakeError::NoCredential(h) if h == "hub1"));
    }

    #[test]
    fn test_initiator_without_secret_rejects_bare_ack() {
        let hub_dir = directory(vec![BotRecord::new("leaf1")]);
        let mut hub = Negotiator::initiator("hub1", "leaf1", hub_dir);
        hub.start().expect("start");
        let err = hub
            .handle(&Frame::LinkAck {
                from: "leaf1".into(),
                to: "hub1".into(),
                version: PROTOCOL_VERSION,
                software: SOFTWARE_VERSION.into(),
                nonce: None,
            })
            .expect_err("no credential");
        assert!(matches!(err, HandshakeError::NoCredential(_)));
    }

    #[test]
    fn test_unknown_bot_is_rejected() {
        let leaf_dir = directory(vec![]);
        let mut leaf = Negotiator::acceptor("leaf1", leaf_dir);
        let err = leaf
            .handle(&Frame::Botlink {
                from: "stranger".into(),
                to: "leaf1".into(),
                version: PROTOCOL_VERSION,
                software: SOFTWARE_VERSION.into(),
                nonce: Some("ab".into()),
            })
            .expect_err("unknown");
        assert!(matches!(err, HandshakeError::UnknownPeer(h) if h == "stranger"));
    }

    #[test]
    fn test_nonce_is_random_hex() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_eq!(a.len(), NONCE_BYTES * 2);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
