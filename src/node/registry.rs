//! The handle→session map.
//!
//! Only the event loop holds a [`LinkRegistry`]. Sessions report back through
//! [`NodeEvent`](super::NodeEvent)s and the loop applies those reports here,
//! so there is exactly one writer.

use super::SessionId;
use super::session::{InboundLink, LineReader, MAX_LINE_LEN, PeerSession, RawLine, SessionContext};
use crate::directory::DirectoryError;
use crate::frame::Frame;
use crate::hooks::ClientConnection;
use crate::protocol::{Direction, LinkState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// How long an accepted connection has to send its first line.
pub const GREETING_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors opening or accepting a link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unknown bot: {0}")]
    UnknownBot(String),

    #[error("no address/port configured for {0}")]
    NoAddress(String),

    #[error("directory error: {0}")]
    Directory(#[source] DirectoryError),

    #[error("{0} is already linked")]
    AlreadyLinked(String),

    #[error("refusing to link to ourselves")]
    SelfLink,

    #[error("crossed link with {0}, keeping our outbound attempt")]
    CrossedLink(String),

    #[error("no greeting within {}s", GREETING_TIMEOUT.as_secs())]
    GreetingTimeout,

    #[error("connection closed before greeting")]
    NoGreeting,

    #[error("greeting longer than {} bytes", MAX_LINE_LEN)]
    GreetingTooLong,

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<DirectoryError> for LinkError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::NotFound(handle) => Self::UnknownBot(handle),
            other => Self::Directory(other),
        }
    }
}

/// What an accepted connection turned out to be.
pub enum Greeting {
    Bot(InboundLink),
    Client(ClientConnection),
}

/// Read the first line of an accepted connection and decide who is calling.
pub async fn read_greeting(stream: TcpStream, addr: SocketAddr) -> Result<Greeting, LinkError> {
    stream.set_nodelay(true).ok();
    let (reader, writer) = stream.into_split();
    let mut lines = LineReader::new(BufReader::new(reader));

    let line = match tokio::time::timeout(GREETING_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| LinkError::GreetingTimeout)?
        .map_err(LinkError::Io)?
    {
        Some(RawLine::Text(line)) => line,
        Some(RawLine::Overlong(_)) => return Err(LinkError::GreetingTooLong),
        None => return Err(LinkError::NoGreeting),
    };
    let reader = lines.into_inner();

    match Frame::parse(&line) {
        Ok(hello @ Frame::Botlink { .. }) => Ok(Greeting::Bot(InboundLink {
            reader,
            writer,
            addr,
            hello,
        })),
        _ => Ok(Greeting::Client(ClientConnection {
            reader,
            writer,
            first_line: line,
            addr,
        })),
    }
}

/// All current links, keyed by remote handle.
pub struct LinkRegistry {
    ctx: SessionContext,
    sessions: HashMap<String, PeerSession>,
    next_id: SessionId,
}

impl LinkRegistry {
    pub(crate) fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            sessions: HashMap::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Start an outbound link to a bot from the directory.
    ///
    /// Returns `Ok(false)` if a session for `handle` already exists. The TCP
    /// connect happens in the session task; its failure shows up later as a
    /// closed session.
    pub fn connect_peer(&mut self, handle: &str) -> Result<bool, LinkError> {
        if handle == self.ctx.me {
            return Err(LinkError::SelfLink);
        }
        if self.sessions.contains_key(handle) {
            debug!(peer = %handle, "Link already in progress");
            return Ok(false);
        }

        let record = self.ctx.directory.get(handle)?;
        let (Some(host), Some(port)) = (record.address, record.port) else {
            return Err(LinkError::NoAddress(handle.to_string()));
        };

        let id = self.allocate_id();
        info!(peer = %handle, %host, %port, "Linking");
        let session = PeerSession::connect(id, handle.to_string(), host, port, self.ctx.clone());
        self.sessions.insert(handle.to_string(), session);
        Ok(true)
    }

    /// Attach an inbound connection that opened with `BOTLINK`.
    ///
    /// An authenticated link for the same handle wins and the newcomer is
    /// dropped. When both bots dialled each other at once, the bot with the
    /// lower handle keeps its outbound attempt and the other side takes the
    /// inbound one, so exactly one link survives. Any other half-open
    /// session is replaced.
    pub fn accept_inbound(&mut self, link: InboundLink) -> Result<(), LinkError> {
        let handle = link.claimed_handle().to_string();
        if handle == self.ctx.me {
            return Err(LinkError::SelfLink);
        }
        if let Some(existing) = self.sessions.get(&handle) {
            if existing.is_authenticated() {
                return Err(LinkError::AlreadyLinked(handle));
            }
            if existing.direction == Direction::Outbound && self.ctx.me < handle {
                return Err(LinkError::CrossedLink(handle));
            }
            info!(peer = %handle, "Replacing half-open link with inbound connection");
            existing.close();
        }

        let id = self.allocate_id();
        info!(peer = %handle, addr = %link.addr, "Inbound link");
        let session = PeerSession::accept(id, link, self.ctx.clone());
        self.sessions.insert(handle, session);
        Ok(())
    }

    /// Insert an already-built session.
    #[cfg(test)]
    pub(crate) fn attach(&mut self, session: PeerSession) {
        self.next_id = self.next_id.max(session.id + 1);
        self.sessions.insert(session.handle.clone(), session);
    }

    /// Drop a link. Unknown handles are a no-op.
    pub fn unlink(&mut self, handle: &str) -> Option<PeerSession> {
        let session = self.sessions.remove(handle)?;
        session.close();
        info!(peer = %handle, "Unlinked");
        Some(session)
    }

    /// Record a state reported by a session task. Stale ids are ignored.
    pub(crate) fn set_state(
        &mut self,
        id: SessionId,
        state: LinkState,
        subnet_id: Option<u32>,
    ) -> Option<&PeerSession> {
        let session = self.sessions.values_mut().find(|s| s.id == id)?;
        session.state = state;
        if state == LinkState::Authenticated {
            session.subnet_id = subnet_id;
        }
        Some(session)
    }

    /// Remove the session a finished task belonged to.
    pub(crate) fn remove_closed(&mut self, id: SessionId) -> Option<PeerSession> {
        let handle = self.by_id(id)?.handle.clone();
        let mut session = self.sessions.remove(&handle)?;
        session.state = LinkState::Closed;
        Some(session)
    }

    #[must_use]
    pub fn get(&self, handle: &str) -> Option<&PeerSession> {
        self.sessions.get(handle)
    }

    #[must_use]
    pub fn by_id(&self, id: SessionId) -> Option<&PeerSession> {
        self.sessions.values().find(|s| s.id == id)
    }

    /// Every session, ordered by handle.
    pub fn all(&self) -> impl Iterator<Item = &PeerSession> {
        let mut sessions: Vec<_> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.handle.cmp(&b.handle));
        sessions.into_iter()
    }

    /// Sessions that completed the handshake.
    pub fn authenticated(&self) -> impl Iterator<Item = &PeerSession> {
        self.all().filter(|s| s.is_authenticated())
    }

    /// Authenticated sessions in one subnet.
    pub fn in_subnet(&self, subnet_id: u32) -> impl Iterator<Item = &PeerSession> {
        self.authenticated()
            .filter(move |s| s.subnet_id == Some(subnet_id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every link. Used on shutdown.
    pub fn close_all(&mut self) {
        for (handle, session) in self.sessions.drain() {
            debug!(peer = %handle, "Closing link for shutdown");
            session.close();
        }
    }
}
