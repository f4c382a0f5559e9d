//! One link to one remote bot.
//!
//! Each [`PeerSession`] owns a single background task holding both halves of
//! the TCP connection. The task reads frames, drives the handshake, writes
//! whatever the event loop queues for it, and reports state changes and
//! post-auth frames back to the loop. It never touches the registry itself.

use super::{NodeEvent, SessionId};
use crate::directory::BotDirectory;
use crate::frame::Frame;
use crate::handshake::{HandshakeError, Negotiator, Phase};
use crate::protocol::{Direction, LinkState, PeerInfo};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Frames the event loop may queue for one peer before further sends are
/// dropped.
const OUTBOUND_QUEUE: usize = 256;

/// Longest line accepted from a peer, terminator excluded.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// One line off the wire.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RawLine {
    /// Decoded lossily; invalid UTF-8 becomes U+FFFD.
    Text(String),
    /// Longer than [`MAX_LINE_LEN`]; this many bytes were thrown away.
    Overlong(usize),
}

/// Newline-delimited reader that never buffers more than [`MAX_LINE_LEN`]
/// bytes. A partial line lives in `self`, so `next_line` is cancel safe.
pub(crate) struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    discarded: usize,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub(crate) const fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            discarded: 0,
        }
    }

    /// The underlying reader, with any bytes past the last line still buffered.
    pub(crate) fn into_inner(self) -> R {
        self.inner
    }

    /// Next line, or `None` at end of stream.
    pub(crate) async fn next_line(&mut self) -> std::io::Result<Option<RawLine>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() && self.discarded == 0 {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let (chunk, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (&available[..i], true),
                None => (available, false),
            };
            let used = chunk.len() + usize::from(complete);
            if self.discarded > 0 || self.buf.len() + chunk.len() > MAX_LINE_LEN {
                self.discarded += self.buf.len() + chunk.len();
                self.buf.clear();
            } else {
                self.buf.extend_from_slice(chunk);
            }
            self.inner.consume(used);

            if complete {
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> RawLine {
        if self.discarded > 0 {
            self.buf.clear();
            return RawLine::Overlong(std::mem::take(&mut self.discarded));
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        match String::from_utf8(line) {
            Ok(text) => RawLine::Text(text),
            Err(e) => RawLine::Text(String::from_utf8_lossy(e.as_bytes()).into_owned()),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection closed by peer")]
    Eof,

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("event loop stopped")]
    LoopGone,
}

/// Failure to queue a frame for a peer.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("outbound queue full for {0}")]
    Full(String),

    #[error("session closed: {0}")]
    Closed(String),
}

/// What every session task needs from the node.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub me: String,
    pub directory: Arc<dyn BotDirectory>,
    pub events: mpsc::Sender<NodeEvent>,
}

/// An accepted connection whose first line was a `BOTLINK`.
pub struct InboundLink {
    pub(crate) reader: BufReader<OwnedReadHalf>,
    pub(crate) writer: OwnedWriteHalf,
    pub(crate) addr: SocketAddr,
    pub(crate) hello: Frame,
}

impl InboundLink {
    /// Handle the remote bot claims in its `BOTLINK`.
    #[must_use]
    pub fn claimed_handle(&self) -> &str {
        match &self.hello {
            Frame::Botlink { from, .. } => from,
            _ => "",
        }
    }
}

/// Registry entry for a link.
pub struct PeerSession {
    pub(crate) id: SessionId,
    pub(crate) handle: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) subnet_id: Option<u32>,
    pub(crate) state: LinkState,
    pub(crate) direction: Direction,
    outbound: mpsc::Sender<Frame>,
    task: Option<AbortHandle>,
}

impl PeerSession {
    /// Start an outbound link: connect, then open the handshake.
    pub(crate) fn connect(
        id: SessionId,
        handle: String,
        host: String,
        port: u16,
        ctx: SessionContext,
    ) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let task = tokio::spawn(run_outbound(id, handle.clone(), host.clone(), port, ctx, rx));
        Self {
            id,
            handle,
            host,
            port,
            subnet_id: None,
            state: LinkState::Connecting,
            direction: Direction::Outbound,
            outbound: tx,
            task: Some(task.abort_handle()),
        }
    }

    /// Take over an accepted connection and answer its `BOTLINK`.
    pub(crate) fn accept(id: SessionId, link: InboundLink, ctx: SessionContext) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let handle = link.claimed_handle().to_string();
        let host = link.addr.ip().to_string();
        let port = link.addr.port();
        let task = tokio::spawn(run_inbound(id, handle.clone(), link, ctx, rx));
        Self {
            id,
            handle,
            host,
            port,
            subnet_id: None,
            state: LinkState::AwaitingHandshake,
            direction: Direction::Inbound,
            outbound: tx,
            task: Some(task.abort_handle()),
        }
    }

    /// A session with no connection behind it; frames queued for it land in
    /// the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached(
        id: SessionId,
        handle: &str,
        subnet_id: Option<u32>,
        state: LinkState,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let session = Self {
            id,
            handle: handle.to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            subnet_id,
            state,
            direction: Direction::Outbound,
            outbound: tx,
            task: None,
        };
        (session, rx)
    }

    #[must_use]
    pub fn handle(&self) -> &str {
        &self.handle
    }

    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    #[must_use]
    pub const fn subnet_id(&self) -> Option<u32> {
        self.subnet_id
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self.state, LinkState::Authenticated)
    }

    /// Queue a frame without waiting. A full queue drops the frame.
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full(self.handle.clone()),
            mpsc::error::TrySendError::Closed(_) => SendError::Closed(self.handle.clone()),
        })
    }

    /// Stop the session task, dropping the connection.
    pub(crate) fn close(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    #[must_use]
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            handle: self.handle.clone(),
            host: self.host.clone(),
            port: self.port,
            subnet_id: self.subnet_id,
            state: self.state,
            direction: self.direction,
        }
    }
}

async fn run_outbound(
    id: SessionId,
    handle: String,
    host: String,
    port: u16,
    ctx: SessionContext,
    outbound: mpsc::Receiver<Frame>,
) {
    let events = ctx.events.clone();
    let result = async {
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|source| SessionError::Connect {
                addr: format!("{host}:{port}"),
                source,
            })?;
        stream.set_nodelay(true).ok();
        info!(peer = %handle, %host, %port, "Connected, starting handshake");

        let (reader, writer) = stream.into_split();
        let mut negotiator =
            Negotiator::initiator(ctx.me.clone(), handle.clone(), Arc::clone(&ctx.directory));
        let hello = negotiator.start()?;

        let mut conn = Connection::new(
            id,
            handle.clone(),
            BufReader::new(reader),
            writer,
            negotiator,
            ctx,
            LinkState::Connecting,
        );
        conn.report(LinkState::AwaitingHandshake).await?;
        conn.write(&hello).await?;
        conn.run(outbound).await
    }
    .await;
    report_closed(&events, id, &handle, result).await;
}

async fn run_inbound(
    id: SessionId,
    handle: String,
    link: InboundLink,
    ctx: SessionContext,
    outbound: mpsc::Receiver<Frame>,
) {
    let events = ctx.events.clone();
    let result = async {
        let negotiator = Negotiator::acceptor(ctx.me.clone(), Arc::clone(&ctx.directory));
        let mut conn = Connection::new(
            id,
            handle.clone(),
            link.reader,
            link.writer,
            negotiator,
            ctx,
            LinkState::AwaitingHandshake,
        );
        conn.on_frame(link.hello).await?;
        conn.run(outbound).await
    }
    .await;
    report_closed(&events, id, &handle, result).await;
}

async fn report_closed(
    events: &mpsc::Sender<NodeEvent>,
    id: SessionId,
    handle: &str,
    result: Result<(), SessionError>,
) {
    let reason = match result {
        Ok(()) => {
            debug!(peer = %handle, "Session stopped");
            None
        }
        Err(SessionError::Eof) => {
            info!(peer = %handle, "Peer closed the link");
            Some(SessionError::Eof.to_string())
        }
        Err(e) => {
            warn!(peer = %handle, error = %e, "Link closed");
            Some(e.to_string())
        }
    };
    let _ = events.send(NodeEvent::Closed { id, reason }).await;
}

/// The live half of a session, owned by its task.
struct Connection {
    id: SessionId,
    handle: String,
    lines: LineReader<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    negotiator: Negotiator,
    ctx: SessionContext,
    state: LinkState,
}

impl Connection {
    fn new(
        id: SessionId,
        handle: String,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        negotiator: Negotiator,
        ctx: SessionContext,
        state: LinkState,
    ) -> Self {
        Self {
            id,
            handle,
            lines: LineReader::new(reader),
            writer,
            negotiator,
            ctx,
            state,
        }
    }

    /// Read frames and write queued frames until either side stops.
    async fn run(&mut self, mut outbound: mpsc::Receiver<Frame>) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                line = self.lines.next_line() => {
                    match line.map_err(SessionError::Io)? {
                        Some(RawLine::Text(line)) => self.on_line(&line).await?,
                        Some(RawLine::Overlong(len)) => {
                            warn!(peer = %self.handle, len, "Dropping overlong line");
                        }
                        None => return Err(SessionError::Eof),
                    }
                }
                frame = outbound.recv() => {
                    match frame {
                        Some(frame) => self.write(&frame).await?,
                        // Registry dropped the session
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn on_line(&mut self, line: &str) -> Result<(), SessionError> {
        if line.trim().is_empty() {
            return Ok(());
        }
        match Frame::parse(line) {
            Ok(frame) => self.on_frame(frame).await,
            Err(e) => {
                warn!(peer = %self.handle, error = %e, "Dropping malformed frame");
                Ok(())
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        if frame.is_handshake() {
            let replies = self.negotiator.handle(&frame)?;
            for reply in &replies {
                self.write(reply).await?;
            }
            let state = match self.negotiator.phase() {
                Phase::AwaitingHandshake => LinkState::AwaitingHandshake,
                Phase::AwaitingAuth => LinkState::AwaitingAuth,
                Phase::Authenticated => LinkState::Authenticated,
                Phase::Failed => LinkState::Closed,
            };
            return self.report(state).await;
        }

        if self.state != LinkState::Authenticated {
            warn!(
                peer = %self.handle,
                kind = frame.kind(),
                "Dropping frame from unauthenticated link"
            );
            return Ok(());
        }

        self.ctx
            .events
            .send(NodeEvent::Frame { id: self.id, frame })
            .await
            .map_err(|_| SessionError::LoopGone)
    }

    /// Tell the event loop about a state change.
    async fn report(&mut self, state: LinkState) -> Result<(), SessionError> {
        if state == self.state {
            return Ok(());
        }
        debug!(peer = %self.handle, from = ?self.state, to = ?state, "Link state");
        self.state = state;
        self.ctx
            .events
            .send(NodeEvent::StateChanged { id: self.id, state })
            .await
            .map_err(|_| SessionError::LoopGone)
    }

    async fn write(&mut self, frame: &Frame) -> Result<(), SessionError> {
        debug!(peer = %self.handle, kind = frame.kind(), "Sending frame");
        self.writer
            .write_all(frame.encode().as_bytes())
            .await
            .map_err(SessionError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(data: &[u8], capacity: usize) -> Vec<RawLine> {
        let mut lines = LineReader::new(BufReader::with_capacity(capacity, data));
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await.expect("read") {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_decoded_lossily() {
        let lines = read_all(b"CHAT rawbot bob \xff\xfe\nCHAT rawbot bob ok\r\n", 8).await;
        assert_eq!(
            lines,
            vec![
                RawLine::Text("CHAT rawbot bob \u{fffd}\u{fffd}".into()),
                RawLine::Text("CHAT rawbot bob ok".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_overlong_line_is_skipped_not_buffered() {
        let mut data = vec![b'x'; MAX_LINE_LEN + 5];
        data.extend_from_slice(b"\nnext\n");
        let lines = read_all(&data, 1024).await;
        assert_eq!(
            lines,
            vec![RawLine::Overlong(MAX_LINE_LEN + 5), RawLine::Text("next".into())]
        );
    }

    #[tokio::test]
    async fn test_line_at_the_limit_is_kept() {
        let mut data = vec![b'y'; MAX_LINE_LEN];
        data.push(b'\n');
        let lines = read_all(&data, 4096).await;
        assert_eq!(lines, vec![RawLine::Text("y".repeat(MAX_LINE_LEN))]);
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_returned() {
        let lines = read_all(b"LINKREADY hub1 WBS 0.3.0", 8).await;
        assert_eq!(lines, vec![RawLine::Text("LINKREADY hub1 WBS 0.3.0".into())]);
    }
}
