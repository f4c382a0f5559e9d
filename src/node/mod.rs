//! A running bot on the botnet.
//!
//! [`Node`] binds the link port (and optionally a control socket), then runs
//! a single event loop that owns the [`LinkRegistry`] and the [`Router`].
//! Session tasks, accept tasks, the bridge poller and the control socket all
//! talk to it through one channel of [`NodeEvent`]s; nothing else touches the
//! session map.

// Event handlers are matched exhaustively in one place
#![allow(clippy::too_many_lines)]

pub mod bridge;
pub mod commands;
mod control;
pub mod registry;
pub mod router;
pub mod session;

pub use bridge::{BridgeError, BridgeHandle};
pub use commands::{CommandError, DotCommand};
pub use registry::{LinkError, LinkRegistry};
pub use router::{Delivery, RouteError, RoutedCommand, Router, ShareScope};
pub use session::{PeerSession, SendError, SessionError};

use crate::directory::{BotDirectory, DirectoryError, ShareLevel};
use crate::frame::{Frame, Target};
use crate::hooks::{ClientAcceptor, CommandExecutor, LogExecutor, LogPartyline, PartylineHub, RejectClients};
use crate::protocol::{BridgeItem, LinkState, PeerInfo};
use registry::Greeting;
use session::{InboundLink, SessionContext};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Identifies one session for its whole life, even if its handle is reused.
pub type SessionId = u64;

const EVENT_QUEUE: usize = 1024;

/// Everything the event loop reacts to.
pub(crate) enum NodeEvent {
    /// Item drained from the command bridge.
    Bridge(BridgeItem),
    /// Accepted connection that greeted with `BOTLINK`.
    Inbound(InboundLink),
    /// A session task moved to a new state.
    StateChanged { id: SessionId, state: LinkState },
    /// Post-handshake frame from an authenticated session.
    Frame { id: SessionId, frame: Frame },
    /// A session task finished. `reason` is `None` for a local close.
    Closed {
        id: SessionId,
        reason: Option<String>,
    },
    /// Snapshot request for the peer list.
    Peers(oneshot::Sender<Vec<PeerInfo>>),
    Shutdown,
}

/// Errors that can occur running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind: {0}")]
    Bind(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("failed to serialize response: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("node is not running")]
    Stopped,
}

/// Static settings for a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Our own handle.
    pub handle: String,
    /// TCP address for bot links.
    pub listen: SocketAddr,
    /// Unix control socket, if any.
    pub control_socket: Option<PathBuf>,
    pub bridge_capacity: usize,
    /// Minimum gap between bridge items reaching the event loop.
    pub bridge_spacing: Duration,
}

impl NodeConfig {
    pub fn new(handle: impl Into<String>, listen: SocketAddr) -> Self {
        Self {
            handle: handle.into(),
            listen,
            control_socket: None,
            bridge_capacity: bridge::DEFAULT_CAPACITY,
            bridge_spacing: bridge::DEFAULT_SPACING,
        }
    }

    #[must_use]
    pub fn with_control_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_socket = Some(path.into());
        self
    }

    #[must_use]
    pub const fn with_bridge_spacing(mut self, spacing: Duration) -> Self {
        self.bridge_spacing = spacing;
        self
    }

    #[must_use]
    pub const fn with_bridge_capacity(mut self, capacity: usize) -> Self {
        self.bridge_capacity = capacity;
        self
    }
}

/// The collaborators a node calls out to.
#[derive(Clone)]
pub struct Hooks {
    pub partyline: Arc<dyn PartylineHub>,
    pub executor: Arc<dyn CommandExecutor>,
    pub clients: Arc<dyn ClientAcceptor>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            partyline: Arc::new(LogPartyline),
            executor: Arc::new(LogExecutor),
            clients: Arc::new(RejectClients),
        }
    }
}

impl Hooks {
    #[must_use]
    pub fn with_partyline(mut self, partyline: Arc<dyn PartylineHub>) -> Self {
        self.partyline = partyline;
        self
    }

    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    #[must_use]
    pub fn with_clients(mut self, clients: Arc<dyn ClientAcceptor>) -> Self {
        self.clients = clients;
        self
    }
}

/// Cloneable handle for submitting work to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    bridge: BridgeHandle,
    events: mpsc::Sender<NodeEvent>,
}

impl NodeHandle {
    /// Queue a bridge item without waiting.
    pub fn submit(&self, item: BridgeItem) -> Result<(), BridgeError> {
        self.bridge.submit(item)
    }

    pub fn link(&self, handle: impl Into<String>) -> Result<(), BridgeError> {
        self.submit(BridgeItem::Link {
            handle: handle.into(),
        })
    }

    pub fn unlink(&self, handle: impl Into<String>) -> Result<(), BridgeError> {
        self.submit(BridgeItem::Unlink {
            handle: handle.into(),
        })
    }

    /// Relay a partyline chat line to every authenticated link.
    pub fn chat(&self, user: impl Into<String>, text: impl Into<String>) -> Result<(), BridgeError> {
        self.submit(BridgeItem::Chat {
            user: user.into(),
            text: text.into(),
            channel: 0,
        })
    }

    /// Run a dot-command line on behalf of a partyline user.
    pub fn command(&self, user: impl Into<String>, line: impl Into<String>) -> Result<(), BridgeError> {
        self.submit(BridgeItem::Cmd {
            cmd: line.into(),
            user: user.into(),
        })
    }

    /// Snapshot of the current links.
    pub async fn peers(&self) -> Result<Vec<PeerInfo>, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(NodeEvent::Peers(tx))
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Close every link and stop the node. Does nothing if already stopped.
    pub async fn shutdown(&self) {
        let _ = self.events.send(NodeEvent::Shutdown).await;
    }
}

/// A bound, not yet running, node.
pub struct Node {
    me: String,
    directory: Arc<dyn BotDirectory>,
    hooks: Hooks,
    listener: TcpListener,
    control: Option<(UnixListener, PathBuf)>,
    events_tx: mpsc::Sender<NodeEvent>,
    events_rx: mpsc::Receiver<NodeEvent>,
    bridge: BridgeHandle,
    inbox: bridge::BridgeInbox,
    shutdown_tx: broadcast::Sender<()>,
}

impl Node {
    /// Bind the link port and control socket.
    pub async fn bind(
        config: NodeConfig,
        directory: Arc<dyn BotDirectory>,
        hooks: Hooks,
    ) -> Result<Self, NodeError> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(NodeError::Bind)?;
        let control = match config.control_socket {
            Some(path) => Some((control::bind(&path)?, path)),
            None => None,
        };
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (bridge, inbox) = bridge::channel(config.bridge_capacity, config.bridge_spacing);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            me: config.handle,
            directory,
            hooks,
            listener,
            control,
            events_tx,
            events_rx,
            bridge,
            inbox,
            shutdown_tx,
        })
    }

    /// Address the link port is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, NodeError> {
        self.listener.local_addr().map_err(NodeError::Io)
    }

    #[must_use]
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            bridge: self.bridge.clone(),
            events: self.events_tx.clone(),
        }
    }

    /// Run until shutdown is requested.
    pub async fn run(self) -> Result<(), NodeError> {
        let handle = self.handle();
        let Self {
            me,
            directory,
            hooks,
            listener,
            control,
            events_tx,
            mut events_rx,
            bridge: _,
            inbox,
            shutdown_tx,
        } = self;

        let subnet_id = match directory.get(&me) {
            Ok(record) => record.subnet_id,
            Err(DirectoryError::NotFound(_)) => {
                debug!(handle = %me, "No directory record for this bot, no subnet");
                None
            }
            Err(e) => return Err(e.into()),
        };

        tokio::spawn(inbox.run(events_tx.clone()));
        if let Some((listener, path)) = control {
            tokio::spawn(control::serve(listener, path, handle, shutdown_tx.subscribe()));
        }

        let ctx = SessionContext {
            me: me.clone(),
            directory: Arc::clone(&directory),
            events: events_tx.clone(),
        };
        let router = Router::new(
            me.clone(),
            subnet_id,
            Arc::clone(&directory),
            Arc::clone(&hooks.executor),
            Arc::clone(&hooks.partyline),
        );
        let mut state = EventLoop {
            registry: LinkRegistry::new(ctx),
            router,
            directory,
            hooks: hooks.clone(),
        };

        info!(
            handle = %me,
            addr = %listener.local_addr().map_err(NodeError::Io)?,
            subnet = ?subnet_id,
            "Node listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(%addr, "Accepted connection");
                            tokio::spawn(greet(
                                stream,
                                addr,
                                events_tx.clone(),
                                Arc::clone(&hooks.clients),
                            ));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                event = events_rx.recv() => {
                    match event {
                        Some(NodeEvent::Shutdown) | None => break,
                        Some(event) => state.handle(event),
                    }
                }
            }
        }

        info!(handle = %me, links = state.registry.len(), "Shutting down");
        state.registry.close_all();
        let _ = shutdown_tx.send(());
        Ok(())
    }
}

/// Decide what an accepted connection is and route it.
async fn greet(
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::Sender<NodeEvent>,
    clients: Arc<dyn ClientAcceptor>,
) {
    match registry::read_greeting(stream, addr).await {
        Ok(Greeting::Bot(link)) => {
            if events.send(NodeEvent::Inbound(link)).await.is_err() {
                debug!(%addr, "Node stopped before inbound link was attached");
            }
        }
        Ok(Greeting::Client(conn)) => clients.accept(conn),
        Err(e) => warn!(%addr, error = %e, "Dropped inbound connection"),
    }
}

/// State owned by the event loop.
struct EventLoop {
    registry: LinkRegistry,
    router: Router,
    directory: Arc<dyn BotDirectory>,
    hooks: Hooks,
}

impl EventLoop {
    fn handle(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Bridge(item) => self.on_bridge(item),
            NodeEvent::Inbound(link) => {
                let claimed = link.claimed_handle().to_string();
                if let Err(e) = self.registry.accept_inbound(link) {
                    warn!(peer = %claimed, error = %e, "Rejected inbound link");
                }
            }
            NodeEvent::StateChanged { id, state } => self.on_state(id, state),
            NodeEvent::Frame { id, frame } => self.on_frame(id, frame),
            NodeEvent::Closed { id, reason } => self.on_closed(id, reason),
            NodeEvent::Peers(reply) => {
                let peers = self.registry.all().map(PeerSession::info).collect();
                let _ = reply.send(peers);
            }
            // Handled by the run loop
            NodeEvent::Shutdown => {}
        }
    }

    fn on_state(&mut self, id: SessionId, state: LinkState) {
        let Some(handle) = self.registry.by_id(id).map(|s| s.handle().to_string()) else {
            debug!(id, ?state, "State report from a replaced session");
            return;
        };

        let record = if state == LinkState::Authenticated {
            self.directory.get(&handle).ok()
        } else {
            None
        };
        let subnet_id = record.as_ref().and_then(|r| r.subnet_id);
        let Some(session) = self.registry.set_state(id, state, subnet_id) else {
            return;
        };
        if state != LinkState::Authenticated {
            return;
        }

        info!(peer = %handle, subnet = ?subnet_id, "Link authenticated");
        self.hooks
            .partyline
            .broadcast(&format!("*** {handle} linked"), false);

        if record.is_some_and(|r| r.share_level == ShareLevel::Aggressive) {
            if let Err(e) = self.router.share_state(session, ShareScope::All) {
                warn!(peer = %handle, error = %e, "Failed to share state");
            }
        }
    }

    fn on_frame(&self, id: SessionId, frame: Frame) {
        let Some(session) = self.registry.by_id(id) else {
            debug!(id, kind = frame.kind(), "Frame from a replaced session");
            return;
        };
        if !session.is_authenticated() {
            warn!(
                peer = %session.handle(),
                kind = frame.kind(),
                "Dropping frame from unauthenticated link"
            );
            return;
        }
        let from = session.handle().to_string();
        self.router.handle_inbound(&self.registry, &from, frame);
    }

    fn on_closed(&mut self, id: SessionId, reason: Option<String>) {
        let Some(previous) = self.registry.by_id(id).map(PeerSession::state) else {
            return;
        };
        let Some(session) = self.registry.remove_closed(id) else {
            return;
        };
        let reason = reason.unwrap_or_else(|| "closed".to_string());

        if previous == LinkState::Connecting {
            warn!(peer = %session.handle(), %reason, "Link failed");
            return;
        }
        info!(peer = %session.handle(), %reason, "Link closed");
        self.hooks
            .partyline
            .broadcast(&format!("*** {} unlinked", session.handle()), false);
    }

    fn on_bridge(&mut self, item: BridgeItem) {
        match item {
            BridgeItem::Link { handle } => self.link(&handle, None),
            BridgeItem::Unlink { handle } => self.unlink(&handle, None),
            BridgeItem::Chat {
                user,
                text,
                channel,
            } => {
                if channel != 0 {
                    debug!(channel, "Partyline channel is not carried across links");
                }
                match self.router.broadcast_chat(
                    &self.registry,
                    self.router.me(),
                    &user,
                    &text,
                    None,
                ) {
                    Ok(sent) => debug!(%user, sent, "Relayed chat"),
                    Err(e) => {
                        warn!(%user, error = %e, "Refused chat line");
                        self.reply(Some(&user), &format!("Chat not sent: {e}"));
                    }
                }
            }
            BridgeItem::Cmd { cmd, user } => self.run_command(&user, &cmd),
        }
    }

    fn reply(&self, user: Option<&str>, text: &str) {
        if let Some(user) = user {
            self.hooks.partyline.send_to(user, text);
        }
    }

    fn link(&mut self, handle: &str, user: Option<&str>) {
        match self.registry.connect_peer(handle) {
            Ok(true) => self.reply(user, &format!("Linking to {handle}...")),
            Ok(false) => self.reply(user, &format!("Already linked to {handle}")),
            Err(e) => {
                warn!(peer = %handle, error = %e, "Cannot link");
                self.reply(user, &format!("Cannot link to {handle}: {e}"));
            }
        }
    }

    fn unlink(&mut self, handle: &str, user: Option<&str>) {
        match self.registry.unlink(handle) {
            Some(session) => {
                if session.state() != LinkState::Connecting {
                    self.hooks
                        .partyline
                        .broadcast(&format!("*** {handle} unlinked"), false);
                }
                self.reply(user, &format!("Unlinked from {handle}"));
            }
            None => self.reply(user, &format!("Not linked to {handle}")),
        }
    }

    fn run_command(&mut self, user: &str, line: &str) {
        let command = match commands::parse(line) {
            Ok(command) => command,
            Err(e) => {
                self.reply(Some(user), &e.to_string());
                return;
            }
        };
        debug!(%user, ?command, "Partyline command");

        match command {
            DotCommand::Relay { target, cmd, args } => {
                let routed = RoutedCommand::new(cmd, args, target, user);
                match self.router.route_command(&self.registry, &routed) {
                    Ok(Delivery::Local) => {}
                    Ok(Delivery::Peers(n)) => {
                        self.reply(Some(user), &format!("Relayed {} to {n} bot(s)", routed.cmd));
                    }
                    Err(e) => self.reply(Some(user), &e.to_string()),
                }
            }
            DotCommand::Link(handle) => self.link(&handle, Some(user)),
            DotCommand::Unlink(handle) => self.unlink(&handle, Some(user)),
            DotCommand::Share { handle, scope } => {
                let result = match self.registry.get(&handle).filter(|s| s.is_authenticated()) {
                    Some(session) => self.router.share_state(session, scope),
                    None => Err(RouteError::NotLinked(handle.clone())),
                };
                match result {
                    Ok(()) => self.reply(Some(user), &format!("Shared state with {handle}")),
                    Err(e) => self.reply(Some(user), &e.to_string()),
                }
            }
            DotCommand::Bots => self.reply(Some(user), &self.bots_listing()),
            DotCommand::Subnet => self.reply(Some(user), &self.subnet_listing()),
            DotCommand::BotInfo(handle) => {
                let text = self.bot_info(handle.as_deref());
                self.reply(Some(user), &text);
            }
            DotCommand::Local { cmd, args } => {
                let routed = RoutedCommand::new(cmd, args, Target::Me, user);
                if let Err(e) = self.router.route_command(&self.registry, &routed) {
                    self.reply(Some(user), &e.to_string());
                }
            }
        }
    }

    fn bots_listing(&self) -> String {
        if self.registry.is_empty() {
            return "No bots linked".to_string();
        }
        let mut out = format!("Linked bots ({}):", self.registry.len());
        for s in self.registry.all() {
            let info = s.info();
            let subnet = info
                .subnet_id
                .map_or_else(|| "-".to_string(), |id| id.to_string());
            let _ = write!(
                out,
                "\n  {:<12} {:<18} {:<8} subnet:{:<4} {}:{}",
                info.handle,
                info.state.as_str(),
                info.direction.as_str(),
                subnet,
                info.host,
                info.port
            );
        }
        out
    }

    fn subnet_listing(&self) -> String {
        let Some(subnet) = self.router.subnet_id() else {
            return "This bot is not in a subnet".to_string();
        };
        let members: Vec<_> = self.registry.in_subnet(subnet).map(PeerSession::handle).collect();
        if members.is_empty() {
            format!("No linked bots in subnet {subnet}")
        } else {
            format!("Subnet {subnet}: {}", members.join(", "))
        }
    }

    fn bot_info(&self, handle: Option<&str>) -> String {
        let Some(handle) = handle.filter(|h| *h != self.router.me()) else {
            let subnet = self
                .router
                .subnet_id()
                .map_or_else(|| "none".to_string(), |id| id.to_string());
            return format!(
                "{}: subnet {subnet}, {} link(s), {} authenticated",
                self.router.me(),
                self.registry.len(),
                self.registry.authenticated().count()
            );
        };

        let link = self
            .registry
            .get(handle)
            .map_or("not linked", |s| s.state().as_str());
        match self.directory.get(handle) {
            Ok(record) => format!(
                "{handle}: role {}, subnet {}, share {}, link {link}",
                format!("{:?}", record.role).to_lowercase(),
                record
                    .subnet_id
                    .map_or_else(|| "none".to_string(), |id| id.to_string()),
                format!("{:?}", record.share_level).to_lowercase(),
            ),
            Err(e) => format!("{handle}: {e}"),
        }
    }
}
