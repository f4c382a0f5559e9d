//! Scope resolution for relayed commands and chat.
//!
//! The router never owns sessions. Every call borrows the registry from the
//! event loop and writes to the sessions it selects through their outbound
//! queues, so a slow or dead peer only loses its own frames.

use super::registry::LinkRegistry;
use super::session::PeerSession;
use crate::directory::{BotDirectory, DirectoryError};
use crate::frame::{Frame, FrameError, RelayCommand, Target};
use crate::hooks::{CommandExecutor, PartylineHub};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("bot not linked: {0}")]
    NotLinked(String),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A command on its way to wherever its target says it should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedCommand {
    pub cmd: String,
    pub args: String,
    pub target: Target,
    /// Partyline user or bot handle that issued it.
    pub from: String,
    /// Bot that first relayed it, when it came in over a link.
    pub origin: Option<String>,
}

impl RoutedCommand {
    pub fn new(
        cmd: impl Into<String>,
        args: impl Into<String>,
        target: Target,
        from: impl Into<String>,
    ) -> Self {
        Self {
            cmd: cmd.into(),
            args: args.into(),
            target,
            from: from.into(),
            origin: None,
        }
    }

    /// A command received in a `CMD:` frame from `from`.
    #[must_use]
    pub fn from_frame(payload: RelayCommand, from: &str) -> Self {
        Self {
            cmd: payload.cmd,
            args: payload.args,
            target: payload.target,
            from: from.to_string(),
            origin: payload.origin,
        }
    }

    /// Wire form. Commands that start here, or came from a peer that did not
    /// name an origin, are stamped with `me`.
    fn to_frame(&self, me: &str) -> Frame {
        Frame::Cmd(RelayCommand {
            cmd: self.cmd.clone(),
            args: self.args.clone(),
            target: self.target.clone(),
            origin: Some(self.origin.clone().unwrap_or_else(|| me.to_string())),
        })
    }
}

/// Where a routed command ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the local executor.
    Local,
    /// Queued for this many peers.
    Peers(usize),
}

/// Which tables `share_state` pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShareScope {
    Users,
    Channels,
    #[default]
    All,
}

pub struct Router {
    me: String,
    subnet_id: Option<u32>,
    directory: Arc<dyn BotDirectory>,
    executor: Arc<dyn CommandExecutor>,
    partyline: Arc<dyn PartylineHub>,
}

impl Router {
    pub fn new(
        me: impl Into<String>,
        subnet_id: Option<u32>,
        directory: Arc<dyn BotDirectory>,
        executor: Arc<dyn CommandExecutor>,
        partyline: Arc<dyn PartylineHub>,
    ) -> Self {
        Self {
            me: me.into(),
            subnet_id,
            directory,
            executor,
            partyline,
        }
    }

    #[must_use]
    pub fn me(&self) -> &str {
        &self.me
    }

    #[must_use]
    pub const fn subnet_id(&self) -> Option<u32> {
        self.subnet_id
    }

    fn is_local(&self, target: &Target) -> bool {
        match target {
            Target::Me => true,
            Target::Bot(handle) => *handle == self.me,
            Target::Subnet | Target::Botnet => false,
        }
    }

    /// Run a command here or send it to the peers its target selects.
    pub fn route_command(
        &self,
        registry: &LinkRegistry,
        cmd: &RoutedCommand,
    ) -> Result<Delivery, RouteError> {
        if self.is_local(&cmd.target) {
            self.executor.execute(&cmd.cmd, &cmd.args, &cmd.from);
            return Ok(Delivery::Local);
        }
        self.forward(registry, cmd, None)
    }

    fn forward(
        &self,
        registry: &LinkRegistry,
        cmd: &RoutedCommand,
        exclude: Option<&str>,
    ) -> Result<Delivery, RouteError> {
        let frame = cmd.to_frame(&self.me);
        let sent = match &cmd.target {
            Target::Me => 0,
            Target::Subnet => {
                let Some(subnet) = self.subnet_id else {
                    warn!(cmd = %cmd.cmd, "Subnet command but this bot has no subnet");
                    return Ok(Delivery::Peers(0));
                };
                deliver(registry.in_subnet(subnet), &frame, exclude)
            }
            Target::Botnet => deliver(registry.authenticated(), &frame, exclude),
            Target::Bot(handle) => {
                let session = registry
                    .get(handle)
                    .filter(|s| s.is_authenticated())
                    .ok_or_else(|| RouteError::NotLinked(handle.clone()))?;
                deliver(std::iter::once(session), &frame, exclude)
            }
        };
        debug!(cmd = %cmd.cmd, target = %cmd.target, sent, "Routed command");
        Ok(Delivery::Peers(sent))
    }

    /// Send a chat line to every authenticated link except `exclude`.
    pub fn broadcast_chat(
        &self,
        registry: &LinkRegistry,
        from: &str,
        nick: &str,
        text: &str,
        exclude: Option<&str>,
    ) -> Result<usize, RouteError> {
        let frame = Frame::chat(from, nick, text)?;
        Ok(deliver(registry.authenticated(), &frame, exclude))
    }

    /// Push users and/or channels to one peer.
    pub fn share_state(&self, session: &PeerSession, scope: ShareScope) -> Result<(), RouteError> {
        if matches!(scope, ShareScope::Users | ShareScope::All) {
            let users = self.directory.users()?;
            info!(peer = %session.handle(), count = users.len(), "Sharing users");
            send_logged(session, Frame::ShareUsers(users));
        }
        if matches!(scope, ShareScope::Channels | ShareScope::All) {
            let channels = self.directory.channels()?;
            info!(peer = %session.handle(), count = channels.len(), "Sharing channels");
            send_logged(session, Frame::ShareChans(channels));
        }
        Ok(())
    }

    /// Dispatch a post-handshake frame received from `from`.
    pub fn handle_inbound(&self, registry: &LinkRegistry, from: &str, frame: Frame) {
        match frame {
            Frame::Chat { from: origin, nick, text } => {
                if origin == self.me {
                    warn!(peer = %from, %nick, "Dropping chat that looped back to its origin");
                    return;
                }
                self.partyline
                    .broadcast(&format!("<{nick}@{origin}> {text}"), true);
                if let Err(e) = self.broadcast_chat(registry, &origin, &nick, &text, Some(from)) {
                    warn!(peer = %from, error = %e, "Failed to relay chat");
                }
            }
            Frame::Cmd(payload) => {
                if payload.origin.as_deref() == Some(self.me.as_str()) {
                    warn!(peer = %from, cmd = %payload.cmd, "Dropping command that looped back to its origin");
                    return;
                }
                let cmd = RoutedCommand::from_frame(payload, from);
                self.handle_inbound_command(registry, &cmd);
            }
            Frame::ShareUsers(users) => {
                let count = users.len();
                for user in users {
                    if let Err(e) = self.directory.upsert_user(user) {
                        warn!(peer = %from, error = %e, "Failed to store shared user");
                    }
                }
                info!(peer = %from, count, "Merged shared users");
            }
            Frame::ShareChans(channels) => {
                let count = channels.len();
                for channel in channels {
                    if let Err(e) = self.directory.upsert_channel(channel) {
                        warn!(peer = %from, error = %e, "Failed to store shared channel");
                    }
                }
                info!(peer = %from, count, "Merged shared channels");
            }
            other => {
                debug!(peer = %from, kind = other.kind(), "Ignoring handshake frame after auth");
            }
        }
    }

    fn handle_inbound_command(&self, registry: &LinkRegistry, cmd: &RoutedCommand) {
        match &cmd.target {
            target if self.is_local(target) => {
                self.executor.execute(&cmd.cmd, &cmd.args, &cmd.from);
            }
            Target::Subnet | Target::Botnet => {
                self.executor.execute(&cmd.cmd, &cmd.args, &cmd.from);
                if let Err(e) = self.forward(registry, cmd, Some(&cmd.from)) {
                    warn!(peer = %cmd.from, error = %e, "Failed to relay command");
                }
            }
            Target::Bot(handle) => {
                if let Err(e) = self.forward(registry, cmd, Some(&cmd.from)) {
                    info!(peer = %cmd.from, %handle, error = %e, "Dropping command for unreachable bot");
                }
            }
            Target::Me => {}
        }
    }
}

/// Queue `frame` on each session except `exclude`; returns how many took it.
fn deliver<'a>(
    sessions: impl Iterator<Item = &'a PeerSession>,
    frame: &Frame,
    exclude: Option<&str>,
) -> usize {
    sessions
        .filter(|s| Some(s.handle()) != exclude)
        .filter(|s| send_logged(s, frame.clone()))
        .count()
}

fn send_logged(session: &PeerSession, frame: Frame) -> bool {
    let kind = frame.kind();
    match session.send(frame) {
        Ok(()) => true,
        Err(e) => {
            warn!(peer = %session.handle(), kind, error = %e, "Dropped outbound frame");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, UserRecord};
    use crate::node::session::SessionContext;
    use crate::protocol::LinkState;
    use crate::testing::{RecordingExecutor, RecordingHub};
    use tokio::sync::mpsc;

    struct Fixture {
        router: Router,
        registry: LinkRegistry,
        executor: Arc<RecordingExecutor>,
        hub: Arc<RecordingHub>,
        directory: Arc<MemoryDirectory>,
        outboxes: Vec<(String, mpsc::Receiver<Frame>)>,
        _events: mpsc::Receiver<crate::node::NodeEvent>,
    }

    impl Fixture {
        fn new(subnet_id: Option<u32>, peers: &[(&str, Option<u32>, LinkState)]) -> Self {
            let directory = Arc::new(MemoryDirectory::new());
            let executor = Arc::new(RecordingExecutor::default());
            let hub = Arc::new(RecordingHub::default());
            let (tx, rx) = mpsc::channel(16);
            let mut registry = LinkRegistry::new(SessionContext {
                me: "hub1".into(),
                directory: directory.clone(),
                events: tx,
            });
            let mut outboxes = Vec::new();
            for (i, (handle, subnet, state)) in peers.iter().enumerate() {
                let (session, out) = PeerSession::detached(i as u64 + 1, handle, *subnet, *state);
                registry.attach(session);
                outboxes.push(((*handle).to_string(), out));
            }
            let router = Router::new(
                "hub1",
                subnet_id,
                directory.clone(),
                executor.clone(),
                hub.clone(),
            );
            Self {
                router,
                registry,
                executor,
                hub,
                directory,
                outboxes,
                _events: rx,
            }
        }

        /// Frames queued for each peer, drained.
        fn sent(&mut self) -> Vec<(String, Frame)> {
            let mut out = Vec::new();
            for (handle, rx) in &mut self.outboxes {
                while let Ok(frame) = rx.try_recv() {
                    out.push((handle.clone(), frame));
                }
            }
            out
        }
    }

    fn cmd(target: Target) -> RoutedCommand {
        RoutedCommand::new("say", "hi", target, "alice")
    }

    #[test]
    fn test_target_me_never_touches_peers() {
        let mut f = Fixture::new(
            Some(1),
            &[("leaf1", Some(1), LinkState::Authenticated)],
        );

        let delivery = f.router.route_command(&f.registry, &cmd(Target::Me)).expect("route");
        assert_eq!(delivery, Delivery::Local);
        let own = f
            .router
            .route_command(&f.registry, &cmd(Target::Bot("hub1".into())))
            .expect("route");
        assert_eq!(own, Delivery::Local);

        assert!(f.sent().is_empty());
        assert_eq!(f.executor.calls().len(), 2);
        assert_eq!(f.executor.calls()[0], ("say".into(), "hi".into(), "alice".into()));
    }

    #[test]
    fn test_subnet_scope_only_reaches_matching_subnet() {
        let mut f = Fixture::new(
            Some(1),
            &[
                ("a", Some(1), LinkState::Authenticated),
                ("b", Some(2), LinkState::Authenticated),
                ("c", None, LinkState::Authenticated),
                ("d", Some(1), LinkState::AwaitingAuth),
            ],
        );

        let delivery = f
            .router
            .route_command(&f.registry, &cmd(Target::Subnet))
            .expect("route");
        assert_eq!(delivery, Delivery::Peers(1));
        let sent = f.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "a");
        assert!(f.executor.calls().is_empty());
    }

    #[test]
    fn test_subnet_scope_without_own_subnet_reaches_nobody() {
        let mut f = Fixture::new(None, &[("a", None, LinkState::Authenticated)]);
        let delivery = f
            .router
            .route_command(&f.registry, &cmd(Target::Subnet))
            .expect("route");
        assert_eq!(delivery, Delivery::Peers(0));
        assert!(f.sent().is_empty());
    }

    #[test]
    fn test_relay_botnet_skips_unauthenticated_peer() {
        let mut f = Fixture::new(
            None,
            &[
                ("leaf1", None, LinkState::Authenticated),
                ("leaf2", Some(3), LinkState::Authenticated),
                ("leaf3", None, LinkState::AwaitingAuth),
            ],
        );

        let delivery = f
            .router
            .route_command(&f.registry, &cmd(Target::Botnet))
            .expect("route");
        assert_eq!(delivery, Delivery::Peers(2));

        let sent = f.sent();
        let handles: Vec<_> = sent.iter().map(|(h, _)| h.as_str()).collect();
        assert_eq!(handles, ["leaf1", "leaf2"]);
        for (_, frame) in &sent {
            assert!(matches!(
                frame,
                Frame::Cmd(RelayCommand { cmd, target: Target::Botnet, .. }) if cmd == "say"
            ));
        }
    }

    #[test]
    fn test_named_target_requires_authenticated_link() {
        let mut f = Fixture::new(
            None,
            &[
                ("leaf1", None, LinkState::Authenticated),
                ("leaf2", None, LinkState::AwaitingHandshake),
            ],
        );

        let ok = f
            .router
            .route_command(&f.registry, &cmd(Target::Bot("leaf1".into())))
            .expect("route");
        assert_eq!(ok, Delivery::Peers(1));

        for missing in ["leaf2", "ghost"] {
            let err = f
                .router
                .route_command(&f.registry, &cmd(Target::Bot(missing.into())))
                .expect_err("not linked");
            assert!(matches!(err, RouteError::NotLinked(h) if h == missing));
        }
        assert_eq!(f.sent().len(), 1);
    }

    #[test]
    fn test_broadcast_chat_honours_exclude() {
        let mut f = Fixture::new(
            None,
            &[
                ("a", None, LinkState::Authenticated),
                ("b", None, LinkState::Authenticated),
                ("c", None, LinkState::Authenticated),
            ],
        );

        let n = f
            .router
            .broadcast_chat(&f.registry, "hub1", "alice", "hello there", Some("b"))
            .expect("chat");
        assert_eq!(n, 2);
        let sent = f.sent();
        assert!(sent.iter().all(|(h, _)| h != "b"));
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn test_inbound_chat_is_shown_and_relayed_onward() {
        let mut f = Fixture::new(
            None,
            &[
                ("leaf1", None, LinkState::Authenticated),
                ("leaf2", None, LinkState::Authenticated),
            ],
        );

        f.router.handle_inbound(
            &f.registry,
            "leaf1",
            Frame::Chat {
                from: "leaf1".into(),
                nick: "bob".into(),
                text: "hello".into(),
            },
        );

        assert_eq!(f.hub.lines(), vec![("<bob@leaf1> hello".to_string(), true)]);
        let sent = f.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "leaf2");
    }

    #[test]
    fn test_inbound_botnet_command_runs_here_and_floods_onward() {
        let mut f = Fixture::new(
            None,
            &[
                ("leaf1", None, LinkState::Authenticated),
                ("leaf2", None, LinkState::Authenticated),
            ],
        );

        f.router.handle_inbound(
            &f.registry,
            "leaf1",
            Frame::Cmd(RelayCommand {
                cmd: "say".into(),
                args: "hi".into(),
                target: Target::Botnet,
                origin: None,
            }),
        );

        assert_eq!(f.executor.calls(), vec![("say".into(), "hi".into(), "leaf1".into())]);
        let sent = f.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "leaf2");
        // Unstamped commands pick up the relaying bot as origin
        assert!(matches!(
            &sent[0].1,
            Frame::Cmd(RelayCommand { origin: Some(o), .. }) if o == "hub1"
        ));
    }

    #[test]
    fn test_chat_from_ourselves_is_not_shown_or_relayed() {
        let mut f = Fixture::new(
            None,
            &[
                ("leaf1", None, LinkState::Authenticated),
                ("leaf2", None, LinkState::Authenticated),
            ],
        );

        f.router.handle_inbound(
            &f.registry,
            "leaf1",
            Frame::Chat {
                from: "hub1".into(),
                nick: "bob".into(),
                text: "looped".into(),
            },
        );

        assert!(f.hub.lines().is_empty());
        assert!(f.sent().is_empty());
    }

    #[test]
    fn test_command_from_ourselves_is_not_run_or_relayed() {
        let mut f = Fixture::new(
            None,
            &[
                ("leaf1", None, LinkState::Authenticated),
                ("leaf2", None, LinkState::Authenticated),
            ],
        );

        f.router.handle_inbound(
            &f.registry,
            "leaf1",
            Frame::Cmd(RelayCommand {
                cmd: "say".into(),
                args: "hi".into(),
                target: Target::Botnet,
                origin: Some("hub1".into()),
            }),
        );

        assert!(f.executor.calls().is_empty());
        assert!(f.sent().is_empty());
    }

    #[test]
    fn test_local_relay_is_stamped_with_origin() {
        let mut f = Fixture::new(None, &[("leaf1", None, LinkState::Authenticated)]);

        f.router
            .route_command(&f.registry, &cmd(Target::Botnet))
            .expect("route");

        let sent = f.sent();
        assert!(matches!(
            &sent[0].1,
            Frame::Cmd(RelayCommand { origin: Some(o), .. }) if o == "hub1"
        ));
    }

    #[test]
    fn test_chat_that_would_break_the_line_is_refused() {
        let mut f = Fixture::new(None, &[("leaf1", None, LinkState::Authenticated)]);

        let err = f
            .router
            .broadcast_chat(&f.registry, "hub1", "bob", "hi\nCMD:{}", None)
            .expect_err("multi-line chat");
        assert!(matches!(err, RouteError::Frame(_)));
        assert!(f
            .router
            .broadcast_chat(&f.registry, "hub1", "bob smith", "hi", None)
            .is_err());
        assert!(f.sent().is_empty());
    }

    #[test]
    fn test_inbound_command_for_other_bot_is_forwarded_not_run() {
        let mut f = Fixture::new(
            None,
            &[
                ("leaf1", None, LinkState::Authenticated),
                ("leaf2", None, LinkState::Authenticated),
            ],
        );

        let frame = |to: &str| {
            Frame::Cmd(RelayCommand {
                cmd: "op".into(),
                args: "#chan bob".into(),
                target: Target::Bot(to.into()),
                origin: Some("leaf1".into()),
            })
        };
        f.router.handle_inbound(&f.registry, "leaf1", frame("leaf2"));
        f.router.handle_inbound(&f.registry, "leaf1", frame("nowhere"));

        assert!(f.executor.calls().is_empty());
        let sent = f.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "leaf2");
    }

    #[test]
    fn test_share_state_round_trip_into_directory() {
        let mut f = Fixture::new(None, &[("leaf1", None, LinkState::Authenticated)]);
        let user = UserRecord {
            handle: "alice".into(),
            hostmasks: vec!["*!alice@example.org".into()],
            flags: "+o".into(),
            info: String::new(),
            laston: 0,
        };
        f.directory.upsert_user(user.clone()).expect("upsert");

        let session = f.registry.get("leaf1").expect("session");
        f.router.share_state(session, ShareScope::Users).expect("share");
        let sent = f.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0].1, Frame::ShareUsers(users) if users == &vec![user.clone()]));

        // Receiving side merges by handle
        let other = Arc::new(MemoryDirectory::new());
        let receiver = Router::new(
            "leaf1",
            None,
            other.clone(),
            f.executor.clone(),
            f.hub.clone(),
        );
        let mut updated = user;
        updated.flags = "+mo".into();
        receiver.handle_inbound(&f.registry, "hub1", Frame::ShareUsers(vec![updated.clone()]));
        receiver.handle_inbound(&f.registry, "hub1", Frame::ShareUsers(vec![updated.clone()]));
        assert_eq!(other.users().expect("users"), vec![updated]);
    }
}
