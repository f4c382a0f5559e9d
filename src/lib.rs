//! botlink - botnet peer linking
//!
//! Bots link to each other over TCP, authenticate with a shared secret
//! bootstrapped on first contact, and relay partyline chat, commands and
//! user/channel state across a hub/leaf/subnet topology.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod client;
pub mod directory;
pub mod frame;
pub mod handshake;
pub mod hooks;
pub mod node;
pub mod protocol;
pub mod testing;

pub use cli::{Cli, Command};
pub use client::{Client, ClientError, default_socket_path};
pub use directory::{BotDirectory, BotRecord, DirectoryError, MemoryDirectory, Role, ShareLevel};
pub use frame::{Frame, FrameError, RelayCommand, Target};
pub use handshake::{HandshakeError, Negotiator};
pub use hooks::{ClientAcceptor, ClientConnection, CommandExecutor, PartylineHub};
pub use node::{Hooks, Node, NodeConfig, NodeError, NodeHandle};
pub use protocol::{BridgeItem, ControlRequest, Direction, LinkState, PeerInfo, Request, Response};
pub use testing::{RawPeer, TestError, TestNode};
