//! Integration points with the rest of the bot.
//!
//! The link core does not own the partyline, the command table, or the
//! telnet/console front end. It calls out to them through these traits. The
//! `Log*` implementations only record what would have happened and are what
//! the standalone binary uses.

use std::net::SocketAddr;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::info;

/// The local partyline: console, telnet and DCC sessions.
pub trait PartylineHub: Send + Sync {
    /// Show a line to every partyline session. `local_only` lines must not
    /// be relayed back into the botnet by the hub.
    fn broadcast(&self, text: &str, local_only: bool);

    /// Reply to one partyline user.
    fn send_to(&self, user: &str, text: &str) {
        self.broadcast(&format!("[{user}] {text}"), true);
    }
}

/// The local command table. Execution is fire-and-forget.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, cmd: &str, args: &str, from: &str);
}

/// A connection whose first line was not a `BOTLINK`.
pub struct ClientConnection {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
    pub first_line: String,
    pub addr: SocketAddr,
}

/// Takes over non-bot connections accepted on the link port.
pub trait ClientAcceptor: Send + Sync {
    fn accept(&self, conn: ClientConnection);
}

/// Partyline that writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPartyline;

impl PartylineHub for LogPartyline {
    fn broadcast(&self, text: &str, local_only: bool) {
        info!(local_only, "partyline: {}", text);
    }

    fn send_to(&self, user: &str, text: &str) {
        info!(%user, "partyline reply: {}", text);
    }
}

/// Executor that logs commands instead of running them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogExecutor;

impl CommandExecutor for LogExecutor {
    fn execute(&self, cmd: &str, args: &str, from: &str) {
        info!(%cmd, %args, %from, "Command for local execution");
    }
}

/// Drops non-bot connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectClients;

impl ClientAcceptor for RejectClients {
    fn accept(&self, conn: ClientConnection) {
        info!(addr = %conn.addr, "Non-bot connection on link port, closing");
    }
}
