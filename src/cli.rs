//! Command-line interface for botlink.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Botnet link node and control client.
#[derive(Debug, Parser)]
#[command(name = "botlink", version, about)]
pub struct Cli {
    /// Path to the control socket.
    #[arg(long, env = "BOTLINK_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a node in the foreground.
    Serve {
        /// This bot's handle.
        #[arg(long, env = "BOTLINK_HANDLE")]
        handle: String,

        /// Address to accept bot links on.
        #[arg(long, env = "BOTLINK_LISTEN", default_value = "0.0.0.0:3333")]
        listen: SocketAddr,

        /// JSON file holding bot, user and channel records.
        #[arg(long, env = "BOTLINK_DIRECTORY")]
        directory: Option<PathBuf>,

        /// Bots to link to once listening (repeatable).
        #[arg(long = "link", value_name = "HANDLE")]
        links: Vec<String>,
    },

    /// Link to a bot from the directory.
    Link {
        /// Bot handle.
        handle: String,
    },

    /// Drop a link.
    Unlink {
        /// Bot handle.
        handle: String,
    },

    /// Relay a chat line to every linked bot.
    Chat {
        /// Partyline nick the line comes from.
        #[arg(long, short, default_value = "console")]
        user: String,

        /// Partyline channel (0 = global).
        #[arg(long, default_value = "0")]
        channel: u32,

        /// Message text.
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },

    /// Run a dot-command, e.g. `relay botnet say hi` or `bots`.
    Cmd {
        /// Partyline user issuing the command.
        #[arg(long, short, default_value = "console")]
        user: String,

        /// Command line.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        line: Vec<String>,
    },

    /// List current links.
    Peers {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check that the node is running.
    Ping,

    /// Close all links and stop the node.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["botlink", "serve", "--handle", "hub1"]).expect("parse");
        match cli.command {
            Command::Serve {
                handle,
                listen,
                directory,
                links,
            } => {
                assert_eq!(handle, "hub1");
                assert_eq!(listen, "0.0.0.0:3333".parse::<SocketAddr>().expect("addr"));
                assert!(directory.is_none());
                assert!(links.is_empty());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_repeated_links() {
        let cli = Cli::try_parse_from([
            "botlink", "serve", "--handle", "hub1", "--link", "leaf1", "--link", "leaf2",
        ])
        .expect("parse");
        assert!(matches!(cli.command, Command::Serve { links, .. } if links == ["leaf1", "leaf2"]));
    }

    #[test]
    fn test_cmd_keeps_words() {
        let cli = Cli::try_parse_from(["botlink", "cmd", "-u", "alice", ".relay", "botnet", "say", "hi"])
            .expect("parse");
        match cli.command {
            Command::Cmd { user, line } => {
                assert_eq!(user, "alice");
                assert_eq!(line.join(" "), ".relay botnet say hi");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_chat_requires_text() {
        assert!(Cli::try_parse_from(["botlink", "chat"]).is_err());
    }
}
