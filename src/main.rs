//! botlink - botnet link node

use botlink::{
    BridgeItem, Cli, Client, Command, Hooks, MemoryDirectory, Node, NodeConfig, default_socket_path,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("botlink=debug")
    } else {
        EnvFilter::new("botlink=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let socket_path = cli.socket.unwrap_or_else(default_socket_path);

    let result = match cli.command {
        Command::Serve {
            handle,
            listen,
            directory,
            links,
        } => run_node(socket_path, handle, listen, directory, links).await,
        cmd => run_client(socket_path, cmd).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_node(
    socket_path: PathBuf,
    handle: String,
    listen: std::net::SocketAddr,
    directory: Option<PathBuf>,
    links: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let directory = match directory {
        Some(path) => MemoryDirectory::open(path)?,
        None => {
            warn!("No --directory given, using an empty in-memory directory");
            MemoryDirectory::new()
        }
    };
    info!(bots = directory.bot_count(), "Directory loaded");

    let config = NodeConfig::new(handle, listen).with_control_socket(socket_path);
    let node = Node::bind(config, Arc::new(directory), Hooks::default()).await?;
    let control = node.handle();
    for peer in links {
        control.link(peer)?;
    }

    let stop = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            stop.shutdown().await;
        }
    });

    node.run().await?;
    Ok(())
}

async fn run_client(socket_path: PathBuf, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::new(socket_path);

    match command {
        Command::Link { handle } => {
            client.submit(BridgeItem::Link { handle }).await?;
        }
        Command::Unlink { handle } => {
            client.submit(BridgeItem::Unlink { handle }).await?;
        }
        Command::Chat {
            user,
            channel,
            text,
        } => {
            let text = text.join(" ");
            client.submit(BridgeItem::Chat { user, text, channel }).await?;
        }
        Command::Cmd { user, line } => {
            let cmd = line.join(" ");
            client.submit(BridgeItem::Cmd { cmd, user }).await?;
        }
        Command::Peers { json } => {
            let peers = client.peers().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&peers)?);
            } else if peers.is_empty() {
                println!("No links");
            } else {
                println!(
                    "{:<12} {:<18} {:<8} {:<6} ADDRESS",
                    "HANDLE", "STATE", "DIR", "SUBNET"
                );
                for peer in peers {
                    let subnet = peer
                        .subnet_id
                        .map_or_else(|| "-".to_string(), |id| id.to_string());
                    println!(
                        "{:<12} {:<18} {:<8} {:<6} {}:{}",
                        peer.handle,
                        peer.state.as_str(),
                        peer.direction.as_str(),
                        subnet,
                        peer.host,
                        peer.port
                    );
                }
            }
        }
        Command::Ping => {
            client.ping().await?;
            println!("pong");
        }
        Command::Shutdown => {
            client.shutdown().await?;
            println!("Node shutting down");
        }
        Command::Serve { .. } => return Err("serve is not a client command".into()),
    }

    Ok(())
}
