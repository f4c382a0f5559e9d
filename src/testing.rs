//! Test framework for multi-node link scenarios.
//!
//! Runs real nodes on loopback ports with recording hooks, plus a scripted
//! raw peer for driving the wire protocol by hand:
//!
//! ```ignore
//! let hub = TestNode::start("hub1").await?;
//! let leaf = TestNode::start("leaf1").await?;
//! hub.knows(&leaf)?;
//! leaf.knows(&hub)?;
//!
//! hub.handle().link("leaf1")?;
//! hub.wait_for_state("leaf1", LinkState::Authenticated, Duration::from_secs(5)).await?;
//! ```

use crate::directory::{BotRecord, MemoryDirectory};
use crate::hooks::{CommandExecutor, PartylineHub};
use crate::node::{Hooks, Node, NodeConfig, NodeHandle};
use crate::protocol::{LinkState, PeerInfo};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::Instant;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// How often wait helpers re-check their condition.
const POLL: Duration = Duration::from_millis(20);

/// Errors from the test framework.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("timeout waiting for {0}")]
    Timeout(String),

    #[error("node error: {0}")]
    Node(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A unique control socket path for this process.
#[must_use]
pub fn unique_socket_path() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let pid = std::process::id();
    PathBuf::from(format!("/tmp/botlink-test-{pid}-{id}.sock"))
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Partyline that remembers everything shown on it.
#[derive(Debug, Default)]
pub struct RecordingHub {
    lines: Mutex<Vec<(String, bool)>>,
    replies: Mutex<Vec<(String, String)>>,
}

impl RecordingHub {
    /// Broadcast lines with their `local_only` flag.
    pub fn lines(&self) -> Vec<(String, bool)> {
        lock(&self.lines).clone()
    }

    /// Replies addressed to individual users.
    pub fn replies(&self) -> Vec<(String, String)> {
        lock(&self.replies).clone()
    }

    /// True if any broadcast or reply contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        lock(&self.lines).iter().any(|(l, _)| l.contains(needle))
            || lock(&self.replies).iter().any(|(_, r)| r.contains(needle))
    }
}

impl PartylineHub for RecordingHub {
    fn broadcast(&self, text: &str, local_only: bool) {
        lock(&self.lines).push((text.to_string(), local_only));
    }

    fn send_to(&self, user: &str, text: &str) {
        lock(&self.replies).push((user.to_string(), text.to_string()));
    }
}

/// Executor that records `(cmd, args, from)` instead of running anything.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<(String, String, String)>>,
}

impl RecordingExecutor {
    pub fn calls(&self) -> Vec<(String, String, String)> {
        lock(&self.calls).clone()
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(&self, cmd: &str, args: &str, from: &str) {
        lock(&self.calls).push((cmd.to_string(), args.to_string(), from.to_string()));
    }
}

/// Poll `check` until it returns true.
pub async fn wait_until<F>(what: &str, timeout: Duration, mut check: F) -> Result<(), TestError>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TestError::Timeout(what.to_string()));
        }
        tokio::time::sleep(POLL).await;
    }
}

/// A node running on a loopback port with recording hooks.
pub struct TestNode {
    name: String,
    addr: SocketAddr,
    handle: NodeHandle,
    directory: Arc<MemoryDirectory>,
    hub: Arc<RecordingHub>,
    executor: Arc<RecordingExecutor>,
    task: JoinHandle<()>,
}

impl TestNode {
    /// Start a node with an empty directory.
    pub async fn start(name: &str) -> Result<Self, TestError> {
        Self::start_with(name, MemoryDirectory::new(), None).await
    }

    /// Start a node with a prepared directory and optional control socket.
    pub async fn start_with(
        name: &str,
        directory: MemoryDirectory,
        control_socket: Option<PathBuf>,
    ) -> Result<Self, TestError> {
        let directory = Arc::new(directory);
        let hub = Arc::new(RecordingHub::default());
        let executor = Arc::new(RecordingExecutor::default());
        let hooks = Hooks::default()
            .with_partyline(hub.clone())
            .with_executor(executor.clone());

        let listen: SocketAddr = ([127, 0, 0, 1], 0).into();
        let mut config = NodeConfig::new(name, listen).with_bridge_spacing(Duration::from_millis(5));
        config.control_socket = control_socket;

        let node = Node::bind(config, directory.clone(), hooks)
            .await
            .map_err(|e| TestError::Node(e.to_string()))?;
        let addr = node.local_addr().map_err(|e| TestError::Node(e.to_string()))?;
        let handle = node.handle();
        let task = tokio::spawn(async move {
            let _ = node.run().await;
        });

        Ok(Self {
            name: name.to_string(),
            addr,
            handle,
            directory,
            hub,
            executor,
            task,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub const fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    #[must_use]
    pub fn directory(&self) -> &MemoryDirectory {
        &self.directory
    }

    #[must_use]
    pub fn hub(&self) -> &RecordingHub {
        &self.hub
    }

    #[must_use]
    pub fn executor(&self) -> &RecordingExecutor {
        &self.executor
    }

    /// Add `other` to this node's directory at its loopback address.
    pub fn knows(&self, other: &Self) -> Result<(), TestError> {
        self.add_bot(BotRecord::new(other.name()).at("127.0.0.1", other.addr().port()))
    }

    pub fn add_bot(&self, record: BotRecord) -> Result<(), TestError> {
        self.directory
            .add_bot(record)
            .map_err(|e| TestError::Node(e.to_string()))
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, TestError> {
        self.handle
            .peers()
            .await
            .map_err(|e| TestError::Node(e.to_string()))
    }

    pub async fn peer(&self, handle: &str) -> Result<Option<PeerInfo>, TestError> {
        Ok(self.peers().await?.into_iter().find(|p| p.handle == handle))
    }

    /// Wait until the link to `handle` reports `state`.
    pub async fn wait_for_state(
        &self,
        handle: &str,
        state: LinkState,
        timeout: Duration,
    ) -> Result<PeerInfo, TestError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(peer) = self.peer(handle).await? {
                if peer.state == state {
                    return Ok(peer);
                }
            }
            if Instant::now() >= deadline {
                return Err(TestError::Timeout(format!("{handle} to be {}", state.as_str())));
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Wait until there is no session for `handle`.
    pub async fn wait_for_gone(&self, handle: &str, timeout: Duration) -> Result<(), TestError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.peer(handle).await?.is_none() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TestError::Timeout(format!("{handle} to unlink")));
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Stop the node and wait for its task.
    pub async fn shutdown(self) {
        self.handle.shutdown().await;
        let _ = tokio::time::timeout(Duration::from_secs(2), self.task).await;
    }
}

/// A hand-driven bot connection for wire-level tests.
pub struct RawPeer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> Result<Self, TestError> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    /// Write one line; the trailing newline is added.
    pub async fn send_line(&mut self, line: &str) -> Result<(), TestError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    /// Write raw bytes as-is, for lines that are not valid UTF-8.
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), TestError> {
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    /// Next line, or `None` once the node closed the connection.
    pub async fn recv_line(&mut self, timeout: Duration) -> Result<Option<String>, TestError> {
        match tokio::time::timeout(timeout, self.lines.next_line()).await {
            Ok(Ok(line)) => Ok(line),
            // Reset by peer counts as closed
            Ok(Err(_)) => Ok(None),
            Err(_) => Err(TestError::Timeout("line from node".to_string())),
        }
    }

    /// Read until the node closes the connection, returning what it sent.
    pub async fn drain_until_closed(&mut self, timeout: Duration) -> Result<Vec<String>, TestError> {
        let deadline = Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.recv_line(left).await? {
                Some(line) => seen.push(line),
                None => return Ok(seen),
            }
        }
    }
}
