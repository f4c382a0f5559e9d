//! Bot, user and channel records.
//!
//! The link core only needs a handful of lookups from the surrounding bot's
//! database, expressed by the [`BotDirectory`] trait. [`MemoryDirectory`] is
//! the in-process implementation used by the binary and the tests; it can be
//! backed by a JSON file that is rewritten after every change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

/// Errors from the directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("bot not found: {0}")]
    NotFound(String),

    #[error("failed to read or write directory file: {0}")]
    Io(#[source] std::io::Error),

    #[error("invalid directory file: {0}")]
    Json(#[source] serde_json::Error),

    #[error("directory lock poisoned")]
    Poisoned,
}

/// Topology position of a bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Hub,
    Backup,
    Leaf,
    #[default]
    None,
}

/// How eagerly user/channel state is pushed to a bot once it links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShareLevel {
    /// Never share.
    None,
    /// Share only on request.
    #[default]
    Passive,
    /// Push users and channels as soon as the link authenticates.
    Aggressive,
}

/// A known bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotRecord {
    pub handle: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Derived during the first handshake with this bot, then reused.
    #[serde(default)]
    pub shared_secret: Option<String>,
    #[serde(default)]
    pub subnet_id: Option<u32>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub share_level: ShareLevel,
}

impl BotRecord {
    /// A record with only a handle set.
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            address: None,
            port: None,
            shared_secret: None,
            subnet_id: None,
            role: Role::None,
            share_level: ShareLevel::Passive,
        }
    }

    /// Set the address and port this bot listens on.
    #[must_use]
    pub fn at(mut self, address: impl Into<String>, port: u16) -> Self {
        self.address = Some(address.into());
        self.port = Some(port);
        self
    }

    #[must_use]
    pub const fn in_subnet(mut self, subnet_id: u32) -> Self {
        self.subnet_id = Some(subnet_id);
        self
    }

    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.shared_secret = Some(secret.into());
        self
    }

    #[must_use]
    pub const fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    #[must_use]
    pub const fn with_share_level(mut self, level: ShareLevel) -> Self {
        self.share_level = level;
        self
    }
}

/// A partyline/IRC user row, as shared between bots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub handle: String,
    #[serde(default)]
    pub hostmasks: Vec<String>,
    /// Global flags, e.g. `+nmo`.
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub info: String,
    /// Unix timestamp of the last time the user was seen.
    #[serde(default)]
    pub laston: u64,
}

/// A channel row, as shared between bots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub name: String,
    #[serde(default)]
    pub subnet_id: Option<u32>,
    /// Comma-separated channel settings, e.g. `enforce-bans,dynamic-bans`.
    #[serde(default)]
    pub settings: String,
}

/// Lookups the link core performs against the bot database.
pub trait BotDirectory: Send + Sync {
    /// Fetch a bot by handle.
    fn get(&self, handle: &str) -> Result<BotRecord, DirectoryError>;

    /// Persist a freshly derived shared secret for a bot.
    fn set_secret(&self, handle: &str, secret: &str) -> Result<(), DirectoryError>;

    /// All users, for `SHAREUSERS`.
    fn users(&self) -> Result<Vec<UserRecord>, DirectoryError>;

    /// All channels, for `SHARECHANS`.
    fn channels(&self) -> Result<Vec<ChannelRecord>, DirectoryError>;

    /// Insert or replace a user by handle.
    fn upsert_user(&self, user: UserRecord) -> Result<(), DirectoryError>;

    /// Insert or replace a channel by name.
    fn upsert_channel(&self, channel: ChannelRecord) -> Result<(), DirectoryError>;
}

/// On-disk layout of a directory file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    bots: Vec<BotRecord>,
    #[serde(default)]
    users: Vec<UserRecord>,
    #[serde(default)]
    channels: Vec<ChannelRecord>,
}

#[derive(Debug, Default)]
struct Tables {
    bots: BTreeMap<String, BotRecord>,
    users: BTreeMap<String, UserRecord>,
    channels: BTreeMap<String, ChannelRecord>,
}

impl From<DirectoryFile> for Tables {
    fn from(file: DirectoryFile) -> Self {
        Self {
            bots: file.bots.into_iter().map(|b| (b.handle.clone(), b)).collect(),
            users: file.users.into_iter().map(|u| (u.handle.clone(), u)).collect(),
            channels: file
                .channels
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
        }
    }
}

impl Tables {
    fn to_file(&self) -> DirectoryFile {
        DirectoryFile {
            bots: self.bots.values().cloned().collect(),
            users: self.users.values().cloned().collect(),
            channels: self.channels.values().cloned().collect(),
        }
    }
}

/// In-memory directory, optionally persisted to a JSON file.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    tables: RwLock<Tables>,
    path: Option<PathBuf>,
}

impl MemoryDirectory {
    /// Create an empty, unpersisted directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a directory from a JSON file. A missing file yields an empty
    /// directory that will be created on the first write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref().to_path_buf();
        let file = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(DirectoryError::Json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DirectoryFile::default(),
            Err(e) => return Err(DirectoryError::Io(e)),
        };
        Ok(Self {
            tables: RwLock::new(file.into()),
            path: Some(path),
        })
    }

    /// Add or replace a bot record.
    pub fn add_bot(&self, record: BotRecord) -> Result<(), DirectoryError> {
        self.mutate(|t| {
            t.bots.insert(record.handle.clone(), record);
        })
    }

    /// Builder-style [`add_bot`](Self::add_bot) for tests and setup code.
    #[must_use]
    pub fn with_bot(self, record: BotRecord) -> Self {
        if let Ok(mut tables) = self.tables.write() {
            tables.bots.insert(record.handle.clone(), record);
        }
        self
    }

    /// Number of known bots.
    #[must_use]
    pub fn bot_count(&self) -> usize {
        self.tables.read().map_or(0, |t| t.bots.len())
    }

    fn mutate(&self, f: impl FnOnce(&mut Tables)) -> Result<(), DirectoryError> {
        let mut tables = self.tables.write().map_err(|_| DirectoryError::Poisoned)?;
        f(&mut tables);
        if let Some(path) = &self.path {
            Self::persist(path, &tables)?;
        }
        Ok(())
    }

    fn persist(path: &Path, tables: &Tables) -> Result<(), DirectoryError> {
        let json =
            serde_json::to_string_pretty(&tables.to_file()).map_err(DirectoryError::Json)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(DirectoryError::Io)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(DirectoryError::Io)?;
        std::fs::rename(&tmp, path).map_err(DirectoryError::Io)?;
        debug!(path = %path.display(), "Directory saved");
        Ok(())
    }
}

impl BotDirectory for MemoryDirectory {
    fn get(&self, handle: &str) -> Result<BotRecord, DirectoryError> {
        let tables = self.tables.read().map_err(|_| DirectoryError::Poisoned)?;
        tables
            .bots
            .get(handle)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(handle.to_string()))
    }

    fn set_secret(&self, handle: &str, secret: &str) -> Result<(), DirectoryError> {
        let mut found = false;
        self.mutate(|t| {
            if let Some(bot) = t.bots.get_mut(handle) {
                bot.shared_secret = Some(secret.to_string());
                found = true;
            }
        })?;
        if found {
            Ok(())
        } else {
            Err(DirectoryError::NotFound(handle.to_string()))
        }
    }

    fn users(&self) -> Result<Vec<UserRecord>, DirectoryError> {
        let tables = self.tables.read().map_err(|_| DirectoryError::Poisoned)?;
        Ok(tables.users.values().cloned().collect())
    }

    fn channels(&self) -> Result<Vec<ChannelRecord>, DirectoryError> {
        let tables = self.tables.read().map_err(|_| DirectoryError::Poisoned)?;
        Ok(tables.channels.values().cloned().collect())
    }

    fn upsert_user(&self, user: UserRecord) -> Result<(), DirectoryError> {
        self.mutate(|t| {
            t.users.insert(user.handle.clone(), user);
        })
    }

    fn upsert_channel(&self, channel: ChannelRecord) -> Result<(), DirectoryError> {
        self.mutate(|t| {
            t.channels.insert(channel.name.clone(), channel);
        })
    }
}
