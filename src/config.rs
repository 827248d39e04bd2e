//! # Store Configuration
//!
//! Plain structs with `Default` impls and `with_*` builders. A deployment can
//! overlay environment variables on the defaults with [`StoreConfig::from_env`]:
//!
//! | Variable                       | Field                                 |
//! |--------------------------------|---------------------------------------|
//! | `CEDAR_STORE_PATH`             | `storage.path` (unset = in-memory)    |
//! | `CEDAR_STORE_DURABILITY`       | `storage.durability` (`full`/`normal`)|
//! | `CEDAR_READER_CONNECTIONS`     | `storage.reader_connections`          |
//! | `CEDAR_MAX_GROUP_SIZE`         | `storage.max_group_size`              |
//! | `CEDAR_SUBSCRIPTION_CAPACITY`  | `subscriptions.channel_capacity`      |
//! | `CEDAR_CATCHUP_BATCH_SIZE`     | `subscriptions.catchup_batch_size`    |
//! | `CEDAR_USE_CANONICAL_URLS`     | `http.use_canonical_urls`             |

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::http::MiddlewareOptions;

// =============================================================================
// Defaults
// =============================================================================

/// Notifications buffered per subscription target before a subscriber that
/// has not consumed them is failed with `SlowConsumer`.
///
/// Broadcast channels hold a power of two; other values are rounded up (see
/// [`SubscriptionConfig::effective_channel_capacity`]).
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Entries read per step while a subscription catches up.
pub const DEFAULT_CATCHUP_BATCH_SIZE: usize = 512;

/// Read-only SQLite connections for file-backed stores.
pub const DEFAULT_READER_CONNECTIONS: usize = 4;

/// Most append requests committed in one storage transaction.
pub const DEFAULT_MAX_GROUP_SIZE: usize = 1000;

// =============================================================================
// Storage
// =============================================================================

/// How hard SQLite works to make a commit survive power loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// `synchronous = NORMAL`: survives process crashes, may lose the last
    /// commits on an OS crash.
    Normal,
    /// `synchronous = FULL`: every acknowledged commit is on disk.
    #[default]
    Full,
}

impl FromStr for Durability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Durability::Normal),
            "full" => Ok(Durability::Full),
            other => Err(Error::InvalidArgument(format!(
                "unknown durability '{other}', expected 'full' or 'normal'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// SQLite file. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    pub durability: Durability,
    /// Ignored for in-memory stores, which read through the writer's connection.
    pub reader_connections: usize,
    /// Appends that queued up during a commit share the next one, up to this many.
    pub max_group_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            durability: Durability::default(),
            reader_connections: DEFAULT_READER_CONNECTIONS,
            max_group_size: DEFAULT_MAX_GROUP_SIZE,
        }
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Requested broadcast capacity; rounded up to a power of two.
    pub channel_capacity: usize,
    pub catchup_batch_size: usize,
}

impl SubscriptionConfig {
    /// How far a subscriber may fall behind before `SlowConsumer`.
    pub fn effective_channel_capacity(&self) -> usize {
        self.channel_capacity.max(1).next_power_of_two()
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            catchup_batch_size: DEFAULT_CATCHUP_BATCH_SIZE,
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Top-level configuration passed to [`EventStore::open`](crate::EventStore::open).
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub storage: StorageConfig,
    pub subscriptions: SubscriptionConfig,
    pub http: MiddlewareOptions,
}

impl StoreConfig {
    /// In-memory store with default settings.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// File-backed store with default settings.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self::default().with_path(path)
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.path = Some(path.into());
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.storage.durability = durability;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.subscriptions.channel_capacity = capacity;
        self
    }

    pub fn with_catchup_batch_size(mut self, size: usize) -> Self {
        self.subscriptions.catchup_batch_size = size;
        self
    }

    /// Defaults overlaid with `CEDAR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("CEDAR_STORE_PATH").filter(|p| !p.is_empty()) {
            config.storage.path = Some(PathBuf::from(path));
        }
        if let Some(durability) = lookup("CEDAR_STORE_DURABILITY") {
            config.storage.durability = durability.parse()?;
        }
        if let Some(count) = lookup("CEDAR_READER_CONNECTIONS") {
            config.storage.reader_connections = parse_positive("CEDAR_READER_CONNECTIONS", &count)?;
        }
        if let Some(size) = lookup("CEDAR_MAX_GROUP_SIZE") {
            config.storage.max_group_size = parse_positive("CEDAR_MAX_GROUP_SIZE", &size)?;
        }
        if let Some(capacity) = lookup("CEDAR_SUBSCRIPTION_CAPACITY") {
            config.subscriptions.channel_capacity =
                parse_positive("CEDAR_SUBSCRIPTION_CAPACITY", &capacity)?;
        }
        if let Some(batch) = lookup("CEDAR_CATCHUP_BATCH_SIZE") {
            config.subscriptions.catchup_batch_size =
                parse_positive("CEDAR_CATCHUP_BATCH_SIZE", &batch)?;
        }
        if let Some(flag) = lookup("CEDAR_USE_CANONICAL_URLS") {
            config.http.use_canonical_urls = parse_bool("CEDAR_USE_CANONICAL_URLS", &flag)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.storage.reader_connections == 0 {
            return Err(Error::InvalidArgument(
                "reader connection count must be at least 1".into(),
            ));
        }
        if self.storage.max_group_size == 0 {
            return Err(Error::InvalidArgument("max group size must be at least 1".into()));
        }
        if self.subscriptions.channel_capacity == 0 {
            return Err(Error::InvalidArgument(
                "subscription channel capacity must be at least 1".into(),
            ));
        }
        if self.subscriptions.catchup_batch_size == 0 {
            return Err(Error::InvalidArgument(
                "catch-up batch size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::InvalidArgument(format!(
            "{key} must be a positive integer, got '{value}'"
        ))),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidArgument(format!(
            "{key} must be a boolean, got '{value}'"
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================
