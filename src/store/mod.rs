//! Shared counter store abstraction.
//!
//! The rate limiter keeps no durable state of its own. Every counter lives in
//! an external key-value store that supports atomic increments, key
//! expiration and batched execution of several commands as one unit. This
//! module defines that contract and ships the in-process implementation; the
//! Redis implementation is available behind the `redis` feature.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::{MemoryStore, DEFAULT_SWEEP_INTERVAL};
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by counter store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, dropped, ...)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected or failed to run a command
    #[error("command failed: {0}")]
    Command(String),

    /// The store answered with something the command cannot produce
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// How an expire command treats a key that already has a TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireMode {
    /// Always overwrite the TTL.
    Always,
    /// Only set the TTL when the key has none (Redis `NX`).
    IfUnset,
}

/// A single store command, used to build batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Atomically add one, creating the key at 1 if absent.
    Increment { key: String },
    /// Set the key's time-to-live. A missing key is left untouched.
    Expire {
        key: String,
        ttl: Duration,
        mode: ExpireMode,
    },
    /// Remove the key. Removing a missing key is not an error.
    Delete { key: String },
    /// Read the key's value.
    Get { key: String },
}

/// The store's answer to one command of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// A counter value (from `Increment`, or `Get` on a present key)
    Count(u64),
    /// `Get` on a missing key
    Nil,
    /// `Expire` and `Delete` acknowledgements
    Done,
}

impl Reply {
    /// The counter value carried by this reply, if any.
    pub fn as_count(&self) -> Option<u64> {
        match self {
            Reply::Count(count) => Some(*count),
            _ => None,
        }
    }
}

/// An ordered group of commands executed as one unit.
///
/// Implementations must run the commands so that no concurrent client can
/// observe the batch half-applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an increment.
    pub fn increment(mut self, key: impl Into<String>) -> Self {
        self.commands.push(Command::Increment { key: key.into() });
        self
    }

    /// Append an expire.
    pub fn expire(mut self, key: impl Into<String>, ttl: Duration, mode: ExpireMode) -> Self {
        self.commands.push(Command::Expire {
            key: key.into(),
            ttl,
            mode,
        });
        self
    }

    /// Append a delete.
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.commands.push(Command::Delete { key: key.into() });
        self
    }

    /// Append a get.
    pub fn get(mut self, key: impl Into<String>) -> Self {
        self.commands.push(Command::Get { key: key.into() });
        self
    }

    /// The commands in execution order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Number of commands in the batch.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the batch has no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl IntoIterator for Batch {
    type Item = Command;
    type IntoIter = std::vec::IntoIter<Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.into_iter()
    }
}

/// Trait for shared counter stores.
///
/// A store is shared by every limiter instance in a deployment, so all
/// counting guarantees come from here: `increment` must never lose an update
/// under concurrent callers, and `execute` must apply a batch as a unit.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add one to `key` and return the new value.
    async fn increment(&self, key: &str) -> StoreResult<u64>;

    /// Set the time-to-live of `key`.
    async fn expire(&self, key: &str, ttl: Duration, mode: ExpireMode) -> StoreResult<()>;

    /// Run a batch, returning one reply per command in order.
    async fn execute(&self, batch: Batch) -> StoreResult<Vec<Reply>>;

    /// Remove `key`.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Read `key`, `None` when it does not exist.
    async fn get(&self, key: &str) -> StoreResult<Option<u64>>;

    /// Backend name for logging.
    fn backend(&self) -> &'static str;
}
