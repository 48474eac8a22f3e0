//! In-process counter store.
//!
//! Records carry their own deadline and are dropped lazily when touched after
//! it passes, the way a TTL store behaves from the client's point of view.
//! Records nobody touches again are reclaimed by a sweep that runs at most
//! once per sweep interval, piggybacked on ordinary store calls. Deadlines use
//! the tokio clock so paused-time tests can step through windows.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Batch, Command, CounterStore, ExpireMode, Reply, StoreError, StoreResult};

#[derive(Debug, Clone, Copy)]
struct Record {
    count: u64,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

/// How often expired records are swept out by default.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct State {
    records: HashMap<String, Record>,
    next_sweep: Option<Instant>,
}

impl State {
    fn purge(&mut self, now: Instant) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.is_live(now));
        before - self.records.len()
    }

    fn sweep_if_due(&mut self, now: Instant, interval: Duration) {
        match self.next_sweep {
            Some(due) if now < due => return,
            Some(_) => {
                let purged = self.purge(now);
                if purged > 0 {
                    debug!(purged, remaining = self.records.len(), "Swept expired records");
                }
            }
            None => {}
        }
        self.next_sweep = now.checked_add(interval);
    }
}

/// A counter store held in process memory.
///
/// A single lock guards the whole map, so a batch is applied atomically with
/// respect to every other caller sharing the store.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    sweep_interval: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that sweeps expired records every `interval`.
    pub fn with_sweep_interval(interval: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            sweep_interval: interval,
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state.lock().records.values().filter(|r| r.is_live(now)).count()
    }

    /// Whether the store holds no live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time-to-live of `key`, `None` if missing or without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let state = self.state.lock();
        let record = state.records.get(key).filter(|r| r.is_live(now))?;
        record.expires_at.map(|deadline| deadline - now)
    }

    /// Drop every expired record.
    pub fn purge_expired(&self) -> usize {
        self.state.lock().purge(Instant::now())
    }

    fn apply(records: &mut HashMap<String, Record>, command: Command, now: Instant) -> StoreResult<Reply> {
        if let Some(key) = command_key(&command) {
            if records.get(key).is_some_and(|r| !r.is_live(now)) {
                records.remove(key);
            }
        }

        match command {
            Command::Increment { key } => {
                let record = records.entry(key).or_insert(Record {
                    count: 0,
                    expires_at: None,
                });
                record.count = record
                    .count
                    .checked_add(1)
                    .ok_or_else(|| StoreError::Command("increment would overflow".to_string()))?;
                Ok(Reply::Count(record.count))
            }
            Command::Expire { key, ttl, mode } => {
                if let Some(record) = records.get_mut(&key) {
                    let should_set = match mode {
                        ExpireMode::Always => true,
                        ExpireMode::IfUnset => record.expires_at.is_none(),
                    };
                    if should_set {
                        // A deadline past the clock's range never arrives.
                        record.expires_at = now.checked_add(ttl);
                    }
                }
                Ok(Reply::Done)
            }
            Command::Delete { key } => {
                records.remove(&key);
                Ok(Reply::Done)
            }
            Command::Get { key } => Ok(records
                .get(&key)
                .map_or(Reply::Nil, |record| Reply::Count(record.count))),
        }
    }

    fn apply_one(&self, command: Command) -> StoreResult<Reply> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.sweep_if_due(now, self.sweep_interval);
        Self::apply(&mut state.records, command, now)
    }
}

fn command_key(command: &Command) -> Option<&str> {
    match command {
        Command::Increment { key }
        | Command::Expire { key, .. }
        | Command::Delete { key }
        | Command::Get { key } => Some(key.as_str()),
    }
}

fn expect_count(reply: Reply) -> StoreResult<u64> {
    reply
        .as_count()
        .ok_or_else(|| StoreError::UnexpectedReply(format!("{:?}", reply)))
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str) -> StoreResult<u64> {
        expect_count(self.apply_one(Command::Increment { key: key.to_string() })?)
    }

    async fn expire(&self, key: &str, ttl: Duration, mode: ExpireMode) -> StoreResult<()> {
        self.apply_one(Command::Expire {
            key: key.to_string(),
            ttl,
            mode,
        })?;
        Ok(())
    }

    async fn execute(&self, batch: Batch) -> StoreResult<Vec<Reply>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.sweep_if_due(now, self.sweep_interval);
        trace!(commands = batch.len(), "Executing batch against memory store");

        let records = &mut state.records;
        // A failing command leaves earlier ones applied, as with MULTI/EXEC.
        batch
            .into_iter()
            .map(|command| Self::apply(records, command, now))
            .collect()
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.apply_one(Command::Delete { key: key.to_string() })?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<u64>> {
        Ok(self.apply_one(Command::Get { key: key.to_string() })?.as_count())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
