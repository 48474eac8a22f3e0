//! Redis-backed counter store.
//!
//! Batches run as a `MULTI`/`EXEC` pipeline, so an increment and its TTL
//! refresh are applied together and a concurrent reader never sees the
//! counter without its expiry.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Value};
use tracing::{debug, info};

use super::{Batch, Command, CounterStore, ExpireMode, Reply, StoreError, StoreResult};

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// A counter store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!("Connected to Redis counter store");
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    // PEXPIRE rejects zero; round sub-millisecond windows up.
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn pexpire_cmd(key: &str, ttl: Duration, mode: ExpireMode) -> redis::Cmd {
    let mut cmd = redis::cmd("PEXPIRE");
    cmd.arg(key).arg(ttl_millis(ttl));
    if mode == ExpireMode::IfUnset {
        cmd.arg("NX");
    }
    cmd
}

fn to_reply(command: &Command, value: &Value) -> StoreResult<Reply> {
    match command {
        Command::Increment { .. } => {
            let count: u64 = redis::from_redis_value(value)?;
            Ok(Reply::Count(count))
        }
        Command::Get { .. } => {
            let count: Option<u64> = redis::from_redis_value(value)?;
            Ok(count.map_or(Reply::Nil, Reply::Count))
        }
        Command::Expire { .. } | Command::Delete { .. } => Ok(Reply::Done),
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.incr(key, 1).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration, mode: ExpireMode) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = pexpire_cmd(key, ttl, mode).query_async(&mut conn).await?;
        Ok(())
    }

    async fn execute(&self, batch: Batch) -> StoreResult<Vec<Reply>> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in batch.commands() {
            match command {
                Command::Increment { key } => {
                    pipe.incr(key, 1);
                }
                Command::Expire { key, ttl, mode } => {
                    pipe.add_command(pexpire_cmd(key, *ttl, *mode));
                }
                Command::Delete { key } => {
                    pipe.del(key);
                }
                Command::Get { key } => {
                    pipe.get(key);
                }
            }
        }

        let mut conn = self.conn.clone();
        let values: Vec<Value> = pipe.query_async(&mut conn).await?;
        if values.len() != batch.len() {
            return Err(StoreError::UnexpectedReply(format!(
                "expected {} replies, got {}",
                batch.len(),
                values.len()
            )));
        }

        debug!(commands = batch.len(), "Executed Redis pipeline");

        batch
            .commands()
            .iter()
            .zip(values.iter())
            .map(|(command, value)| to_reply(command, value))
            .collect()
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn.get(key).await?;
        Ok(count)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
