//! Store doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ratekeeper::ratelimit::{LimitClass, LimitRegistry};
use ratekeeper::store::{
    Batch, CounterStore, ExpireMode, MemoryStore, Reply, StoreError, StoreResult,
};

/// A store that is down: every call fails.
#[derive(Debug, Default)]
pub struct DownStore {
    pub calls: AtomicUsize,
}

impl DownStore {
    fn fail<T>(&self) -> StoreResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

#[async_trait]
impl CounterStore for DownStore {
    async fn increment(&self, _key: &str) -> StoreResult<u64> {
        self.fail()
    }

    async fn expire(&self, _key: &str, _ttl: Duration, _mode: ExpireMode) -> StoreResult<()> {
        self.fail()
    }

    async fn execute(&self, _batch: Batch) -> StoreResult<Vec<Reply>> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> StoreResult<()> {
        self.fail()
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<u64>> {
        self.fail()
    }

    fn backend(&self) -> &'static str {
        "down"
    }
}

/// A store that accepts connections but never answers.
#[derive(Debug, Default)]
pub struct StalledStore;

impl StalledStore {
    async fn hang<T>(&self) -> StoreResult<T> {
        futures::future::pending().await
    }
}

#[async_trait]
impl CounterStore for StalledStore {
    async fn increment(&self, _key: &str) -> StoreResult<u64> {
        self.hang().await
    }

    async fn expire(&self, _key: &str, _ttl: Duration, _mode: ExpireMode) -> StoreResult<()> {
        self.hang().await
    }

    async fn execute(&self, _batch: Batch) -> StoreResult<Vec<Reply>> {
        self.hang().await
    }

    async fn delete(&self, _key: &str) -> StoreResult<()> {
        self.hang().await
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<u64>> {
        self.hang().await
    }

    fn backend(&self) -> &'static str {
        "stalled"
    }
}

/// A registry holding one class, which is also the default.
pub fn single_class(name: &str, requests: u64, window: Duration) -> LimitRegistry {
    LimitRegistry::new(name, [(name, LimitClass::new(requests, window))]).unwrap()
}

pub fn shared_memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}
