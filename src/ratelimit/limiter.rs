//! Core rate limiter implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::classes::LimitRegistry;
use super::decision::{Decision, FailurePolicy};
use super::key::{CounterKey, DEFAULT_KEY_PREFIX};
use super::window::WindowMode;
use crate::error::{RatekeeperError, Result};
use crate::store::{Batch, CounterStore, StoreError, StoreResult};

/// Upper bound on a single store round-trip unless configured otherwise.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Tunables for a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterOptions {
    /// Verdict used when the store cannot answer, unless the class overrides it
    pub failure_policy: FailurePolicy,
    /// Rolling or fixed window semantics
    pub window_mode: WindowMode,
    /// Upper bound on each store round-trip
    pub store_timeout: Duration,
    /// Namespace for counter keys
    pub key_prefix: String,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            window_mode: WindowMode::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

/// Why a store call produced no result.
#[derive(Debug)]
enum Interrupted {
    Store(StoreError),
    Timeout(Duration),
    Cancelled,
}

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interrupted::Store(err) => write!(f, "{}", err),
            Interrupted::Timeout(budget) => write!(f, "timed out after {:?}", budget),
            Interrupted::Cancelled => write!(f, "cancelled by caller"),
        }
    }
}

/// A rate limiter that counts in a shared [`CounterStore`].
///
/// The limiter itself only holds read-only configuration, so any number of
/// instances, in any number of processes, can share one store and see one
/// count per `(category, identifier)` bucket.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    registry: Arc<LimitRegistry>,
    options: LimiterOptions,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.backend())
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter with default options.
    pub fn new(store: Arc<dyn CounterStore>, registry: LimitRegistry) -> Self {
        Self::with_options(store, registry, LimiterOptions::default())
    }

    /// Create a rate limiter with explicit options.
    pub fn with_options(
        store: Arc<dyn CounterStore>,
        registry: LimitRegistry,
        options: LimiterOptions,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            options,
        }
    }

    pub fn registry(&self) -> &LimitRegistry {
        &self.registry
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    /// The store key for a bucket.
    pub fn store_key(&self, identifier: &str, category: &str) -> String {
        CounterKey::new(category, identifier).to_store_key(&self.options.key_prefix)
    }

    /// Count one request against `(category, identifier)` and decide whether
    /// it may proceed.
    pub async fn is_allowed(&self, identifier: &str, category: &str) -> Result<Decision> {
        self.is_allowed_until(identifier, category, None, futures::future::pending())
            .await
    }

    /// Like [`RateLimiter::is_allowed`], giving up on the store at `deadline`.
    pub async fn is_allowed_within(
        &self,
        identifier: &str,
        category: &str,
        deadline: Instant,
    ) -> Result<Decision> {
        self.is_allowed_until(identifier, category, Some(deadline), futures::future::pending())
            .await
    }

    /// Count one request, giving up on the store at `deadline` or as soon as
    /// `cancelled` resolves.
    ///
    /// The store call is always bounded by the configured store timeout as
    /// well. Whenever no count comes back (store error, timeout,
    /// cancellation) the class's failure policy decides. The only error
    /// returned is [`RatekeeperError::InvalidIdentifier`].
    pub async fn is_allowed_until<F>(
        &self,
        identifier: &str,
        category: &str,
        deadline: Option<Instant>,
        cancelled: F,
    ) -> Result<Decision>
    where
        F: Future<Output = ()>,
    {
        validate_identifier(identifier)?;

        let resolution = self.registry.resolve(category);
        let class = resolution.class;
        let limit = class.requests_per_window;
        let reset_at = reset_at(Utc::now(), class.window);

        if resolution.fallback {
            trace!(
                category = %category,
                class = %resolution.class_name,
                "Unknown category, using default class"
            );
        }

        let key = self.store_key(identifier, category);
        trace!(key = %key, limit = limit, "Checking rate limit");

        let batch = Batch::new()
            .increment(key.as_str())
            .expire(key.as_str(), class.window, self.options.window_mode.expire_mode());

        let count = self
            .call_store(self.store.execute(batch), deadline, cancelled)
            .await
            .and_then(|replies| {
                replies.first().and_then(|reply| reply.as_count()).ok_or_else(|| {
                    Interrupted::Store(StoreError::UnexpectedReply(format!(
                        "increment produced {:?}",
                        replies.first()
                    )))
                })
            });

        let decision = match count {
            Ok(count) => {
                let decision = Decision::from_count(count, limit, reset_at, resolution.class_name);
                if !decision.allowed {
                    debug!(key = %key, count = count, limit = limit, "Rate limit exceeded");
                }
                decision
            }
            Err(reason) => {
                let policy = class.on_store_error.unwrap_or(self.options.failure_policy);
                debug!(
                    key = %key,
                    reason = %reason,
                    policy = ?policy,
                    "Counter store gave no answer, applying failure policy"
                );
                Decision::degraded(policy, limit, reset_at, resolution.class_name)
            }
        };

        Ok(decision)
    }

    /// Delete the counter for `(category, identifier)`.
    ///
    /// Deleting a bucket that does not exist succeeds.
    pub async fn reset(&self, identifier: &str, category: &str) -> Result<()> {
        validate_identifier(identifier)?;
        let key = self.store_key(identifier, category);

        self.admin_call(self.store.delete(&key)).await?;
        debug!(key = %key, "Rate limit counter reset");
        Ok(())
    }

    /// Read the counter for `(category, identifier)` without changing it.
    ///
    /// A bucket with no record in the store has a count of zero.
    pub async fn get_count(&self, identifier: &str, category: &str) -> Result<u64> {
        validate_identifier(identifier)?;
        let key = self.store_key(identifier, category);

        let count = self.admin_call(self.store.get(&key)).await?;
        Ok(count.unwrap_or(0))
    }

    fn budget(&self, deadline: Option<Instant>) -> Duration {
        let budget = self.options.store_timeout;
        match deadline {
            Some(deadline) => budget.min(deadline.saturating_duration_since(Instant::now())),
            None => budget,
        }
    }

    async fn call_store<T, S, F>(
        &self,
        call: S,
        deadline: Option<Instant>,
        cancelled: F,
    ) -> std::result::Result<T, Interrupted>
    where
        S: Future<Output = StoreResult<T>>,
        F: Future<Output = ()>,
    {
        let budget = self.budget(deadline);

        tokio::select! {
            biased;
            _ = cancelled => Err(Interrupted::Cancelled),
            result = tokio::time::timeout(budget, call) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(Interrupted::Store(err)),
                Err(_) => Err(Interrupted::Timeout(budget)),
            },
        }
    }

    async fn admin_call<T, S>(&self, call: S) -> Result<T>
    where
        S: Future<Output = StoreResult<T>>,
    {
        let budget = self.options.store_timeout;
        match tokio::time::timeout(budget, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RatekeeperError::Timeout(budget)),
        }
    }
}

fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(RatekeeperError::InvalidIdentifier);
    }
    Ok(())
}

fn reset_at(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_add_signed(window))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn is_allowed(&self, identifier: &str, category: &str) -> Result<Decision> {
        RateLimiter::is_allowed(self, identifier, category).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::classes::LimitClass;
    use crate::store::{ExpireMode, MemoryStore, Reply};

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn increment(&self, _key: &str) -> StoreResult<u64> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn expire(&self, _key: &str, _ttl: Duration, _mode: ExpireMode) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn execute(&self, _batch: Batch) -> StoreResult<Vec<Reply>> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn get(&self, _key: &str) -> StoreResult<Option<u64>> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        fn backend(&self) -> &'static str {
            "failing"
        }
    }

    fn sensitive_registry() -> LimitRegistry {
        LimitRegistry::new(
            "sensitive",
            [("sensitive", LimitClass::new(5, Duration::from_secs(60)))],
        )
        .unwrap()
    }

    fn memory_limiter(registry: LimitRegistry) -> (RateLimiter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (RateLimiter::new(store.clone(), registry), store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensitive_walkthrough() {
        let (limiter, _) = memory_limiter(sensitive_registry());

        for expected_remaining in [4, 3, 2, 1, 0] {
            let decision = limiter.is_allowed("user-42", "sensitive").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.limit, 5);
        }

        let decision = limiter.is_allowed("user-42", "sensitive").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);

        tokio::time::advance(Duration::from_secs(61)).await;

        let decision = limiter.is_allowed("user-42", "sensitive").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(limiter.get_count("user-42", "sensitive").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reset_at_is_one_window_ahead() {
        let (limiter, _) = memory_limiter(sensitive_registry());

        let before = Utc::now();
        let decision = limiter.is_allowed("user-42", "sensitive").await.unwrap();
        let after = Utc::now();

        assert!(decision.reset_at >= before + chrono::Duration::seconds(60));
        assert!(decision.reset_at <= after + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_empty_identifier_rejected() {
        let (limiter, _) = memory_limiter(LimitRegistry::default());

        let err = limiter.is_allowed("", "public").await.unwrap_err();
        assert!(matches!(err, RatekeeperError::InvalidIdentifier));
        assert!(matches!(
            limiter.reset("", "public").await,
            Err(RatekeeperError::InvalidIdentifier)
        ));
        assert!(matches!(
            limiter.get_count("", "public").await,
            Err(RatekeeperError::InvalidIdentifier)
        ));
    }

    #[tokio::test]
    async fn test_unknown_category_uses_default_class() {
        let (limiter, _) = memory_limiter(LimitRegistry::default());

        let decision = limiter.is_allowed("10.0.0.1", "mystery").await.unwrap();

        assert_eq!(decision.class, "protected");
        assert_eq!(decision.limit, 60);
        assert_eq!(decision.remaining, 59);
    }

    #[tokio::test]
    async fn test_categories_have_separate_counters() {
        let (limiter, _) = memory_limiter(LimitRegistry::default());

        for _ in 0..3 {
            limiter.is_allowed("10.0.0.1", "public").await.unwrap();
        }
        limiter.is_allowed("10.0.0.1", "health").await.unwrap();

        assert_eq!(limiter.get_count("10.0.0.1", "public").await.unwrap(), 3);
        assert_eq!(limiter.get_count("10.0.0.1", "health").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_count_never_used_is_zero() {
        let (limiter, _) = memory_limiter(LimitRegistry::default());
        assert_eq!(limiter.get_count("nobody", "public").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_restores_first_use() {
        let (limiter, _) = memory_limiter(sensitive_registry());

        for _ in 0..7 {
            limiter.is_allowed("user-42", "sensitive").await.unwrap();
        }
        limiter.reset("user-42", "sensitive").await.unwrap();
        limiter.reset("user-42", "sensitive").await.unwrap();

        let decision = limiter.is_allowed("user-42", "sensitive").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(limiter.get_count("user-42", "sensitive").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_window_refreshes_ttl() {
        let (limiter, store) = memory_limiter(sensitive_registry());
        let key = limiter.store_key("user-42", "sensitive");

        limiter.is_allowed("user-42", "sensitive").await.unwrap();
        tokio::time::advance(Duration::from_secs(40)).await;
        limiter.is_allowed("user-42", "sensitive").await.unwrap();

        assert_eq!(store.ttl(&key), Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(limiter.get_count("user-42", "sensitive").await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_keeps_first_expiry() {
        let store = Arc::new(MemoryStore::new());
        let options = LimiterOptions {
            window_mode: WindowMode::Fixed,
            ..LimiterOptions::default()
        };
        let limiter = RateLimiter::with_options(store.clone(), sensitive_registry(), options);
        let key = limiter.store_key("user-42", "sensitive");

        limiter.is_allowed("user-42", "sensitive").await.unwrap();
        tokio::time::advance(Duration::from_secs(40)).await;
        limiter.is_allowed("user-42", "sensitive").await.unwrap();

        assert_eq!(store.ttl(&key), Some(Duration::from_secs(20)));

        tokio::time::advance(Duration::from_secs(20)).await;
        let decision = limiter.is_allowed("user-42", "sensitive").await.unwrap();
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open_by_default() {
        let limiter = RateLimiter::new(Arc::new(FailingStore), sensitive_registry());

        for _ in 0..10 {
            let decision = limiter.is_allowed("user-42", "sensitive").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 5);
            assert!(decision.degraded);
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed_when_configured() {
        let options = LimiterOptions {
            failure_policy: FailurePolicy::Closed,
            ..LimiterOptions::default()
        };
        let limiter =
            RateLimiter::with_options(Arc::new(FailingStore), sensitive_registry(), options);

        let decision = limiter.is_allowed("user-42", "sensitive").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.degraded);
    }

    #[tokio::test]
    async fn test_class_policy_overrides_limiter_policy() {
        let registry = LimitRegistry::new(
            "open",
            [
                ("open", LimitClass::new(10, Duration::from_secs(60))),
                (
                    "login",
                    LimitClass::new(3, Duration::from_secs(60))
                        .with_failure_policy(FailurePolicy::Closed),
                ),
            ],
        )
        .unwrap();
        let limiter = RateLimiter::new(Arc::new(FailingStore), registry);

        assert!(limiter.is_allowed("u", "open").await.unwrap().allowed);
        assert!(!limiter.is_allowed("u", "login").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_admin_operations_propagate_store_errors() {
        let limiter = RateLimiter::new(Arc::new(FailingStore), sensitive_registry());

        assert!(matches!(
            limiter.reset("user-42", "sensitive").await,
            Err(RatekeeperError::Store(StoreError::Unavailable(_)))
        ));
        assert!(matches!(
            limiter.get_count("user-42", "sensitive").await,
            Err(RatekeeperError::Store(StoreError::Unavailable(_)))
        ));
    }

    #[test]
    fn test_store_key_uses_prefix() {
        let options = LimiterOptions {
            key_prefix: "svc".to_string(),
            ..LimiterOptions::default()
        };
        let limiter = RateLimiter::with_options(
            Arc::new(MemoryStore::new()),
            LimitRegistry::default(),
            options,
        );

        assert_eq!(limiter.store_key("1.2.3.4", "public"), "svc:6:public:1.2.3.4");
    }

    #[test]
    fn test_reset_at_saturates() {
        let now = Utc::now();
        assert_eq!(reset_at(now, Duration::from_secs(u64::MAX)), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_window_counts_without_expiry() {
        let yaml = r#"
default_class: forever
classes:
  forever:
    requests_per_window: 2
    window: 18446744073709551615
"#;
        let (limiter, store) = memory_limiter(LimitRegistry::from_yaml(yaml).unwrap());

        for _ in 0..3 {
            limiter.is_allowed("caller", "forever").await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(86_400)).await;

        let decision = limiter.is_allowed("caller", "forever").await.unwrap();
        assert!(!decision.allowed);
        assert!(!decision.degraded);
        assert_eq!(decision.reset_at, DateTime::<Utc>::MAX_UTC);
        assert_eq!(store.ttl(&limiter.store_key("caller", "forever")), None);
    }
}
