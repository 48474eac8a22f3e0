//! Configuration management for Ratekeeper.
//!
//! Settings come from an optional YAML file, overridden by environment
//! variables such as `RATEKEEPER__STORE__REDIS_URL` or
//! `RATEKEEPER__RATE_LIMITING__ON_STORE_ERROR=closed`.

use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::ratelimit::{FailurePolicy, LimitRegistry, LimiterOptions, WindowMode, DEFAULT_KEY_PREFIX};

/// Prefix of the environment variables read by [`RatekeeperConfig::load`].
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for the Ratekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; when unset an in-process store is used
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Upper bound on each store round-trip in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Namespace for counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            timeout_ms: default_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the limit class rule file; the built-in classes apply when unset
    #[serde(default)]
    pub classes_path: Option<String>,

    /// Verdict when the store cannot answer
    #[serde(default)]
    pub on_store_error: FailurePolicy,

    /// Rolling or fixed window semantics
    #[serde(default)]
    pub window_mode: WindowMode,
}

impl RatekeeperConfig {
    /// Load configuration from an optional YAML file layered under the
    /// environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(File::new(path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Limiter options derived from this configuration.
    pub fn limiter_options(&self) -> LimiterOptions {
        LimiterOptions {
            failure_policy: self.rate_limiting.on_store_error,
            window_mode: self.rate_limiting.window_mode,
            store_timeout: Duration::from_millis(self.store.timeout_ms),
            key_prefix: self.store.key_prefix.clone(),
        }
    }

    /// The limit class registry: from the rule file when configured, the
    /// built-in classes otherwise.
    pub fn registry(&self) -> Result<LimitRegistry> {
        match &self.rate_limiting.classes_path {
            Some(path) => LimitRegistry::from_file(path),
            None => Ok(LimitRegistry::default()),
        }
    }
}
