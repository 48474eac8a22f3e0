//! Limit class registry.
//!
//! A limit class names a quota (`requests_per_window` per `window`). The
//! registry is built once, validated, and handed to the limiter; it never
//! changes afterwards. Categories that do not name a class resolve to the
//! registry's default class, and the resolution says so.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::decision::FailurePolicy;
use super::window::{TimeUnit, WindowSpec};
use crate::error::{RatekeeperError, Result};

/// Name of the class unknown categories fall back to in the built-in registry.
pub const DEFAULT_CLASS: &str = "protected";

/// A validated quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitClass {
    /// Requests allowed per window
    pub requests_per_window: u64,
    /// Window length
    pub window: Duration,
    /// Overrides the limiter's failure policy for this class
    pub on_store_error: Option<FailurePolicy>,
}

impl LimitClass {
    pub fn new(requests_per_window: u64, window: Duration) -> Self {
        Self {
            requests_per_window,
            window,
            on_store_error: None,
        }
    }

    /// Pin the failure policy for this class.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_store_error = Some(policy);
        self
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.requests_per_window == 0 {
            return Err(RatekeeperError::Config(format!(
                "limit class '{}': requests_per_window must be greater than zero",
                name
            )));
        }
        if self.window.is_zero() {
            return Err(RatekeeperError::Config(format!(
                "limit class '{}': window must be greater than zero",
                name
            )));
        }
        Ok(())
    }
}

/// A limit class as written in a rule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitClassConfig {
    /// Number of requests allowed per window
    pub requests_per_window: u64,
    /// Window length, a unit name or a number of seconds
    pub window: WindowSpec,
    /// Optional failure policy override
    #[serde(default)]
    pub on_store_error: Option<FailurePolicy>,
}

impl From<&LimitClassConfig> for LimitClass {
    fn from(config: &LimitClassConfig) -> Self {
        Self {
            requests_per_window: config.requests_per_window,
            window: config.window.duration(),
            on_store_error: config.on_store_error,
        }
    }
}

/// A complete rule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Class used for categories that name no class
    #[serde(default = "default_class_name")]
    pub default_class: String,
    /// Map of class name to class configuration
    #[serde(default)]
    pub classes: BTreeMap<String, LimitClassConfig>,
}

fn default_class_name() -> String {
    DEFAULT_CLASS.to_string()
}

/// The outcome of resolving a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution<'a> {
    /// Name of the class that applies
    pub class_name: &'a str,
    /// The class that applies
    pub class: &'a LimitClass,
    /// True when the category was unknown and the default class was used
    pub fallback: bool,
}

/// An immutable mapping from category name to limit class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitRegistry {
    classes: HashMap<String, LimitClass>,
    default_class: String,
}

impl LimitRegistry {
    /// Build a registry, validating every class and the default.
    pub fn new<I, S>(default_class: &str, classes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, LimitClass)>,
        S: Into<String>,
    {
        let classes: HashMap<String, LimitClass> =
            classes.into_iter().map(|(name, class)| (name.into(), class)).collect();

        for (name, class) in &classes {
            class.validate(name)?;
        }

        if !classes.contains_key(default_class) {
            return Err(RatekeeperError::Config(format!(
                "default class '{}' is not defined",
                default_class
            )));
        }

        Ok(Self {
            classes,
            default_class: default_class.to_string(),
        })
    }

    /// Build a registry from a parsed rule file.
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        Self::new(
            &config.default_class,
            config
                .classes
                .iter()
                .map(|(name, class)| (name.clone(), LimitClass::from(class))),
        )
    }

    /// Load a registry from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RegistryConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RatekeeperError::Config(format!("Failed to parse limit classes: {}", e)))?;
        Self::from_config(&config)
    }

    /// Load a registry from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit classes");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Resolve `category`, falling back to the default class when unknown.
    pub fn resolve(&self, category: &str) -> Resolution<'_> {
        if let Some((name, class)) = self.classes.get_key_value(category) {
            return Resolution {
                class_name: name,
                class,
                fallback: false,
            };
        }

        Resolution {
            class_name: &self.default_class,
            class: &self.classes[&self.default_class],
            fallback: true,
        }
    }

    /// Look up a class by exact name.
    pub fn get(&self, name: &str) -> Option<&LimitClass> {
        self.classes.get(name)
    }

    /// Name of the fallback class.
    pub fn default_class(&self) -> &str {
        &self.default_class
    }

    /// All classes, ordered by name.
    pub fn classes(&self) -> Vec<(&str, &LimitClass)> {
        let mut classes: Vec<_> = self.classes.iter().map(|(k, v)| (k.as_str(), v)).collect();
        classes.sort_by_key(|(name, _)| *name);
        classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl Default for LimitRegistry {
    /// The stock endpoint classes, all per minute, defaulting to `protected`.
    fn default() -> Self {
        let minute = TimeUnit::Minute.duration();
        let classes = [
            ("public", LimitClass::new(30, minute)),
            ("protected", LimitClass::new(60, minute)),
            ("health", LimitClass::new(120, minute)),
            ("metrics", LimitClass::new(180, minute)),
            ("sensitive", LimitClass::new(5, minute)),
        ];

        Self {
            classes: classes
                .into_iter()
                .map(|(name, class)| (name.to_string(), class))
                .collect(),
            default_class: DEFAULT_CLASS.to_string(),
        }
    }
}
