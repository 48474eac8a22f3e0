//! Counter key derivation.

/// Namespace prepended to every counter key unless configured otherwise.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// The store key of one `(category, identifier)` bucket.
///
/// The category is length-prefixed, so the encoding is injective: identifier
/// `"a:b"` under category `"x"` and identifier `"b"` under category `"x:a"`
/// produce different keys. Format:
/// `{prefix}:{byte length of category}:{category}:{identifier}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The limit category
    pub category: String,
    /// The caller identity (IP, user id, API key, ...)
    pub identifier: String,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(category: &str, identifier: &str) -> Self {
        Self {
            category: category.to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// Encode as a store key under `prefix`.
    pub fn to_store_key(&self, prefix: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            prefix,
            self.category.len(),
            self.category,
            self.identifier
        )
    }
}
