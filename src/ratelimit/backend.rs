//! Rate limiter trait used by request-handling middleware.

use async_trait::async_trait;

use super::decision::Decision;
use crate::error::Result;

/// Trait for anything that can rule on a request.
///
/// Middleware is written against this trait rather than [`super::RateLimiter`]
/// so it can be exercised with scripted decisions.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Count one request for `(category, identifier)` and return the verdict.
    async fn is_allowed(&self, identifier: &str, category: &str) -> Result<Decision>;
}
