//! Helpers for request-handling middleware.
//!
//! These are framework-agnostic: callers pass in header pairs and the peer
//! address, and translate a [`Rejection`] into their own response type.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::ratelimit::{Decision, RateLimiterBackend};

/// HTTP status used for over-limit responses.
pub const TOO_MANY_REQUESTS: u16 = 429;

fn header<'a>(headers: &[(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

/// Pick the address a request should be counted against.
///
/// Prefers the first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer's
/// IP address.
pub fn client_identity(headers: &[(&str, &str)], peer: Option<SocketAddr>) -> Option<String> {
    if let Some(forwarded) = header(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|hop| !hop.is_empty()) {
            return Some(first.to_string());
        }
    }

    if let Some(real_ip) = header(headers, "x-real-ip") {
        return Some(real_ip.to_string());
    }

    peer.map(|addr| addr.ip().to_string())
}

/// Informational headers describing a decision.
pub fn rate_limit_headers(decision: &Decision) -> Vec<(&'static str, String)> {
    vec![
        ("X-RateLimit-Limit", decision.limit.to_string()),
        ("X-RateLimit-Remaining", decision.remaining.to_string()),
        ("X-RateLimit-Reset", decision.reset_at.timestamp().to_string()),
    ]
}

/// JSON body of an over-limit response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionBody {
    pub error: &'static str,
    pub message: &'static str,
    /// Unix timestamp at which the window is expected to reset
    pub reset: i64,
}

/// An over-limit response ready to be rendered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: RejectionBody,
}

impl Rejection {
    /// Build the response for a denied decision, as seen at `now`.
    pub fn from_decision(decision: &Decision, now: DateTime<Utc>) -> Self {
        let retry_after = decision.retry_after(now);
        // Round up so clients never retry before the reset.
        let retry_secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);

        let mut headers = vec![("Retry-After", retry_secs.to_string())];
        headers.extend(rate_limit_headers(decision));

        Self {
            status: TOO_MANY_REQUESTS,
            headers,
            body: RejectionBody {
                error: "Too Many Requests",
                message: "Rate limit exceeded. Please try again later.",
                reset: decision.reset_at.timestamp(),
            },
        }
    }

    /// The body serialized as JSON.
    pub fn body_json(&self) -> String {
        serde_json::to_string(&self.body).unwrap_or_default()
    }
}

/// What the middleware knows about an inbound request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestInfo<'a> {
    pub path: &'a str,
    pub headers: &'a [(&'a str, &'a str)],
    pub peer: Option<SocketAddr>,
    /// Authenticated user, when an upstream layer has established one
    pub user_id: Option<&'a str>,
}

/// The middleware's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Continue to the handler; the decision carries headers to attach.
    Proceed(Decision),
    /// Stop and send this response.
    Reject(Box<Rejection>),
}

/// Applies one limit category to every request it sees.
pub struct RateLimitGuard<R: RateLimiterBackend> {
    limiter: Arc<R>,
    category: String,
}

impl<R: RateLimiterBackend> RateLimitGuard<R> {
    pub fn new(limiter: Arc<R>, category: impl Into<String>) -> Self {
        Self {
            limiter,
            category: category.into(),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Rule on a request, counting it against the authenticated user when
    /// there is one and against the client address otherwise.
    pub async fn check(&self, request: &RequestInfo<'_>) -> Result<Verdict> {
        let identifier = match request.user_id.filter(|id| !id.is_empty()) {
            Some(user_id) => user_id.to_string(),
            None => client_identity(request.headers, request.peer).unwrap_or_default(),
        };

        let decision = self.limiter.is_allowed(&identifier, &self.category).await?;

        if decision.degraded {
            warn!(
                identifier = %identifier,
                category = %self.category,
                allowed = decision.allowed,
                "Failed to check rate limit, applied failure policy"
            );
        }

        if decision.allowed {
            return Ok(Verdict::Proceed(decision));
        }

        warn!(
            identifier = %identifier,
            category = %self.category,
            path = %request.path,
            "Rate limit exceeded"
        );

        Ok(Verdict::Reject(Box::new(Rejection::from_decision(
            &decision,
            Utc::now(),
        ))))
    }
}
