//! Ratekeeper - Distributed Request Rate Limiting
//!
//! This crate decides, per caller identity and endpoint category, whether a
//! request may proceed. Many stateless service instances share one atomic
//! counter store (Redis, or an in-process store for single-instance use), so
//! every instance sees the same count for a bucket.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod store;
