// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token-bucket rate limiting
//!
//! A [`RateLimiter`] is a named, prefixed bucket (`points` per `duration`)
//! over a pluggable [`RateLimiterStore`]. Requests are keyed by a caller
//! supplied `calc_key` (by default the client IP taken from proxy headers)
//! and consume a caller-supplied number of points (default 1). Several
//! limiters can apply to one request; [`consume_all`] evaluates them
//! concurrently and reports the tightest result, which is what response
//! headers advertise.
//!
//! Store failures fail open by default: the limiter logs and lets the
//! request through rather than turning a storage outage into an outage of
//! the service itself. `fail_closed` flips that.

mod limiter;
mod store;

pub use limiter::{
    consume_all, tightest, CalcKey, CalcPoints, ConsumeOpts, LimiterContext, RateLimitDecision,
    RateLimitOutcome, RateLimiter, RateLimiterStatus,
};
pub use store::{MemoryStore, RateLimiterStore, StoreCounts, StoreError};
