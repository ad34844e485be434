// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use tracing::warn;

use crate::store::{RateLimiterStore, StoreError};

/// The per-request view a limiter keys off.
pub struct LimiterContext<'a> {
    pub headers: &'a HeaderMap,
    /// The resolved method NSID, when known ("" in the catch-all before
    /// resolution).
    pub nsid: &'a str,
}

/// A snapshot of one bucket after a consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStatus {
    pub limit: u32,
    pub duration: Duration,
    pub remaining_points: u32,
    pub ms_before_next: u64,
    pub consumed_points: u32,
    pub is_first_in_duration: bool,
}

/// Result of consulting one limiter for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Proceed(RateLimiterStatus),
    Exceeded(RateLimiterStatus),
    /// The limiter declined to apply (keyless request, zero points, or a
    /// store failure under the fail-open policy).
    Skipped,
}

pub type CalcKey = Arc<dyn Fn(&LimiterContext<'_>) -> Option<String> + Send + Sync>;
pub type CalcPoints = Arc<dyn Fn(&LimiterContext<'_>) -> u32 + Send + Sync>;

/// One named token bucket.
pub struct RateLimiter {
    key_prefix: String,
    duration: Duration,
    points: u32,
    calc_key: Option<CalcKey>,
    calc_points: Option<CalcPoints>,
    fail_closed: bool,
    store: Arc<dyn RateLimiterStore>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimiterStore>,
        key_prefix: impl Into<String>,
        duration: Duration,
        points: u32,
    ) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            duration,
            points,
            calc_key: None,
            calc_points: None,
            fail_closed: false,
            store,
        }
    }

    /// Override how the per-request key is derived. Returning `None` skips
    /// this limiter for the request.
    pub fn with_calc_key(mut self, calc_key: CalcKey) -> Self {
        self.calc_key = Some(calc_key);
        self
    }

    /// Override how many points a request consumes. Returning `0` skips
    /// this limiter for the request.
    pub fn with_calc_points(mut self, calc_points: CalcPoints) -> Self {
        self.calc_points = Some(calc_points);
        self
    }

    /// Propagate store failures instead of failing open.
    pub fn fail_closed(mut self) -> Self {
        self.fail_closed = true;
        self
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn request_key(&self, ctx: &LimiterContext<'_>, opts: &ConsumeOpts) -> Option<String> {
        match opts.calc_key.as_ref().or(self.calc_key.as_ref()) {
            Some(calc_key) => calc_key(ctx),
            None => Some(client_ip(ctx.headers)),
        }
    }

    /// Consume points for this request and report the bucket state.
    ///
    /// `opts` may override the limiter's own key/points derivation for this
    /// call (a route sharing a named limiter can still key it differently).
    pub async fn consume(
        &self,
        ctx: &LimiterContext<'_>,
        opts: &ConsumeOpts,
    ) -> Result<RateLimitOutcome, StoreError> {
        let Some(key) = self.request_key(ctx, opts) else {
            return Ok(RateLimitOutcome::Skipped);
        };
        let points = match opts.calc_points.as_ref().or(self.calc_points.as_ref()) {
            Some(calc_points) => calc_points(ctx),
            None => 1,
        };
        if points == 0 {
            return Ok(RateLimitOutcome::Skipped);
        }

        let store_key = format!("{}:{key}", self.key_prefix);
        let counts = match self.store.consume(&store_key, points, self.duration).await {
            Ok(counts) => counts,
            Err(err) if !self.fail_closed => {
                warn!("rate limiter {:?} store failure (failing open): {err}", self.key_prefix);
                return Ok(RateLimitOutcome::Skipped);
            }
            Err(err) => return Err(err),
        };

        let status = RateLimiterStatus {
            limit: self.points,
            duration: self.duration,
            remaining_points: self.points.saturating_sub(counts.consumed_points),
            ms_before_next: counts.ms_before_next,
            consumed_points: counts.consumed_points.min(self.points),
            is_first_in_duration: counts.is_first_in_duration,
        };
        if counts.consumed_points > self.points {
            Ok(RateLimitOutcome::Exceeded(status))
        } else {
            Ok(RateLimitOutcome::Proceed(status))
        }
    }

    /// Clear this limiter's counter for the request's key.
    pub async fn reset(
        &self,
        ctx: &LimiterContext<'_>,
        opts: &ConsumeOpts,
    ) -> Result<(), StoreError> {
        let Some(key) = self.request_key(ctx, opts) else {
            return Ok(());
        };
        let store_key = format!("{}:{key}", self.key_prefix);
        self.store.reset(&store_key).await
    }
}

/// Per-call overrides for [`RateLimiter::consume`] and
/// [`RateLimiter::reset`].
#[derive(Clone, Default)]
pub struct ConsumeOpts {
    pub calc_key: Option<CalcKey>,
    pub calc_points: Option<CalcPoints>,
}

/// Default request key: client IP as reported by proxy headers.
fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real_ip.trim().to_owned();
    }
    "unknown".to_owned()
}

/// The aggregate decision across every limiter that applied to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// `None` when every limiter skipped.
    Allowed(Option<RateLimiterStatus>),
    Exceeded(RateLimiterStatus),
}

/// Pick the tightest of several outcomes: any exceeded bucket wins, then
/// the bucket with the fewest remaining points.
pub fn tightest(outcomes: impl IntoIterator<Item = RateLimitOutcome>) -> RateLimitDecision {
    let mut best: Option<RateLimiterStatus> = None;
    for outcome in outcomes {
        match outcome {
            RateLimitOutcome::Exceeded(status) => return RateLimitDecision::Exceeded(status),
            RateLimitOutcome::Proceed(status) => match &best {
                Some(current) if current.remaining_points <= status.remaining_points => {}
                _ => best = Some(status),
            },
            RateLimitOutcome::Skipped => {}
        }
    }
    RateLimitDecision::Allowed(best)
}

/// Evaluate all `limiters` concurrently and aggregate with [`tightest`].
pub async fn consume_all<'a>(
    limiters: impl IntoIterator<Item = (&'a RateLimiter, &'a ConsumeOpts)>,
    ctx: &LimiterContext<'_>,
) -> Result<RateLimitDecision, StoreError> {
    let outcomes = futures::future::try_join_all(
        limiters
            .into_iter()
            .map(|(limiter, opts)| limiter.consume(ctx, opts)),
    )
    .await?;
    Ok(tightest(outcomes))
}
