// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Counter storage behind rate limiters

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Counter state after a consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCounts {
    /// Total points recorded in the current window, including this consume.
    pub consumed_points: u32,
    /// Milliseconds until the current window expires.
    pub ms_before_next: u64,
    /// Whether this consume opened the window.
    pub is_first_in_duration: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("rate limit store: {0}")]
pub struct StoreError(pub anyhow::Error);

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

/// Keyed, expiring counters.
///
/// Implementations must be safe for concurrent readers and writers; remote
/// stores surface their failures as [`StoreError`] and leave the fail-open
/// decision to the limiter.
#[async_trait]
pub trait RateLimiterStore: Send + Sync {
    /// Add `points` to the counter at `key`, opening a fresh window of
    /// `duration` if none is active.
    async fn consume(
        &self,
        key: &str,
        points: u32,
        duration: Duration,
    ) -> Result<StoreCounts, StoreError>;

    /// Drop the counter at `key`.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;
}

struct Window {
    consumed: u32,
    expires_at: Instant,
}

/// Process-local counter store.
#[derive(Default)]
pub struct MemoryStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimiterStore for MemoryStore {
    async fn consume(
        &self,
        key: &str,
        points: u32,
        duration: Duration,
    ) -> Result<StoreCounts, StoreError> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(key.to_owned()).or_insert(Window {
            consumed: 0,
            expires_at: now + duration,
        });
        let is_first = if window.expires_at <= now {
            // previous window lapsed; start over
            window.consumed = 0;
            window.expires_at = now + duration;
            true
        } else {
            window.consumed == 0
        };
        window.consumed = window.consumed.saturating_add(points);
        Ok(StoreCounts {
            consumed_points: window.consumed,
            ms_before_next: window.expires_at.saturating_duration_since(now).as_millis() as u64,
            is_first_in_duration: is_first,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.windows.lock().unwrap().remove(key);
        Ok(())
    }
}
