//! Per-client request rate limiting
//!
//! The pipeline only sees the [`RateLimiter`] trait, so a single process can
//! use the in-memory counter while a multi-instance deployment plugs in a
//! shared store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Length of one counting window
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Tracked clients above which expired windows are pruned
const PRUNE_THRESHOLD: usize = 4_000;

/// Outcome of one rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Time until the current window resets; zero when allowed
    pub retry_after: Duration,
}

impl RateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    pub fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// Counts requests per client key
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record one request for `key` and report whether it may proceed
    async fn check_and_increment(&self, key: &str) -> RateDecision;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window limiter backed by an in-process map
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl InMemoryRateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self::with_window(limit_per_minute, RATE_WINDOW)
    }

    pub fn with_window(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Number of clients currently tracked
    pub async fn tracked_clients(&self) -> usize {
        self.windows.lock().await.len()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check_and_increment(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        if windows.len() > PRUNE_THRESHOLD {
            let before = windows.len();
            windows.retain(|_, w| now.duration_since(w.started) < self.window);
            debug!("Pruned {} expired rate-limit windows", before - windows.len());
        }

        let entry = windows.entry(key.to_string()).or_insert(Window { started: now, count: 0 });
        let elapsed = now.duration_since(entry.started);
        if elapsed >= self.window {
            *entry = Window { started: now, count: 0 };
        }

        if entry.count >= self.limit {
            let retry_after = self.window.saturating_sub(now.duration_since(entry.started));
            return RateDecision::deny(retry_after);
        }

        entry.count += 1;
        RateDecision::allow()
    }
}
