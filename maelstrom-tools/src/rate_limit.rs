//! Per-minute rate limiting for tool calls.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Length of a rate limit window.
pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Window {
    start: Option<Instant>,
    count: u32,
}

/// Counts calls in a window that resets once a minute has passed since it
/// started.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            window: Mutex::new(Window {
                start: None,
                count: 0,
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Takes a slot at the given instant, if one is free.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut window = self.window.lock();
        match window.start {
            Some(start) if now.saturating_duration_since(start) < WINDOW => {}
            _ => {
                window.start = Some(now);
                window.count = 0;
            }
        }

        if window.count >= self.limit {
            return false;
        }
        window.count += 1;
        true
    }
}

/// Limiters shared process-wide, one per (tool, limit) pair.
#[derive(Debug, Default)]
pub struct RateLimiters {
    limiters: DashMap<(String, u32), Arc<RateLimiter>>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tool: &str, limit: u32) -> Arc<RateLimiter> {
        self.limiters
            .entry((tool.to_string(), limit))
            .or_insert_with(|| Arc::new(RateLimiter::new(limit)))
            .clone()
    }
}
