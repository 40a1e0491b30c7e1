//! Submission-rate enforcement. The concurrency half of the quota (one
//! active job per principal) lives inside the store's admission
//! transaction; this module owns the sliding rate windows.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{GridqError, Result};

/// Per-principal sliding window: at most `max_events` in any rolling
/// `window`. A slot is consumed on every successful check.
pub struct RateLimiter {
    max_events: usize,
    window: Duration,
    entries: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            max_events,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, principal: &str) -> Result<()> {
        let mut entries = lock(&self.entries)?;
        let ring = entries.entry(principal.to_string()).or_default();
        let now = Instant::now();
        evict(ring, now, self.window);
        if ring.len() >= self.max_events {
            let retry_after = retry_after(ring, now, self.window);
            return Err(GridqError::RateLimited { retry_after });
        }
        ring.push_back(now);
        Ok(())
    }

    pub fn current_count(&self, principal: &str) -> usize {
        let mut entries = match lock(&self.entries) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let now = Instant::now();
        entries
            .get_mut(principal)
            .map(|ring| {
                evict(ring, now, self.window);
                ring.len()
            })
            .unwrap_or(0)
    }
}

/// Coarse per-client request guard for the read endpoints, with limits
/// chosen per call site.
#[derive(Default)]
pub struct EndpointGuard {
    entries: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl EndpointGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, identifier: &str, max_events: usize, window: Duration) -> Result<()> {
        let mut entries = lock(&self.entries)?;
        let ring = entries.entry(identifier.to_string()).or_default();
        let now = Instant::now();
        evict(ring, now, window);
        if ring.len() >= max_events {
            let retry_after = retry_after(ring, now, window);
            return Err(GridqError::RateLimited { retry_after });
        }
        ring.push_back(now);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| GridqError::Storage(format!("rate window lock poisoned: {e}")))
}

fn evict(ring: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = ring.front() {
        if now.duration_since(*oldest) > window {
            ring.pop_front();
        } else {
            break;
        }
    }
}

fn retry_after(ring: &VecDeque<Instant>, now: Instant, window: Duration) -> u64 {
    ring.front()
        .map(|oldest| {
            let elapsed = now.duration_since(*oldest);
            window.saturating_sub(elapsed).as_secs() + 1
        })
        .unwrap_or(1)
}
