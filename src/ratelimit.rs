//! Per-key sliding-window request limiter for bot commands.
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct RateLimiter<K> {
    per_window: usize,
    hits: Mutex<HashMap<K, VecDeque<Instant>>>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    /// Allow `per_minute` requests per key in any 60 second window.
    /// Zero disables limiting.
    pub fn per_minute(per_minute: usize) -> Self {
        Self {
            per_window: per_minute,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request for `key` at `now`. When the window is full the
    /// request is not recorded and the time until a slot frees is returned.
    pub fn check(&self, key: &K, now: Instant) -> Result<(), Duration> {
        if self.per_window == 0 {
            return Ok(());
        }
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        let window = hits.entry(key.clone()).or_default();
        while let Some(&front) = window.front() {
            if now.saturating_duration_since(front) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.per_window {
            let oldest = window.front().copied().unwrap_or(now);
            return Err(WINDOW.saturating_sub(now.saturating_duration_since(oldest)));
        }
        window.push_back(now);
        Ok(())
    }
}
