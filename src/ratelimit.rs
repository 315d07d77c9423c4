//! Fixed-window request counting, a cheap first line of defense for the
//! remote providers.
//!
//! The counter is process-local: in a multi-instance deployment it
//! under-counts real traffic and should be replaced (or backed) by a shared
//! counter with expiry. Expired keys are garbage-collected lazily once the
//! map grows past a threshold.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Map size at which a [`FixedWindowLimiter::check`] call sweeps expired
/// windows before admitting the request.
const GC_THRESHOLD: usize = 1024;

struct WindowSlot {
    started: Instant,
    count: u32,
}

pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<HashMap<String, WindowSlot>>,
}

impl FixedWindowLimiter {
    /// Admits up to `limit` requests per `window` per caller key.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` when the request is admitted, `false` when the caller
    /// key has exhausted its window.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.len() > GC_THRESHOLD {
            let window = self.window;
            state.retain(|_, slot| now.duration_since(slot.started) < window);
        }

        let slot = state.entry(key.to_string()).or_insert(WindowSlot {
            started: now,
            count: 0,
        });
        if now.duration_since(slot.started) >= self.window {
            slot.started = now;
            slot.count = 0;
        }
        if slot.count >= self.limit {
            return false;
        }
        slot.count += 1;
        true
    }

    /// Number of tracked caller keys, including expired ones not yet swept.
    pub fn tracked_keys(&self) -> usize {
        self.state.lock().len()
    }
}
