//! Session-wide tool-call counter over a sliding window.
//!
//! Keyed by the history session key. The window is a fixed 3600 s slide by
//! default rather than wall-clock hour boundaries, so the cap cannot be
//! doubled by straddling an hour mark.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct SessionToolCounter {
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SessionToolCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record one executed tool call against the session.
    pub fn record(&self, key: &str) {
        let mut hits = self.hits.lock();
        hits.entry(key.to_owned()).or_default().push_back(Instant::now());
    }

    /// Tool calls in the current window. Prunes aged-out hits.
    pub fn count(&self, key: &str) -> u32 {
        let now = Instant::now();
        let mut hits = self.hits.lock();
        let Some(queue) = hits.get_mut(key) else {
            return 0;
        };
        while let Some(oldest) = queue.front() {
            if now.duration_since(*oldest) >= self.window {
                queue.pop_front();
            } else {
                break;
            }
        }
        if queue.is_empty() {
            hits.remove(key);
            return 0;
        }
        queue.len() as u32
    }
}
