//! Sliding-window per-key failure counter with bounded memory: a fixed
//! window and limit per key, with insertion-order/halve-on-overflow
//! eviction once the map grows past its hard capacity.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

struct Entry {
    count: u32,
    window_start: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
    /// Insertion/recency order, oldest first. Refreshed on every touch.
    order: VecDeque<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Ok,
    Throttled { retry_after_ms: u64 },
}

/// Per-key sliding-window failure tracker, bounded at `capacity` entries.
pub struct AuthRateLimiter {
    inner: Mutex<Inner>,
    window: Duration,
    max_failures: u32,
    capacity: usize,
}

impl AuthRateLimiter {
    pub fn new(window: Duration, max_failures: u32, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            window,
            max_failures,
            capacity,
        }
    }

    /// Record a failed attempt for `key`. Returns whether the caller is
    /// currently throttled (in which case this attempt was NOT counted
    /// against the window — it was already over the limit) or whether the
    /// failure was recorded.
    pub async fn record_failure(&self, key: &str, now: Instant) -> RateLimitOutcome {
        let mut inner = self.inner.lock().await;

        if let Some(entry) = inner.entries.get_mut(key) {
            if now.duration_since(entry.window_start) >= self.window {
                entry.window_start = now;
                entry.count = 0;
            }

            if entry.count >= self.max_failures {
                let remaining = self
                    .window
                    .saturating_sub(now.duration_since(entry.window_start));
                touch(&mut inner.order, key);
                return RateLimitOutcome::Throttled {
                    retry_after_ms: remaining.as_millis() as u64,
                };
            }

            entry.count += 1;
            touch(&mut inner.order, key);
            return RateLimitOutcome::Ok;
        }

        inner.entries.insert(
            key.to_string(),
            Entry {
                count: 1,
                window_start: now,
            },
        );
        inner.order.push_back(key.to_string());
        self.evict_if_over_capacity(&mut inner, now);
        RateLimitOutcome::Ok
    }

    /// Reset a key's failure state, e.g. on successful authentication.
    pub async fn clear(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        inner.entries.remove(key);
        inner.order.retain(|k| k != key);
    }

    fn evict_if_over_capacity(&self, inner: &mut Inner, now: Instant) {
        if inner.entries.len() <= self.capacity {
            return;
        }

        // (a) prune every entry whose window has elapsed.
        let window = self.window;
        let entries = &inner.entries;
        inner
            .order
            .retain(|k| entries.get(k).is_some_and(|e| now.duration_since(e.window_start) < window));
        let live: std::collections::HashSet<&String> = inner.order.iter().collect();
        inner.entries.retain(|k, _| live.contains(k));

        // (b) if still over capacity, drop the oldest half in insertion order.
        if inner.entries.len() > self.capacity {
            let drop_count = inner.order.len() / 2;
            for _ in 0..drop_count {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.entries.remove(&oldest);
                }
            }
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

fn touch(order: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        order.remove(pos);
    }
    order.push_back(key.to_string());
}
