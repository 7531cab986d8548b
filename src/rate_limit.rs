//! Token bucket rate limiting, one bucket per source IP.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Entries idle longer than this are swept by the janitor.
pub const LIMITER_EVICTION_AGE: Duration = Duration::from_secs(5 * 60);

/// How often the janitor sweeps the limiter map.
pub const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(3 * 60);

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    burst: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self { tokens: burst, burst, rate_per_sec, last_refill: Instant::now() }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
        self.last_refill = now;
    }

    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    fn try_consume_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }
}

#[derive(Debug)]
struct SourceEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Per-source-IP limiter map.
///
/// Buckets are created on first contact with the configured rate and burst
/// and swept once idle for [`LIMITER_EVICTION_AGE`], so the map stays
/// bounded by the number of distinct sources seen in that window.
pub struct SourceLimiter {
    rate_per_sec: f64,
    burst: f64,
    entries: Mutex<HashMap<String, SourceEntry>>,
}

impl SourceLimiter {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self { rate_per_sec, burst, entries: Mutex::new(HashMap::new()) }
    }

    /// Check-and-consume for one packet from `source`.
    pub async fn allow(&self, source: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(source.to_string()).or_insert_with(|| SourceEntry {
            bucket: TokenBucket::new(self.rate_per_sec, self.burst),
            last_seen: now,
        });
        entry.last_seen = now;
        entry.bucket.try_consume_at(now)
    }

    /// Drop entries idle for at least `max_age`. Returns the eviction count.
    pub async fn evict_idle(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_seen) < max_age);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "rate limiter sweep");
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
