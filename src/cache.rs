//! Replay and cooldown caches.
//!
//! Both live behind one lock: the pipeline touches them in sequence and the
//! janitor takes the same lock for its sweep. Plain maps with minute-scale
//! sweeps are enough here; steady-state size is bounded by active clients
//! and the packet rate, not by attacker traffic.

use crate::protocol::SIGNATURE_SIZE;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// How often the janitor sweeps both caches.
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Identifies one (user, action) pair: base64 public key + action id.
pub type CooldownKey = (String, String);

/// Outcome of the atomic cooldown check-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    Ready,
    Active { remaining: Duration },
}

struct CacheMaps {
    /// Signature bytes → expiry. Checked before any cryptographic work so a
    /// replayed-signature flood costs a map lookup, not a verification.
    replay: HashMap<[u8; SIGNATURE_SIZE], Instant>,
    /// (user, action) → last execution.
    cooldowns: HashMap<CooldownKey, Instant>,
}

pub struct KnockCaches {
    replay_window: Duration,
    default_cooldown: Duration,
    inner: Mutex<CacheMaps>,
}

impl KnockCaches {
    pub fn new(replay_window: Duration, default_cooldown: Duration) -> Self {
        Self {
            replay_window,
            default_cooldown,
            inner: Mutex::new(CacheMaps { replay: HashMap::new(), cooldowns: HashMap::new() }),
        }
    }

    /// Pre-auth replay lookup. Signatures have enough entropy that a hit is
    /// a replay, not a collision.
    pub async fn is_replay(&self, signature: &[u8; SIGNATURE_SIZE]) -> bool {
        let maps = self.inner.lock().await;
        match maps.replay.get(signature) {
            Some(expiry) => *expiry > Instant::now(),
            None => false,
        }
    }

    /// Remember a verified signature until the replay window (plus one
    /// second of slack) has passed.
    pub async fn record_signature(&self, signature: [u8; SIGNATURE_SIZE]) {
        let expiry = Instant::now() + self.replay_window + Duration::from_secs(1);
        self.inner.lock().await.replay.insert(signature, expiry);
    }

    /// Resolve the per-action override against the global default.
    /// An explicit zero disables the cooldown for that action.
    pub fn effective_cooldown(&self, action_override: Option<u64>) -> Duration {
        match action_override {
            Some(secs) => Duration::from_secs(secs),
            None => self.default_cooldown,
        }
    }

    /// Atomic check-and-set: either the key is inside its cooldown window
    /// and the remaining time is reported, or the execution timestamp is
    /// recorded before the lock is released. Two concurrent packets for the
    /// same key can never both observe `Ready`.
    pub async fn check_and_set_cooldown(
        &self,
        key: CooldownKey,
        effective: Duration,
    ) -> CooldownDecision {
        if effective.is_zero() {
            return CooldownDecision::Ready;
        }
        let now = Instant::now();
        let mut maps = self.inner.lock().await;
        if let Some(last) = maps.cooldowns.get(&key) {
            let elapsed = now.duration_since(*last);
            if elapsed < effective {
                return CooldownDecision::Active { remaining: effective - elapsed };
            }
        }
        maps.cooldowns.insert(key, now);
        CooldownDecision::Ready
    }

    /// Janitor sweep: expired replay entries and cooldown entries older
    /// than twice the default window. Returns (replay, cooldown) counts.
    pub async fn sweep(&self) -> (usize, usize) {
        let now = Instant::now();
        let cooldown_age = self.default_cooldown * 2;
        let mut maps = self.inner.lock().await;

        let replay_before = maps.replay.len();
        maps.replay.retain(|_, expiry| *expiry > now);
        let replay_purged = replay_before - maps.replay.len();

        let cooldown_before = maps.cooldowns.len();
        maps.cooldowns.retain(|_, last| now.duration_since(*last) < cooldown_age);
        let cooldown_purged = cooldown_before - maps.cooldowns.len();

        if replay_purged > 0 || cooldown_purged > 0 {
            debug!(replay_purged, cooldown_purged, "cache sweep");
        }
        (replay_purged, cooldown_purged)
    }
}
