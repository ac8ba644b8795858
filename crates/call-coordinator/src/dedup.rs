//! Time-bounded de-duplication set
//!
//! Racing event sources claim a key before acting on it; the first claim
//! wins and later claims for the same key are refused until the entry
//! expires. Expiry bounds memory and lets a new call reuse a room id once
//! the previous one is long gone.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct DedupSet {
    name: &'static str,
    ttl: Duration,
    claimed: DashMap<String, Instant>,
}

impl DedupSet {
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self { name, ttl, claimed: DashMap::new() }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Claim `key`. Returns `true` for the first caller only.
    pub fn try_claim(&self, key: &str) -> bool {
        let now = Instant::now();
        self.purge_expired(now);
        match self.claimed.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if now.duration_since(*held.get()) >= self.ttl {
                    held.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.claimed
            .get(key)
            .map(|at| at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Drop a claim early, e.g. after the guarded action failed
    pub fn release(&self, key: &str) -> bool {
        self.claimed.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.claimed.clear();
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    fn purge_expired(&self, now: Instant) {
        let ttl = self.ttl;
        self.claimed.retain(|_, at| now.duration_since(*at) < ttl);
    }
}
