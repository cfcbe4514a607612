use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::IsolateId;

/// Last heartbeat seen from each forker.
#[derive(Debug)]
pub struct LivenessTable {
    last_seen: HashMap<IsolateId, Instant>,
    ttl: Duration,
}

impl LivenessTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            last_seen: HashMap::new(),
            ttl,
        }
    }

    /// Refreshes a forker. Returns `true` if it was unknown.
    pub fn touch(&mut self, forker: &str, now: Instant) -> bool {
        self.last_seen.insert(forker.to_string(), now).is_none()
    }

    pub fn forget(&mut self, forker: &str) -> bool {
        self.last_seen.remove(forker).is_some()
    }

    /// Removes and returns the forkers silent for at least the TTL.
    pub fn expired(&mut self, now: Instant) -> Vec<IsolateId> {
        let ttl = self.ttl;
        let mut expired: Vec<IsolateId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) >= ttl)
            .map(|(forker, _)| forker.clone())
            .collect();
        expired.sort();

        for forker in &expired {
            self.last_seen.remove(forker);
        }
        expired
    }

    pub fn contains(&self, forker: &str) -> bool {
        self.last_seen.contains_key(forker)
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}
