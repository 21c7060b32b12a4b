use std::collections::{HashMap, VecDeque};

use crate::kernel::time::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceCheck {
    /// Not seen before (and inserted, when insertion was requested).
    Fresh,
    Replay,
    /// Unseen, but the cache is at capacity with live entries.
    Full,
}

#[derive(Debug, Clone)]
struct NonceRecord {
    first_seen: Timestamp,
    expires: Timestamp,
}

/// Nonce -> first-seen time, with a TTL of one freshness window.
///
/// An entry is retained until the window has passed both since it was first
/// seen and since the signing timestamp of its event, so a future-dated event
/// cannot outlive its own nonce record and be replayed.
///
/// Callers must hold one lock across `check` so lookup and insert are atomic.
#[derive(Debug)]
pub struct NonceCache {
    window_s: f64,
    capacity: usize,
    records: HashMap<String, NonceRecord>,
    order: VecDeque<(String, Timestamp)>,
}

impl NonceCache {
    pub fn new(window_s: u64, capacity: usize) -> Self {
        Self {
            window_s: window_s as f64,
            capacity: capacity.max(1),
            records: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn check(&mut self, nonce: &str, signed_at: Timestamp, now: Timestamp, insert: bool) -> NonceCheck {
        self.purge_front(now);
        if self.records.contains_key(nonce) {
            return NonceCheck::Replay;
        }
        if !insert {
            return NonceCheck::Fresh;
        }
        if self.records.len() >= self.capacity {
            // Front purge is ordered by insertion; a full sweep catches the rest.
            self.sweep(now);
            if self.records.len() >= self.capacity {
                return NonceCheck::Full;
            }
        }
        let expires = now.max(signed_at) + self.window_s;
        self.records.insert(
            nonce.to_string(),
            NonceRecord {
                first_seen: now,
                expires,
            },
        );
        self.order.push_back((nonce.to_string(), expires));
        NonceCheck::Fresh
    }

    /// Remove every expired record. Returns how many were removed.
    pub fn sweep(&mut self, now: Timestamp) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.expires > now);
        let records = &self.records;
        self.order.retain(|(nonce, _)| records.contains_key(nonce));
        before - self.records.len()
    }

    pub fn first_seen(&self, nonce: &str) -> Option<Timestamp> {
        self.records.get(nonce).map(|r| r.first_seen)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn purge_front(&mut self, now: Timestamp) {
        while let Some((nonce, expires)) = self.order.front() {
            if *expires > now {
                break;
            }
            self.records.remove(nonce);
            self.order.pop_front();
        }
    }
}
