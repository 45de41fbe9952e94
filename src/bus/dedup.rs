// src/bus/dedup.rs
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Seen-id register with TTL expiry and a hard cap.
///
/// `order` mirrors `seen` in insertion order, so both expiry and cap eviction
/// pop from the front. Cleanup happens on lookup; there is no timer.
#[derive(Debug)]
pub struct DedupTracker {
    ttl: Duration,
    max_tracked: usize,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl DedupTracker {
    pub fn new(ttl: Duration, max_tracked: usize) -> Self {
        Self {
            ttl,
            max_tracked: max_tracked.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// True if `id` was marked within the TTL window ending at `now`.
    pub fn is_duplicate(&mut self, id: &str, now: Instant) -> bool {
        self.expire(now);
        self.seen.contains_key(id)
    }

    pub fn mark(&mut self, id: &str, now: Instant) {
        if self.seen.insert(id.to_string(), now).is_none() {
            self.order.push_back((id.to_string(), now));
        }
        while self.seen.len() > self.max_tracked {
            if !self.pop_oldest() {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((_, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.ttl {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) -> bool {
        match self.order.pop_front() {
            Some((id, at)) => {
                // Only drop the map entry if it still belongs to this queue slot.
                if self.seen.get(&id) == Some(&at) {
                    self.seen.remove(&id);
                }
                true
            }
            None => false,
        }
    }
}
