// src/bus/mod.rs
//! In-process pub/sub register shared by every producer and the hub.
//!
//! One `parking_lot::Mutex` guards channels, dedup tracker and limiter table so the
//! accept decision (validate, consume token, check-and-insert id) is atomic
//! across concurrently publishing adapters. Subscriber callbacks run after the
//! lock is released, on the publishing task.

pub mod dedup;
pub mod rate_limit;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::BusSettings;
use crate::error::Rejection;
use crate::item::Item;
use dedup::DedupTracker;
use rate_limit::TokenBucket;

/// Default channel every producer publishes to.
pub const RAW_CHANNEL: &str = "news.raw";

/// Envelope actually stored and broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct StreamMessage {
    pub channel: String,
    pub item: Item,
    pub received_at: DateTime<Utc>,
    pub source: String,
}

/// Shared bucket for source labels beyond `max_limiters`.
pub const OVERFLOW_LIMITER: &str = "*overflow*";

pub type Subscriber = Arc<dyn Fn(&StreamMessage) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub tokens: f64,
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub channels: BTreeMap<String, usize>,
    pub tracked_ids: usize,
    pub rate_limiters: BTreeMap<String, LimiterStats>,
    pub subscribers: BTreeMap<String, usize>,
    pub accepted: u64,
    pub rejected: BTreeMap<String, u64>,
}

struct BusState {
    channels: HashMap<String, VecDeque<StreamMessage>>,
    dedup: DedupTracker,
    limiters: HashMap<String, TokenBucket>,
    subscribers: HashMap<String, Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: u64,
    accepted: u64,
    rejected: BTreeMap<&'static str, u64>,
}

pub struct EventBus {
    settings: BusSettings,
    state: Mutex<BusState>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusSettings::default())
    }
}

impl EventBus {
    pub fn new(settings: BusSettings) -> Self {
        let dedup = DedupTracker::new(
            Duration::from_secs(settings.dedup_ttl_secs),
            settings.max_tracked_ids,
        );
        Self {
            settings,
            state: Mutex::new(BusState {
                channels: HashMap::new(),
                dedup,
                limiters: HashMap::new(),
                subscribers: HashMap::new(),
                next_subscription: 0,
                accepted: 0,
                rejected: BTreeMap::new(),
            }),
        }
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    /// `true` if accepted.
    pub fn publish(&self, channel: &str, item: Item, source: &str) -> bool {
        self.try_publish(channel, item, source).is_ok()
    }

    pub fn try_publish(&self, channel: &str, item: Item, source: &str) -> Result<(), Rejection> {
        self.try_publish_at(channel, item, source, Instant::now())
    }

    /// Publish with an explicit clock. Checks run in a fixed order:
    /// validation, rate limit, dedup. Only an accepted item touches the channel.
    pub fn try_publish_at(
        &self,
        channel: &str,
        item: Item,
        source: &str,
        now: Instant,
    ) -> Result<(), Rejection> {
        let outcome = {
            let mut st = self.state.lock();
            self.accept_locked(&mut st, channel, item, source, now)
        };

        match outcome {
            Ok((msg, subs)) => {
                counter!("bus_publish_total", "outcome" => "accepted").increment(1);
                tracing::debug!(target: "bus", channel, source, id = %msg.item.id, "accepted");
                self.notify(&msg, subs);
                Ok(())
            }
            Err(rej) => {
                counter!("bus_publish_total", "outcome" => rej.label()).increment(1);
                match &rej {
                    Rejection::Invalid(e) => {
                        tracing::warn!(target: "bus", channel, source, error = %e, "rejected invalid item")
                    }
                    other => tracing::debug!(target: "bus", channel, source, reason = other.label(), "rejected"),
                }
                Err(rej)
            }
        }
    }

    fn accept_locked(
        &self,
        st: &mut BusState,
        channel: &str,
        item: Item,
        source: &str,
        now: Instant,
    ) -> Result<(StreamMessage, Vec<Subscriber>), Rejection> {
        let result = self.check_locked(st, &item, source, now);

        if let Err(rej) = result {
            *st.rejected.entry(rej.label()).or_default() += 1;
            return Err(rej);
        }

        // 4) append, mark, collect subscribers
        st.dedup.mark(&item.id, now);
        let msg = StreamMessage {
            channel: channel.to_string(),
            item,
            received_at: Utc::now(),
            source: source.to_string(),
        };
        let cap = self.settings.channel_capacity.max(1);
        let ring = st.channels.entry(channel.to_string()).or_default();
        ring.push_back(msg.clone());
        while ring.len() > cap {
            ring.pop_front();
        }
        st.accepted += 1;
        let subs = st
            .subscribers
            .get(channel)
            .map(|v| v.iter().map(|(_, s)| Arc::clone(s)).collect())
            .unwrap_or_default();
        Ok((msg, subs))
    }

    fn check_locked(
        &self,
        st: &mut BusState,
        item: &Item,
        source: &str,
        now: Instant,
    ) -> Result<(), Rejection> {
        // 1) structure; no token spent on garbage
        item.validate()?;

        // 2) rate limit
        let key = self.limiter_key(st, source, now);
        let rate = self
            .settings
            .source_rate_limits
            .get(&key)
            .copied()
            .unwrap_or(self.settings.rate_limit_per_sec);
        let burst = self.settings.burst_secs;
        let bucket = st
            .limiters
            .entry(key)
            .or_insert_with(|| TokenBucket::new(rate, burst, now));
        if !bucket.try_acquire(now) {
            return Err(Rejection::RateLimited(source.to_string()));
        }

        // 3) dedup
        if st.dedup.is_duplicate(&item.id, now) {
            return Err(Rejection::Duplicate(item.id.clone()));
        }
        Ok(())
    }

    /// Bucket label `source` draws from. At `max_limiters`, idle buckets are
    /// dropped first; labels that still do not fit share the overflow bucket.
    fn limiter_key(&self, st: &mut BusState, source: &str, now: Instant) -> String {
        if st.limiters.contains_key(source) {
            return source.to_string();
        }
        let cap = self.settings.max_limiters.max(1);
        if st.limiters.len() >= cap {
            st.limiters
                .retain(|k, b| k == OVERFLOW_LIMITER || !b.is_idle(now));
        }
        if st.limiters.len() >= cap {
            tracing::debug!(target: "bus", source, "limiter table full; using overflow bucket");
            OVERFLOW_LIMITER.to_string()
        } else {
            source.to_string()
        }
    }

    fn notify(&self, msg: &StreamMessage, subs: Vec<Subscriber>) {
        for sub in subs {
            match catch_unwind(AssertUnwindSafe(|| sub(msg))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(target: "bus", channel = %msg.channel, error = ?e, "subscriber callback failed")
                }
                Err(_) => {
                    tracing::error!(target: "bus", channel = %msg.channel, "subscriber callback panicked")
                }
            }
        }
    }

    /// Most-recent-first, at most `limit` messages.
    pub fn recent(&self, channel: &str, limit: usize) -> Vec<StreamMessage> {
        let st = self.state.lock();
        st.channels
            .get(channel)
            .map(|ring| ring.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, channel: &str) -> usize {
        self.state.lock().channels.get(channel).map_or(0, VecDeque::len)
    }

    pub fn subscribe<F>(&self, channel: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&StreamMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut st = self.state.lock();
        st.next_subscription += 1;
        let id = SubscriptionId(st.next_subscription);
        st.subscribers
            .entry(channel.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// `true` if the subscription existed.
    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool {
        let mut st = self.state.lock();
        let Some(subs) = st.subscribers.get_mut(channel) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        before != subs.len()
    }

    pub fn stats(&self) -> BusStats {
        let st = self.state.lock();
        BusStats {
            channels: st
                .channels
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
            tracked_ids: st.dedup.len(),
            rate_limiters: st
                .limiters
                .iter()
                .map(|(k, b)| {
                    (
                        k.clone(),
                        LimiterStats {
                            tokens: b.tokens(),
                            rate: b.rate(),
                        },
                    )
                })
                .collect(),
            subscribers: st
                .subscribers
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
            accepted: st.accepted,
            rejected: st
                .rejected
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }
}
