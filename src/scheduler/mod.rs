// src/scheduler/mod.rs
//! Adaptive per-host feed poller.
//!
//! Feeds are grouped by host once at construction. Every second the loop picks
//! the due hosts, fetches them concurrently (and each host's feeds concurrently),
//! then settles the results one host at a time: seen-id filter, normalize,
//! publish, snapshot, interval update.

pub mod feed;
pub mod fetch;
pub mod host;
pub mod snapshot;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::config::{FeedSource, SchedulerSettings};
use crate::error::TransportError;
use crate::item::{IdGranularity, Item};
use crate::normalize::{normalize, NormalizeContext};
use feed::{parse_feed, ParsedFeed};
use fetch::{FeedFetcher, FetchResponse, Validators};
use host::{FetchOutcome, HostState, IntervalPolicy, Verdict};

const TICK: Duration = Duration::from_secs(1);

/// Local seen-id set. Above `cap` it keeps only the most recent half.
#[derive(Debug)]
pub struct SeenIds {
    set: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl SeenIds {
    pub fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap: cap.max(2),
        }
    }

    /// `true` if `id` was not seen before.
    pub fn insert(&mut self, id: &str) -> bool {
        if !self.set.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.set.len() > self.cap {
            let keep = self.cap / 2;
            let before = self.set.len();
            while self.order.len() > keep {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
            tracing::info!(target: "scheduler", before, after = self.set.len(), "pruned seen-id cache");
        }
        true
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostView {
    pub interval_secs: f64,
    pub feeds: usize,
    pub consecutive_ok: u32,
    pub consecutive_fail: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub total_fetches: u64,
    pub total_new_items: u64,
    pub total_errors: u64,
    pub last_snapshot_update: Option<DateTime<Utc>>,
    pub hosts: BTreeMap<String, HostView>,
}

struct HostEntry {
    state: HostState,
    feeds: Vec<FeedSource>,
}

enum FeedResult {
    NotModified,
    Fresh {
        parsed: Option<ParsedFeed>,
        validators: Validators,
    },
    Status {
        code: u16,
        retry_after: Option<Duration>,
    },
    Failed(TransportError),
}

pub struct Scheduler {
    settings: SchedulerSettings,
    policy: IntervalPolicy,
    bus: Arc<EventBus>,
    channel: String,
    fetcher: Arc<dyn FeedFetcher>,
    hosts: Vec<HostEntry>,
    seen: SeenIds,
    granularity: IdGranularity,
    stats: Arc<Mutex<SchedulerStats>>,
}

/// Host-keyed index of the configured feeds. Unparseable URLs are skipped.
pub fn group_by_host(feeds: &[FeedSource]) -> BTreeMap<String, Vec<FeedSource>> {
    let mut out: BTreeMap<String, Vec<FeedSource>> = BTreeMap::new();
    for f in feeds {
        match url::Url::parse(&f.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        {
            Some(host) => out.entry(host).or_default().push(f.clone()),
            None => tracing::warn!(target: "scheduler", feed = %f.name, url = %f.url, "invalid feed url, skipped"),
        }
    }
    out
}

fn uniform(range: [f64; 2]) -> Duration {
    let [lo, hi] = range;
    let secs = if hi > lo {
        rand::rng().random_range(lo..=hi)
    } else {
        lo
    };
    Duration::from_secs_f64(secs.max(0.0))
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        bus: Arc<EventBus>,
        channel: impl Into<String>,
        fetcher: Arc<dyn FeedFetcher>,
    ) -> Self {
        let policy = IntervalPolicy::from(&settings);
        let now = Instant::now();
        let baseline = Duration::from_secs_f64(policy.baseline.min(policy.max).max(policy.min));
        let hosts: Vec<HostEntry> = group_by_host(&settings.feeds)
            .into_iter()
            .map(|(host, feeds)| {
                let stagger = uniform(settings.stagger_secs);
                tracing::info!(target: "scheduler", %host, feeds = feeds.len(), stagger_secs = stagger.as_secs_f64(), "host scheduled");
                HostEntry {
                    state: HostState::new(host, now, baseline, stagger),
                    feeds,
                }
            })
            .collect();
        tracing::info!(
            target: "scheduler",
            feeds = hosts.iter().map(|h| h.feeds.len()).sum::<usize>(),
            hosts = hosts.len(),
            "feeds loaded"
        );
        let seen = SeenIds::new(settings.seen_cap);
        let sched = Self {
            settings,
            policy,
            bus,
            channel: channel.into(),
            fetcher,
            hosts,
            seen,
            granularity: IdGranularity::default(),
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
        };
        sched.refresh_host_views();
        sched
    }

    pub fn with_granularity(mut self, granularity: IdGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn stats_handle(&self) -> Arc<Mutex<SchedulerStats>> {
        Arc::clone(&self.stats)
    }

    pub fn host_state(&self, host: &str) -> Option<&HostState> {
        self.hosts
            .iter()
            .map(|h| &h.state)
            .find(|s| s.host == host)
    }

    /// Mark everything already in the snapshot as seen so a restart does not re-emit it.
    pub async fn seed_seen_from_snapshot(&mut self) {
        match snapshot::load(&self.settings.snapshot_path).await {
            Ok(snap) => {
                for it in snap.items.iter().rev() {
                    self.seen.insert(&it.id);
                }
                tracing::info!(target: "scheduler", seeded = self.seen.len(), "seen ids seeded from snapshot");
            }
            Err(e) => tracing::warn!(target: "scheduler", error = ?e, "could not seed seen ids"),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        self.seed_seen_from_snapshot().await;
        tracing::info!(target: "scheduler", "starting adaptive polling loop (1s tick)");
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Instant::now()).await;
                }
            }
        }
        tracing::info!(target: "scheduler", "scheduler stopped");
    }

    /// One tick: poll every host due at `now`. Returns how many hosts were polled.
    pub async fn tick(&mut self, now: Instant) -> usize {
        let due: Vec<usize> = self
            .hosts
            .iter()
            .enumerate()
            .filter(|(_, h)| h.state.is_due(now))
            .map(|(i, _)| i)
            .collect();
        if due.is_empty() {
            return 0;
        }

        let fetched = join_all(due.iter().map(|&i| self.fetch_host(i))).await;
        for (idx, results) in fetched {
            self.settle_host(idx, results, Instant::now()).await;
        }
        self.refresh_host_views();
        due.len()
    }

    async fn fetch_host(&self, idx: usize) -> (usize, Vec<(usize, FeedResult)>) {
        let entry = &self.hosts[idx];
        let max_items = self.settings.max_items_per_feed;
        let futs = entry.feeds.iter().enumerate().map(|(fi, feed)| {
            let validators = entry.state.validators(&feed.url);
            let fetcher = Arc::clone(&self.fetcher);
            async move {
                let res = match fetcher.fetch(&feed.url, &validators).await {
                    Ok(FetchResponse::NotModified) => FeedResult::NotModified,
                    Ok(FetchResponse::Fresh { body, validators }) => {
                        let t0 = std::time::Instant::now();
                        let parsed = match parse_feed(&body, max_items) {
                            Ok(p) => Some(p),
                            Err(e) => {
                                tracing::warn!(target: "scheduler", feed = %feed.name, error = %e, "feed parse failed");
                                None
                            }
                        };
                        histogram!("scheduler_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
                        FeedResult::Fresh { parsed, validators }
                    }
                    Ok(FetchResponse::Status { code, retry_after }) => {
                        FeedResult::Status { code, retry_after }
                    }
                    Err(e) => {
                        tracing::warn!(target: "scheduler", feed = %feed.name, error = %e, "fetch error");
                        FeedResult::Failed(e)
                    }
                };
                (fi, res)
            }
        });
        (idx, join_all(futs).await)
    }

    async fn settle_host(&mut self, idx: usize, results: Vec<(usize, FeedResult)>, now: Instant) {
        let host = self.hosts[idx].state.host.clone();
        let mut outcomes = Vec::with_capacity(results.len());
        let mut fresh_items = Vec::new();

        for (fi, res) in results {
            let feed = self.hosts[idx].feeds[fi].clone();
            let outcome = match res {
                FeedResult::NotModified => FetchOutcome::NotModified,
                FeedResult::Fresh { parsed, validators } => {
                    self.hosts[idx].state.store_validators(&feed.url, validators);
                    let items = parsed
                        .map(|p| self.ingest_entries(&feed, &host, p))
                        .unwrap_or_default();
                    let n = items.len();
                    fresh_items.extend(items);
                    FetchOutcome::Fresh { new_items: n }
                }
                FeedResult::Status { code, retry_after } => {
                    if code == 429 {
                        if let Some(ra) = retry_after {
                            tracing::info!(target: "scheduler", %host, retry_after_secs = ra.as_secs(), "Retry-After received");
                        }
                    }
                    FetchOutcome::from_status(code, retry_after)
                }
                FeedResult::Failed(_) => FetchOutcome::NetworkError,
            };
            counter!("scheduler_fetch_total", "status" => outcome.label()).increment(1);
            outcomes.push(outcome);
        }

        let jitter = uniform(self.settings.jitter_secs);
        let summary = self.hosts[idx]
            .state
            .apply_cycle(&outcomes, &self.policy, now, jitter);

        let errors = outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o,
                    FetchOutcome::RateLimited { .. }
                        | FetchOutcome::Forbidden
                        | FetchOutcome::ServerError(_)
                        | FetchOutcome::NetworkError
                )
            })
            .count() as u64;

        if let Verdict::Backoff(reason) = summary.verdict {
            if summary.log_backoff {
                tracing::warn!(
                    target: "scheduler",
                    %host,
                    interval_secs = summary.new_interval.as_secs_f64(),
                    reason = reason.as_str(),
                    "backoff escalate"
                );
            }
        }
        if summary.recovered {
            tracing::info!(target: "scheduler", %host, interval_secs = summary.new_interval.as_secs_f64(), "host recovered");
        }
        tracing::info!(
            target: "scheduler",
            %host,
            verdict = ?summary.verdict,
            new = summary.new_items,
            interval_secs = summary.new_interval.as_secs_f64(),
            "host cycle"
        );
        gauge!("scheduler_host_interval_secs", "host" => host.clone())
            .set(summary.new_interval.as_secs_f64());
        counter!("scheduler_new_items_total").increment(summary.new_items as u64);

        let snapshot_update = if fresh_items.is_empty() {
            None
        } else {
            match snapshot::append(
                &self.settings.snapshot_path,
                fresh_items,
                self.settings.snapshot_cap,
            )
            .await
            {
                Ok(s) => s.last_updated,
                Err(e) => {
                    tracing::error!(target: "scheduler", error = ?e, "snapshot write failed");
                    None
                }
            }
        };

        let mut st = self.stats.lock();
        st.total_fetches += outcomes.len() as u64;
        st.total_new_items += summary.new_items as u64;
        st.total_errors += errors;
        if snapshot_update.is_some() {
            st.last_snapshot_update = snapshot_update;
        }
    }

    /// Normalize, filter through the seen set and publish. Returns the new items.
    fn ingest_entries(&mut self, feed: &FeedSource, host: &str, parsed: ParsedFeed) -> Vec<Item> {
        let publisher = feed
            .publisher
            .clone()
            .or(parsed.title)
            .or_else(|| (!feed.name.is_empty()).then(|| feed.name.clone()))
            .unwrap_or_else(|| host.to_string());
        let ctx = NormalizeContext::feed(feed.name.clone())
            .with_topic(feed.category.clone())
            .with_publisher(Some(publisher))
            .with_granularity(self.granularity);
        let label = format!("feed:{}", feed.name);

        let mut out = Vec::new();
        for entry in parsed.entries {
            let Some(item) = normalize(&entry.to_payload(), &ctx) else {
                continue;
            };
            if !self.seen.insert(&item.id) {
                continue;
            }
            if let Err(rej) = self.bus.try_publish(&self.channel, item.clone(), &label) {
                tracing::debug!(target: "scheduler", feed = %feed.name, reason = rej.label(), "bus rejected item");
            }
            out.push(item);
        }
        if !out.is_empty() {
            tracing::debug!(target: "scheduler", feed = %feed.name, new = out.len(), "parsed new items");
        }
        out
    }

    fn refresh_host_views(&self) {
        let mut st = self.stats.lock();
        st.hosts = self
            .hosts
            .iter()
            .map(|h| {
                (
                    h.state.host.clone(),
                    HostView {
                        interval_secs: h.state.interval.as_secs_f64(),
                        feeds: h.feeds.len(),
                        consecutive_ok: h.state.consecutive_ok,
                        consecutive_fail: h.state.consecutive_fail,
                    },
                )
            })
            .collect();
    }
}
