// tests/scheduler_conditional.rs
//
// Adaptive polling against a scripted fetcher: conditional requests, interval
// tuning on new/unchanged content and 429 backoff.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use newsflow::config::{FeedSource, SchedulerSettings};
use newsflow::error::TransportError;
use newsflow::scheduler::fetch::{FeedFetcher, FetchResponse, Validators};
use newsflow::scheduler::Scheduler;
use newsflow::{EventBus, RAW_CHANNEL};

const HOST: &str = "feeds.acme.test";
const FEED_URL: &str = "https://feeds.acme.test/markets.xml";

const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Acme Markets</title>
    <item>
      <title>Stocks rally on jobs data</title>
      <link>https://acme.test/markets/1</link>
      <pubDate>Thu, 02 May 2024 10:00:00 +0000</pubDate>
      <description>Indexes rose.</description>
    </item>
    <item>
      <title>Dollar slips</title>
      <link>https://acme.test/markets/2</link>
      <pubDate>Thu, 02 May 2024 10:05:00 +0000</pubDate>
    </item>
  </channel>
</rss>"#;

/// Replays queued responses and records the validators it was given.
#[derive(Default)]
struct ScriptedFetcher {
    responses: Mutex<VecDeque<FetchResponse>>,
    seen_validators: Mutex<Vec<Validators>>,
}

impl ScriptedFetcher {
    fn push(&self, r: FetchResponse) {
        self.responses.lock().push_back(r);
    }
}

#[async_trait]
impl FeedFetcher for ScriptedFetcher {
    async fn fetch(&self, _url: &str, validators: &Validators) -> Result<FetchResponse, TransportError> {
        self.seen_validators.lock().push(validators.clone());
        self.responses.lock().pop_front().ok_or(TransportError::Closed)
    }
}

fn settings(dir: &tempfile::TempDir) -> SchedulerSettings {
    SchedulerSettings {
        jitter_secs: [0.0, 0.0],
        stagger_secs: [0.0, 0.0],
        snapshot_path: dir.path().join("latest_feeds.json"),
        feeds: vec![FeedSource {
            name: "acme-markets".into(),
            url: FEED_URL.into(),
            category: Some("markets".into()),
            publisher: None,
        }],
        ..SchedulerSettings::default()
    }
}

fn fresh(etag: &str) -> FetchResponse {
    FetchResponse::Fresh {
        body: RSS.into(),
        validators: Validators {
            etag: Some(etag.into()),
            last_modified: Some("Thu, 02 May 2024 10:06:00 GMT".into()),
        },
    }
}

/// Far enough ahead that the host is due whatever its interval.
fn later() -> Instant {
    Instant::now() + Duration::from_secs(100_000)
}

fn interval(s: &Scheduler) -> Duration {
    s.host_state(HOST).expect("host tracked").interval
}

#[tokio::test]
async fn conditional_fetch_and_interval_tuning() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::default());
    let fetcher = Arc::new(ScriptedFetcher::default());
    let mut sched = Scheduler::new(
        settings(&dir),
        Arc::clone(&bus),
        RAW_CHANNEL,
        Arc::clone(&fetcher) as Arc<dyn FeedFetcher>,
    );
    let stats = sched.stats_handle();

    // First fetch: fresh content, validators cached, items published.
    fetcher.push(fresh("\"v1\""));
    assert_eq!(sched.tick(later()).await, 1);
    assert_eq!(bus.len(RAW_CHANNEL), 2);
    let recent = bus.recent(RAW_CHANNEL, 2);
    assert!(recent.iter().all(|m| m.source == "feed:acme-markets"));
    assert!(recent.iter().all(|m| m.item.publisher == "Acme Markets"));
    assert_eq!(interval(&sched), Duration::from_secs(54));
    assert!(dir.path().join("latest_feeds.json").exists());

    // 304: request carried the cached etag, nothing new, interval grows.
    fetcher.push(FetchResponse::NotModified);
    sched.tick(later()).await;
    {
        let sent = fetcher.seen_validators.lock();
        assert!(sent[0].is_empty());
        assert_eq!(sent[1].etag.as_deref(), Some("\"v1\""));
        assert!(sent[1].last_modified.is_some());
    }
    assert_eq!(bus.len(RAW_CHANNEL), 2);
    let mut last = interval(&sched);
    assert!(last > Duration::from_secs(54));

    // Repeated 304s keep growing, never past twice the baseline.
    for _ in 0..3 {
        fetcher.push(FetchResponse::NotModified);
        sched.tick(later()).await;
        let now = interval(&sched);
        assert!(now > last);
        assert!(now <= Duration::from_secs(120));
        last = now;
    }

    // Same body again: parsed, but every entry was already seen.
    fetcher.push(fresh("\"v2\""));
    sched.tick(later()).await;
    assert_eq!(bus.len(RAW_CHANNEL), 2);
    assert!(interval(&sched) >= last);

    let st = stats.lock().clone();
    assert_eq!(st.total_fetches, 5);
    assert_eq!(st.total_new_items, 2);
    assert_eq!(st.total_errors, 0);
    assert!(st.last_snapshot_update.is_some());
}

#[tokio::test]
async fn rate_limited_host_backs_off() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::default());
    let fetcher = Arc::new(ScriptedFetcher::default());
    let cfg = settings(&dir);
    let factor = cfg.backoff_factor;
    let max = Duration::from_secs(cfg.max_secs);
    let mut sched = Scheduler::new(
        cfg,
        Arc::clone(&bus),
        RAW_CHANNEL,
        Arc::clone(&fetcher) as Arc<dyn FeedFetcher>,
    );

    let before = interval(&sched);
    fetcher.push(FetchResponse::Status {
        code: 429,
        retry_after: Some(Duration::from_secs(5)),
    });
    let started = Instant::now();
    sched.tick(later()).await;

    let host = sched.host_state(HOST).expect("host tracked");
    assert!(host.interval.as_secs_f64() >= before.as_secs_f64() * factor);
    assert!(host.interval <= max);
    assert!(host.next_due >= started + host.interval);
    assert_eq!(host.consecutive_fail, 1);
    assert_eq!(bus.len(RAW_CHANNEL), 0);

    // Network failures keep escalating up to the ceiling.
    for _ in 0..10 {
        sched.tick(later()).await;
    }
    assert_eq!(interval(&sched), max);
}

#[tokio::test]
async fn restart_does_not_re_emit_snapshot_items() {
    let dir = tempfile::tempdir().unwrap();

    let first_bus = Arc::new(EventBus::default());
    let fetcher = Arc::new(ScriptedFetcher::default());
    let mut sched = Scheduler::new(
        settings(&dir),
        Arc::clone(&first_bus),
        RAW_CHANNEL,
        Arc::clone(&fetcher) as Arc<dyn FeedFetcher>,
    );
    fetcher.push(fresh("\"v1\""));
    sched.tick(later()).await;
    assert_eq!(first_bus.len(RAW_CHANNEL), 2);

    let second_bus = Arc::new(EventBus::default());
    let fetcher = Arc::new(ScriptedFetcher::default());
    let mut restarted = Scheduler::new(
        settings(&dir),
        Arc::clone(&second_bus),
        RAW_CHANNEL,
        Arc::clone(&fetcher) as Arc<dyn FeedFetcher>,
    );
    restarted.seed_seen_from_snapshot().await;
    fetcher.push(fresh("\"v1\""));
    restarted.tick(later()).await;
    assert_eq!(second_bus.len(RAW_CHANNEL), 0);
}
