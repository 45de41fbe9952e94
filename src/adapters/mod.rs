// src/adapters/mod.rs
//! Push-style transports sharing one lifecycle: connect, read until the peer
//! goes away, close, back off, repeat. `run_adapter` is the supervisor.

pub mod newswire;
pub mod queue;
pub mod webhook;
pub mod websocket;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use metrics::counter;
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::shutdown::sleep_or_cancel;

/// Running counters, shared between an adapter, its publisher task and the API.
#[derive(Debug, Default)]
pub struct AdapterStats {
    name: String,
    messages: AtomicU64,
    errors: AtomicU64,
    published: AtomicU64,
    filtered: AtomicU64,
    queue_dropped: AtomicU64,
    reconnects: AtomicU64,
    connected: AtomicBool,
    /// Unix millis, 0 = never.
    last_activity_ms: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatsView {
    pub name: String,
    pub connected: bool,
    pub messages: u64,
    pub errors: u64,
    pub published: u64,
    pub filtered: u64,
    pub queue_dropped: u64,
    pub reconnects: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl AdapterStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        counter!("adapter_messages_total", "adapter" => self.name.clone()).increment(1);
        self.touch();
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!("adapter_errors_total", "adapter" => self.name.clone()).increment(1);
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_dropped(&self) {
        self.queue_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connected(&self, v: bool) {
        self.connected.store(v, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AdapterStatsView {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        AdapterStatsView {
            name: self.name.clone(),
            connected: self.connected.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_activity: (ms > 0)
                .then(|| Utc.timestamp_millis_opt(ms).single())
                .flatten(),
        }
    }
}

/// Common capability of every push transport.
#[async_trait]
pub trait Adapter: Send {
    fn name(&self) -> &str;

    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Read until the peer disconnects (`Ok`), a transport error occurs, or `cancel` fires.
    async fn read_loop(&mut self, cancel: &CancellationToken) -> Result<(), TransportError>;

    /// Release the connection. Idempotent.
    async fn close(&mut self);

    fn stats(&self) -> Arc<AdapterStats>;
}

/// How long to wait before the next connect attempt.
#[derive(Debug, Clone)]
pub enum ReconnectPolicy {
    /// `steps[min(attempt-1, len-1)]` seconds, then +/- `jitter` fraction, floored at 0.1 s.
    BackoffTable { steps: Vec<f64>, jitter: f64 },
    /// `retry * 2^(attempt-1)` seconds, capped at `max`.
    FixedThenEscalating { retry: Duration, max: Duration },
}

const MIN_BACKOFF_SECS: f64 = 0.1;

impl ReconnectPolicy {
    pub fn table(steps: Vec<f64>) -> Self {
        ReconnectPolicy::BackoffTable {
            steps,
            jitter: 0.25,
        }
    }

    /// Un-jittered delay for the `attempt`-th consecutive failure (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            ReconnectPolicy::BackoffTable { steps, .. } => {
                let idx = (attempt as usize - 1).min(steps.len().saturating_sub(1));
                let secs = steps.get(idx).copied().unwrap_or(1.0);
                Duration::from_secs_f64(secs.max(MIN_BACKOFF_SECS))
            }
            ReconnectPolicy::FixedThenEscalating { retry, max } => {
                let factor = 2f64.powi((attempt - 1).min(30) as i32);
                Duration::from_secs_f64((retry.as_secs_f64() * factor).min(max.as_secs_f64()))
            }
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        match self {
            ReconnectPolicy::BackoffTable { jitter, .. } if *jitter > 0.0 => {
                let j = base.as_secs_f64() * jitter;
                let secs = base.as_secs_f64() + rand::rng().random_range(-j..=j);
                Duration::from_secs_f64(secs.max(MIN_BACKOFF_SECS))
            }
            _ => base,
        }
    }
}

/// Supervise one adapter until cancelled or a fatal error.
pub async fn run_adapter<A: Adapter>(
    mut adapter: A,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
) {
    let stats = adapter.stats();
    let name = adapter.name().to_string();
    let mut failures: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            r = adapter.connect() => r,
        };
        match connected {
            Ok(()) => {
                failures = 0;
                stats.set_connected(true);
                stats.touch();
                tracing::info!(target: "adapter", adapter = %name, "connected");

                let res = adapter.read_loop(&cancel).await;
                adapter.close().await;
                stats.set_connected(false);

                if cancel.is_cancelled() {
                    break;
                }
                match res {
                    Ok(()) => tracing::warn!(target: "adapter", adapter = %name, "disconnected by peer"),
                    Err(e) if e.is_fatal() => {
                        tracing::error!(target: "adapter", adapter = %name, error = %e, "fatal error, adapter stopped");
                        break;
                    }
                    Err(e) => {
                        stats.record_error();
                        tracing::warn!(target: "adapter", adapter = %name, error = %e, "read loop failed");
                    }
                }
                failures = 1;
            }
            Err(e) if e.is_fatal() => {
                stats.record_error();
                tracing::error!(target: "adapter", adapter = %name, error = %e, "fatal error, adapter stopped");
                break;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                stats.record_error();
                tracing::warn!(target: "adapter", adapter = %name, error = %e, attempt = failures, "connect failed");
            }
        }

        let delay = policy.delay(failures);
        tracing::info!(target: "adapter", adapter = %name, delay_secs = delay.as_secs_f64(), "reconnecting");
        if !sleep_or_cancel(&cancel, delay).await {
            break;
        }
        stats.record_reconnect();
    }

    adapter.close().await;
    stats.set_connected(false);
    tracing::info!(target: "adapter", adapter = %name, "adapter stopped");
}

/// Every configured push adapter, started together and stopped together.
pub struct AdapterSet {
    cancel: CancellationToken,
    stats: Vec<Arc<AdapterStats>>,
    tasks: Vec<JoinHandle<()>>,
}

impl AdapterSet {
    /// Child of `parent`: cancelling the parent stops the set too.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            stats: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a supervised adapter.
    pub fn start<A: Adapter + 'static>(&mut self, adapter: A, policy: ReconnectPolicy) {
        self.stats.push(adapter.stats());
        let cancel = self.cancel.clone();
        self.tasks
            .push(tokio::spawn(run_adapter(adapter, policy, cancel)));
    }

    /// Track an auxiliary task (publisher drains) so `stop` awaits it too.
    pub fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn stats(&self) -> Vec<AdapterStatsView> {
        self.stats.iter().map(|s| s.snapshot()).collect()
    }

    pub fn stats_handles(&self) -> Vec<Arc<AdapterStats>> {
        self.stats.clone()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        for t in self.tasks {
            if let Err(e) = t.await {
                tracing::warn!(target: "adapter", error = ?e, "adapter task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn table_backoff_walks_steps_and_saturates() {
        let p = ReconnectPolicy::BackoffTable {
            steps: vec![1.0, 2.0, 4.0],
            jitter: 0.0,
        };
        assert_eq!(p.delay(1), Duration::from_secs(1));
        assert_eq!(p.delay(3), Duration::from_secs(4));
        assert_eq!(p.delay(9), Duration::from_secs(4));
    }

    #[test]
    fn table_jitter_stays_within_quarter() {
        let p = ReconnectPolicy::table(vec![8.0]);
        for _ in 0..200 {
            let d = p.delay(1).as_secs_f64();
            assert!((6.0..=10.0).contains(&d), "{d}");
        }
    }

    #[test]
    fn escalating_doubles_until_cap() {
        let p = ReconnectPolicy::FixedThenEscalating {
            retry: Duration::from_secs(30),
            max: Duration::from_secs(300),
        };
        assert_eq!(p.delay(1), Duration::from_secs(30));
        assert_eq!(p.delay(2), Duration::from_secs(60));
        assert_eq!(p.delay(4), Duration::from_secs(240));
        assert_eq!(p.delay(5), Duration::from_secs(300));
    }

    struct Flaky {
        stats: Arc<AdapterStats>,
        connects: Arc<AtomicU32>,
        fatal_after: u32,
    }

    #[async_trait]
    impl Adapter for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn connect(&mut self) -> Result<(), TransportError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.fatal_after {
                Err(TransportError::InvalidConfig("gone".into()))
            } else {
                Err(TransportError::Closed)
            }
        }
        async fn read_loop(&mut self, _: &CancellationToken) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&mut self) {}
        fn stats(&self) -> Arc<AdapterStats> {
            Arc::clone(&self.stats)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_retries_then_stops_on_fatal() {
        let connects = Arc::new(AtomicU32::new(0));
        let stats = Arc::new(AdapterStats::new("flaky"));
        let a = Flaky {
            stats: Arc::clone(&stats),
            connects: Arc::clone(&connects),
            fatal_after: 4,
        };
        let policy = ReconnectPolicy::BackoffTable {
            steps: vec![1.0, 2.0],
            jitter: 0.0,
        };
        run_adapter(a, policy, CancellationToken::new()).await;
        assert_eq!(connects.load(Ordering::SeqCst), 4);
        let s = stats.snapshot();
        assert_eq!(s.errors, 4);
        assert_eq!(s.reconnects, 3);
        assert!(!s.connected);
    }
}
