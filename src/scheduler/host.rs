// src/scheduler/host.rs
//! Per-host adaptive interval state machine.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::fetch::Validators;
use crate::config::SchedulerSettings;

/// What one feed fetch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 200; `new_items` may be zero.
    Fresh { new_items: usize },
    NotModified,
    RateLimited { retry_after: Option<Duration> },
    Forbidden,
    ServerError(u16),
    NetworkError,
    /// 404 and anything else unexpected.
    Other(u16),
}

impl FetchOutcome {
    pub fn from_status(code: u16, retry_after: Option<Duration>) -> Self {
        match code {
            304 => FetchOutcome::NotModified,
            429 => FetchOutcome::RateLimited { retry_after },
            403 => FetchOutcome::Forbidden,
            500..=599 => FetchOutcome::ServerError(code),
            other => FetchOutcome::Other(other),
        }
    }

    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Fresh { .. } => "200",
            FetchOutcome::NotModified => "304",
            FetchOutcome::RateLimited { .. } => "429",
            FetchOutcome::Forbidden => "403",
            FetchOutcome::ServerError(_) => "5xx",
            FetchOutcome::NetworkError => "network",
            FetchOutcome::Other(_) => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffReason {
    RateLimit,
    Forbidden,
    ServerError,
    NetworkError,
}

impl BackoffReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BackoffReason::RateLimit => "rate_limit",
            BackoffReason::Forbidden => "forbidden",
            BackoffReason::ServerError => "server_error",
            BackoffReason::NetworkError => "client_error",
        }
    }
}

/// Aggregate of one host cycle, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    NewContent,
    Unchanged,
    Backoff(BackoffReason),
    /// Only 404/other statuses: interval untouched.
    Neutral,
}

#[derive(Debug, Clone, Copy)]
pub struct IntervalPolicy {
    pub baseline: f64,
    pub min: f64,
    pub max: f64,
    pub backoff_base: f64,
    pub backoff_factor: f64,
}

impl From<&SchedulerSettings> for IntervalPolicy {
    fn from(s: &SchedulerSettings) -> Self {
        Self {
            baseline: s.baseline_secs as f64,
            min: s.min_secs as f64,
            max: s.max_secs as f64,
            backoff_base: s.backoff_base_secs as f64,
            backoff_factor: s.backoff_factor,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub verdict: Verdict,
    pub new_items: usize,
    pub old_interval: Duration,
    pub new_interval: Duration,
    /// First backoff of a run; log it.
    pub log_backoff: bool,
    /// Interval dropped after having exceeded 2x baseline.
    pub recovered: bool,
}

#[derive(Debug, Clone)]
pub struct HostState {
    pub host: String,
    pub next_due: Instant,
    pub interval: Duration,
    validators: HashMap<String, Validators>,
    pub consecutive_ok: u32,
    pub consecutive_fail: u32,
    pub backoff_logged: bool,
}

impl HostState {
    /// `baseline` is the starting interval; callers clamp it into policy range.
    pub fn new(host: impl Into<String>, now: Instant, baseline: Duration, stagger: Duration) -> Self {
        Self {
            host: host.into(),
            next_due: now + stagger,
            interval: baseline,
            validators: HashMap::new(),
            consecutive_ok: 0,
            consecutive_fail: 0,
            backoff_logged: false,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    pub fn validators(&self, url: &str) -> Validators {
        self.validators.get(url).cloned().unwrap_or_default()
    }

    /// Refresh from a 200. Missing headers clear the cached value.
    pub fn store_validators(&mut self, url: &str, v: Validators) {
        if v.is_empty() {
            self.validators.remove(url);
        } else {
            self.validators.insert(url.to_string(), v);
        }
    }

    /// Fold one cycle's outcomes into the state and schedule the next fetch
    /// at `now + interval + jitter`.
    pub fn apply_cycle(
        &mut self,
        outcomes: &[FetchOutcome],
        policy: &IntervalPolicy,
        now: Instant,
        jitter: Duration,
    ) -> CycleSummary {
        let new_items: usize = outcomes
            .iter()
            .map(|o| match o {
                FetchOutcome::Fresh { new_items } => *new_items,
                _ => 0,
            })
            .sum();
        let verdict = aggregate(outcomes, new_items);

        let ok = outcomes
            .iter()
            .any(|o| matches!(o, FetchOutcome::Fresh { .. } | FetchOutcome::NotModified));
        if ok {
            self.consecutive_ok += 1;
            self.consecutive_fail = 0;
            self.backoff_logged = false;
        } else {
            self.consecutive_fail += 1;
            if self.consecutive_fail == 1 {
                self.consecutive_ok = 0;
            }
        }

        let old = self.interval.as_secs_f64();
        let mut log_backoff = false;
        let new = match verdict {
            Verdict::NewContent => policy.min.max(old * 0.9).min(policy.max),
            Verdict::Unchanged => (old * 1.1).min(2.0 * policy.baseline).min(policy.max),
            Verdict::Backoff(_) => {
                let floor = outcomes
                    .iter()
                    .filter_map(|o| match o {
                        FetchOutcome::RateLimited {
                            retry_after: Some(d),
                        } => Some(d.as_secs_f64()),
                        _ => None,
                    })
                    .fold(old, f64::max);
                if !self.backoff_logged {
                    self.backoff_logged = true;
                    log_backoff = true;
                }
                (floor.max(policy.backoff_base) * policy.backoff_factor).min(policy.max)
            }
            Verdict::Neutral => old,
        };

        self.interval = Duration::from_secs_f64(new.max(0.0));
        self.next_due = now + self.interval + jitter;

        CycleSummary {
            verdict,
            new_items,
            old_interval: Duration::from_secs_f64(old),
            new_interval: self.interval,
            log_backoff,
            recovered: old > 2.0 * policy.baseline && new < old,
        }
    }
}

fn aggregate(outcomes: &[FetchOutcome], new_items: usize) -> Verdict {
    let has = |f: fn(&FetchOutcome) -> bool| outcomes.iter().any(f);
    let fresh = has(|o| matches!(o, FetchOutcome::Fresh { .. }));
    let not_modified = has(|o| matches!(o, FetchOutcome::NotModified));

    if fresh && new_items > 0 {
        Verdict::NewContent
    } else if not_modified || fresh {
        Verdict::Unchanged
    } else if has(|o| matches!(o, FetchOutcome::RateLimited { .. })) {
        Verdict::Backoff(BackoffReason::RateLimit)
    } else if has(|o| matches!(o, FetchOutcome::Forbidden)) {
        Verdict::Backoff(BackoffReason::Forbidden)
    } else if has(|o| matches!(o, FetchOutcome::ServerError(_))) {
        Verdict::Backoff(BackoffReason::ServerError)
    } else if has(|o| matches!(o, FetchOutcome::NetworkError)) {
        Verdict::Backoff(BackoffReason::NetworkError)
    } else {
        Verdict::Neutral
    }
}
