// src/config.rs
//! Service settings. Every section is `#[serde(default)]` so partial files work.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::item::IdGranularity;

const ENV_PATH: &str = "NEWSFLOW_CONFIG_PATH";
const SAFE_BASELINE_SECS: u64 = 60;
const MIN_INTERVAL_FLOOR_SECS: u64 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bus: BusSettings,
    pub scheduler: SchedulerSettings,
    pub webhook: WebhookSettings,
    pub websocket_sources: Vec<WebSocketSource>,
    pub newswire_sources: Vec<NewswireSource>,
    pub hub: HubSettings,
    /// Identity truncation for every normalized item.
    pub id_granularity: IdGranularity,
    /// JSON log lines instead of the compact format.
    pub json_logs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub rate_limit_per_sec: f64,
    /// Bucket capacity = rate * burst_secs.
    pub burst_secs: f64,
    pub dedup_ttl_secs: u64,
    pub max_tracked_ids: usize,
    pub channel_capacity: usize,
    /// Per source-label rate override.
    pub source_rate_limits: HashMap<String, f64>,
    /// Distinct limiter buckets kept before new labels share one overflow bucket.
    pub max_limiters: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            rate_limit_per_sec: 10.0,
            burst_secs: 5.0,
            dedup_ttl_secs: 3600,
            max_tracked_ids: 10_000,
            channel_capacity: 1000,
            source_rate_limits: HashMap::new(),
            max_limiters: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub baseline_secs: u64,
    pub min_secs: u64,
    pub max_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_factor: f64,
    /// Inclusive [lo, hi] seconds added to every next-due.
    pub jitter_secs: [f64; 2],
    /// Inclusive [lo, hi] seconds of initial delay per host.
    pub stagger_secs: [f64; 2],
    pub max_items_per_feed: usize,
    pub seen_cap: usize,
    pub snapshot_path: PathBuf,
    pub snapshot_cap: usize,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub feeds: Vec<FeedSource>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            baseline_secs: 60,
            min_secs: 30,
            max_secs: 900,
            backoff_base_secs: 30,
            backoff_factor: 2.0,
            jitter_secs: [0.0, 5.0],
            stagger_secs: [0.0, 10.0],
            max_items_per_feed: 100,
            seen_cap: 10_000,
            snapshot_path: PathBuf::from("data/realtime/latest_feeds.json"),
            snapshot_cap: 1000,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            feeds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    /// Empty disables signature enforcement.
    pub secret: String,
    pub path: String,
    pub max_payload_bytes: usize,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            secret: String::new(),
            path: "/push/inbound".into(),
            max_payload_bytes: 1024 * 1024,
        }
    }
}

fn default_ping_interval() -> u64 {
    30
}

fn default_ws_backoff() -> Vec<f64> {
    vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0]
}

pub(crate) fn default_queue_size() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Bound on TCP connect plus the upgrade handshake.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ws_backoff")]
    pub reconnect_backoff_secs: Vec<f64>,
    #[serde(default = "default_queue_size")]
    pub max_queue_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    30
}

fn default_retry_delay() -> u64 {
    30
}

fn default_max_retry_delay() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewswireSource {
    pub name: String,
    pub vendor: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_true")]
    pub tls: bool,
    /// Sent once right after connecting: strings verbatim, objects as JSON, plus newline.
    #[serde(default)]
    pub auth_message: Option<serde_json::Value>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    pub poll_quantum_secs: u64,
    pub heartbeat_every: u32,
    pub view_limit: usize,
    pub initial_batch: usize,
    pub channel: String,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            poll_quantum_secs: 5,
            heartbeat_every: 3,
            view_limit: 200,
            initial_batch: 10,
            channel: crate::bus::RAW_CHANNEL.into(),
        }
    }
}

impl Settings {
    /// Env overrides win over file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WEBHOOK_SECRET") {
            self.webhook.secret = v;
        }
        if let Some(v) = env_parse::<f64>("EVENT_RATE_LIMIT") {
            self.bus.rate_limit_per_sec = v;
        }
        if let Ok(v) = std::env::var("FEED_DATA_FILE") {
            if !v.trim().is_empty() {
                self.scheduler.snapshot_path = PathBuf::from(v);
            }
        }
        if let Some(v) = env_parse::<u64>("POLL_BASELINE_SECONDS") {
            self.scheduler.baseline_secs = v;
        }
    }

    /// Clamp values that would make the scheduler misbehave.
    pub fn sanitize(&mut self) {
        let s = &mut self.scheduler;
        if s.baseline_secs < SAFE_BASELINE_SECS {
            tracing::warn!(
                baseline_secs = s.baseline_secs,
                safe_minimum = SAFE_BASELINE_SECS,
                "poll baseline below safe minimum"
            );
        }
        s.min_secs = s.min_secs.max(MIN_INTERVAL_FLOOR_SECS);
        s.max_secs = s.max_secs.max(s.min_secs);
        s.backoff_factor = s.backoff_factor.max(1.0);
        for range in [&mut s.jitter_secs, &mut s.stagger_secs] {
            range[0] = range[0].max(0.0);
            range[1] = range[1].max(range[0]);
        }
        if self.bus.rate_limit_per_sec <= 0.0 {
            self.bus.rate_limit_per_sec = BusSettings::default().rate_limit_per_sec;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Load settings from an explicit path. Supports TOML or JSON formats.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading settings from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let mut settings = parse_settings(&content, ext.as_str())
        .with_context(|| format!("parsing settings in {}", path.display()))?;
    settings.apply_env_overrides();
    settings.sanitize();
    Ok(settings)
}

/// Load settings using env var + fallbacks:
/// 1) $NEWSFLOW_CONFIG_PATH
/// 2) config/newsflow.toml
/// 3) config/newsflow.json
/// 4) built-in defaults
pub fn load_settings_default() -> Result<Settings> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_settings_from(&pb);
        } else {
            return Err(anyhow!("NEWSFLOW_CONFIG_PATH points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/newsflow.toml");
    if toml_p.exists() {
        return load_settings_from(&toml_p);
    }
    let json_p = PathBuf::from("config/newsflow.json");
    if json_p.exists() {
        return load_settings_from(&json_p);
    }
    let mut settings = Settings::default();
    settings.apply_env_overrides();
    settings.sanitize();
    Ok(settings)
}

fn parse_settings(s: &str, hint_ext: &str) -> Result<Settings> {
    match hint_ext {
        "toml" => Ok(toml::from_str(s)?),
        "json" => Ok(serde_json::from_str(s)?),
        // Unknown extension: JSON if it looks like an object, else TOML.
        _ if s.trim_start().starts_with('{') => Ok(serde_json::from_str(s)?),
        _ => toml::from_str(s).map_err(|e| anyhow!("unsupported settings format: {e}")),
    }
}
