// src/adapters/webhook.rs
//! Inbound webhook receiver. Signatures are HMAC-SHA256 over the raw body;
//! accepted requests are acknowledged at once and processed on a spawned task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha256;

use crate::bus::{BusStats, EventBus};
use crate::config::WebhookSettings;
use crate::error::{Rejection, SignatureError};
use crate::normalize::{normalize, NormalizeContext};

type HmacSha256 = Hmac<Sha256>;

/// Checked in priority order.
const SIGNATURE_HEADERS: &[&str] = &[
    "x-signature",
    "x-hub-signature-256",
    "x-slack-signature",
    "authorization",
];

const VENDOR_HEADERS: &[&str] = &[
    "x-vendor",
    "x-source",
    "user-agent",
    "x-github-event",
    "x-slack-signature",
];

const KNOWN_VENDORS: &[(&str, &str)] = &[
    ("github", "github"),
    ("slack", "slack"),
    ("reuters", "reuters"),
    ("bloomberg", "bloomberg"),
    ("cnbc", "cnbc"),
    ("nbc", "cnbc"),
    ("yahoo", "yahoo"),
];

/// First non-empty signature header.
pub fn signature_from_headers(headers: &HeaderMap) -> Option<&str> {
    SIGNATURE_HEADERS.iter().find_map(|h| {
        headers
            .get(*h)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    })
}

/// Accepts `sha256=<hex>`, `v0=<hex>` or bare hex. Comparison is constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> Result<(), SignatureError> {
    let sig = signature.ok_or(SignatureError::Missing)?;
    let hex_part = sig
        .strip_prefix("sha256=")
        .or_else(|| sig.strip_prefix("v0="))
        .unwrap_or(sig);
    let provided = hex::decode(hex_part).map_err(|_| SignatureError::Malformed)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(body);
    mac.verify_slice(&provided).map_err(|_| SignatureError::Mismatch)
}

/// `sha256=<hex>` signature for `body`. Used by senders and tests.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Vendor name from well-known headers, canonicalized where recognized.
pub fn detect_vendor(headers: &HeaderMap) -> String {
    for h in VENDOR_HEADERS {
        let Some(value) = headers.get(*h).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let value = value.trim().to_ascii_lowercase();
        if value.is_empty() {
            continue;
        }
        if let Some((_, canon)) = KNOWN_VENDORS.iter().find(|(k, _)| value.contains(k)) {
            return (*canon).to_string();
        }
        return value.split('/').next().unwrap_or_default().to_string();
    }
    "unknown".into()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VendorCounters {
    pub requests: u64,
    pub valid: u64,
    pub errors: u64,
}

/// Vendors tracked by name; later ones are folded into `other`.
const MAX_VENDOR_STATS: usize = 256;

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    valid: u64,
    invalid_signatures: u64,
    mapping_errors: u64,
    published: u64,
    duplicates: u64,
    rate_limited: u64,
    vendors: BTreeMap<String, VendorCounters>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookStatsView {
    pub uptime_seconds: f64,
    pub total_requests: u64,
    pub valid_requests: u64,
    pub success_rate: f64,
    pub invalid_signatures: u64,
    pub mapping_errors: u64,
    pub published_items: u64,
    pub duplicate_items: u64,
    pub rate_limited: u64,
    pub requests_per_minute: f64,
    pub vendor_stats: BTreeMap<String, VendorCounters>,
}

#[derive(Debug)]
pub struct WebhookStats {
    started_at: Instant,
    inner: Mutex<Counters>,
}

impl Default for WebhookStats {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            inner: Mutex::new(Counters::default()),
        }
    }
}

impl Counters {
    fn vendor(&mut self, vendor: &str) -> &mut VendorCounters {
        let key = if self.vendors.contains_key(vendor) || self.vendors.len() < MAX_VENDOR_STATS {
            vendor
        } else {
            "other"
        };
        self.vendors.entry(key.to_string()).or_default()
    }
}

impl WebhookStats {
    fn request(&self, vendor: &str) {
        let mut c = self.inner.lock();
        c.total += 1;
        c.vendor(vendor).requests += 1;
    }

    fn valid(&self, vendor: &str) {
        let mut c = self.inner.lock();
        c.valid += 1;
        c.vendor(vendor).valid += 1;
    }

    fn invalid_signature(&self, vendor: &str) {
        let mut c = self.inner.lock();
        c.invalid_signatures += 1;
        c.vendor(vendor).errors += 1;
    }

    fn mapping_error(&self, vendor: &str) {
        let mut c = self.inner.lock();
        c.mapping_errors += 1;
        c.vendor(vendor).errors += 1;
    }

    fn outcome(&self, res: &Result<(), Rejection>, vendor: &str) {
        let mut c = self.inner.lock();
        match res {
            Ok(()) => c.published += 1,
            Err(Rejection::Duplicate(_)) => c.duplicates += 1,
            Err(Rejection::RateLimited(_)) => {
                c.rate_limited += 1;
                c.vendor(vendor).errors += 1;
            }
            Err(Rejection::Invalid(_)) => {
                c.mapping_errors += 1;
                c.vendor(vendor).errors += 1;
            }
        }
    }

    pub fn snapshot(&self) -> WebhookStatsView {
        let c = self.inner.lock();
        let uptime = self.started_at.elapsed().as_secs_f64();
        WebhookStatsView {
            uptime_seconds: uptime,
            total_requests: c.total,
            valid_requests: c.valid,
            success_rate: c.valid as f64 / c.total.max(1) as f64,
            invalid_signatures: c.invalid_signatures,
            mapping_errors: c.mapping_errors,
            published_items: c.published,
            duplicate_items: c.duplicates,
            rate_limited: c.rate_limited,
            requests_per_minute: c.total as f64 / (uptime / 60.0).max(1.0),
            vendor_stats: c.vendors.clone(),
        }
    }
}

/// `ready` before any traffic, then by success rate.
pub fn health_status(stats: &WebhookStatsView) -> &'static str {
    if stats.total_requests == 0 {
        "ready"
    } else if stats.success_rate > 0.8 {
        "healthy"
    } else if stats.success_rate > 0.5 {
        "degraded"
    } else {
        "unhealthy"
    }
}

#[derive(Clone)]
pub struct WebhookState {
    pub bus: Arc<EventBus>,
    pub settings: Arc<WebhookSettings>,
    pub channel: String,
    pub stats: Arc<WebhookStats>,
}

impl WebhookState {
    pub fn new(bus: Arc<EventBus>, settings: WebhookSettings, channel: impl Into<String>) -> Self {
        Self {
            bus,
            settings: Arc::new(settings),
            channel: channel.into(),
            stats: Arc::new(WebhookStats::default()),
        }
    }

    fn signature_required(&self) -> bool {
        !self.settings.secret.is_empty()
    }

    /// Map and publish one payload. Returns the item id when it was accepted.
    pub fn process(&self, payload: &Value, headers: &HeaderMap, vendor: &str) -> Option<String> {
        let ctx = NormalizeContext::webhook(
            headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string()))),
        );
        let Some(item) = normalize(payload, &ctx) else {
            self.stats.mapping_error(vendor);
            tracing::warn!(target: "webhook", vendor = %vendor, "payload did not map to an item");
            return None;
        };
        let id = item.id.clone();
        let res = self
            .bus
            .try_publish(&self.channel, item, &format!("webhook:{vendor}"));
        self.stats.outcome(&res, vendor);
        match res {
            Ok(()) => {
                tracing::info!(target: "webhook", vendor = %vendor, id = %id, "published");
                Some(id)
            }
            Err(rej) => {
                tracing::debug!(target: "webhook", vendor = %vendor, id = %id, reason = rej.label(), "item filtered");
                None
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct Ack {
    status: &'static str,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    item_id: Option<String>,
}

fn reject(status: StatusCode, detail: &str, result: &'static str) -> Response {
    counter!("webhook_requests_total", "result" => result).increment(1);
    (status, Json(json!({ "detail": detail }))).into_response()
}

async fn inbound(State(state): State<WebhookState>, headers: HeaderMap, body: Bytes) -> Response {
    let vendor = detect_vendor(&headers);
    state.stats.request(&vendor);

    if state.signature_required() {
        if let Err(e) = verify_signature(&state.settings.secret, &body, signature_from_headers(&headers)) {
            state.stats.invalid_signature(&vendor);
            tracing::warn!(target: "webhook", vendor = %vendor, error = %e, "signature rejected");
            let detail = match e {
                SignatureError::Missing => "Missing signature",
                _ => "Invalid signature",
            };
            return reject(StatusCode::UNAUTHORIZED, detail, "unauthorized");
        }
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            state.stats.mapping_error(&vendor);
            tracing::warn!(target: "webhook", vendor = %vendor, error = %e, "invalid json payload");
            return reject(StatusCode::BAD_REQUEST, "Invalid JSON payload", "bad_request");
        }
    };

    state.stats.valid(&vendor);
    counter!("webhook_requests_total", "result" => "accepted").increment(1);

    tokio::spawn(async move {
        state.process(&payload, &headers, &vendor);
    });

    Json(Ack {
        status: "accepted",
        message: "Webhook received and processing",
        item_id: None,
    })
    .into_response()
}

async fn health(State(state): State<WebhookState>) -> Json<Value> {
    let stats = state.stats.snapshot();
    Json(json!({
        "status": health_status(&stats),
        "webhook_path": state.settings.path,
        "signature_required": state.signature_required(),
        "stats": stats,
    }))
}

#[derive(Serialize)]
struct StatsOut {
    webhook_stats: WebhookStatsView,
    event_bus_stats: BusStats,
    configuration: Value,
}

async fn stats(State(state): State<WebhookState>) -> Json<StatsOut> {
    Json(StatsOut {
        webhook_stats: state.stats.snapshot(),
        event_bus_stats: state.bus.stats(),
        configuration: json!({
            "webhook_path": state.settings.path,
            "signature_required": state.signature_required(),
            "rate_limit": state.bus.settings().rate_limit_per_sec,
        }),
    })
}

/// Synchronous processing without a signature. Disabled once a secret is set.
async fn test_hook(State(state): State<WebhookState>, headers: HeaderMap, body: Bytes) -> Response {
    if state.signature_required() {
        return reject(
            StatusCode::FORBIDDEN,
            "Test endpoint disabled when webhook secret is configured",
            "forbidden",
        );
    }
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return reject(StatusCode::BAD_REQUEST, "Invalid JSON payload", "bad_request"),
    };
    let vendor = headers
        .get("x-vendor")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("test")
        .to_string();
    let mut hint = HeaderMap::new();
    if let Ok(v) = vendor.parse() {
        hint.insert("x-vendor", v);
    }
    state.stats.request(&vendor);
    state.stats.valid(&vendor);
    counter!("webhook_requests_total", "result" => "test").increment(1);

    let ack = match state.process(&payload, &hint, &vendor) {
        Some(id) => Ack {
            status: "success",
            message: "Test webhook processed successfully",
            item_id: Some(id),
        },
        None => Ack {
            status: "error",
            message: "Failed to process test webhook",
            item_id: None,
        },
    };
    Json(ack).into_response()
}

pub fn router(state: WebhookState) -> Router {
    let limit = state.settings.max_payload_bytes;
    let inbound_path = state.settings.path.clone();
    Router::new()
        .route(&inbound_path, post(inbound))
        .route("/push/health", get(health))
        .route("/push/stats", get(stats))
        .route("/push/test", post(test_hook))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"title":"Rates","url":"https://x/1","published":"2024-01-01T00:00:00Z"}"#;

    #[test]
    fn accepts_all_signature_formats() {
        let signed = sign_body("s3cret", BODY);
        let hex_only = signed.trim_start_matches("sha256=").to_string();
        assert!(verify_signature("s3cret", BODY, Some(&signed)).is_ok());
        assert!(verify_signature("s3cret", BODY, Some(&hex_only)).is_ok());
        assert!(verify_signature("s3cret", BODY, Some(&format!("v0={hex_only}"))).is_ok());
    }

    #[test]
    fn rejects_bad_signatures() {
        assert_eq!(verify_signature("k", BODY, None), Err(SignatureError::Missing));
        assert_eq!(
            verify_signature("k", BODY, Some("sha256=zz")),
            Err(SignatureError::Malformed)
        );
        let other = sign_body("other", BODY);
        assert_eq!(verify_signature("k", BODY, Some(&other)), Err(SignatureError::Mismatch));
    }

    #[test]
    fn signature_header_priority() {
        let mut h = HeaderMap::new();
        h.insert("authorization", "auth".parse().unwrap());
        h.insert("x-slack-signature", "slack".parse().unwrap());
        assert_eq!(signature_from_headers(&h), Some("slack"));
        h.insert("x-signature", "generic".parse().unwrap());
        assert_eq!(signature_from_headers(&h), Some("generic"));
    }

    #[test]
    fn vendor_detection() {
        let mut h = HeaderMap::new();
        assert_eq!(detect_vendor(&h), "unknown");
        h.insert("user-agent", "AcmeHooks/2.1".parse().unwrap());
        assert_eq!(detect_vendor(&h), "acmehooks");
        h.insert("x-source", "NBC News".parse().unwrap());
        assert_eq!(detect_vendor(&h), "cnbc");
        h.insert("x-vendor", "Reuters-Connect".parse().unwrap());
        assert_eq!(detect_vendor(&h), "reuters");
    }

    #[test]
    fn health_thresholds() {
        let mut v = WebhookStats::default().snapshot();
        assert_eq!(health_status(&v), "ready");
        v.total_requests = 10;
        v.success_rate = 0.9;
        assert_eq!(health_status(&v), "healthy");
        v.success_rate = 0.6;
        assert_eq!(health_status(&v), "degraded");
        v.success_rate = 0.5;
        assert_eq!(health_status(&v), "unhealthy");
    }

    #[test]
    fn vendor_table_folds_overflow_into_other() {
        let stats = WebhookStats::default();
        for i in 0..MAX_VENDOR_STATS + 50 {
            stats.request(&format!("rotating-{i}"));
        }
        stats.request("rotating-0");
        let v = stats.snapshot();
        assert_eq!(v.vendor_stats.len(), MAX_VENDOR_STATS + 1);
        assert_eq!(v.vendor_stats["other"].requests, 50);
        assert_eq!(v.vendor_stats["rotating-0"].requests, 2);
        assert_eq!(v.total_requests, MAX_VENDOR_STATS as u64 + 51);
    }

    #[test]
    fn process_counts_published_and_duplicates() {
        let state = WebhookState::new(
            Arc::new(EventBus::default()),
            WebhookSettings::default(),
            crate::bus::RAW_CHANNEL,
        );
        let payload: Value = serde_json::from_slice(BODY).unwrap();
        let h = HeaderMap::new();
        assert!(state.process(&payload, &h, "acme").is_some());
        assert!(state.process(&payload, &h, "acme").is_none());
        let s = state.stats.snapshot();
        assert_eq!(s.published_items, 1);
        assert_eq!(s.duplicate_items, 1);
        assert_eq!(state.bus.len(crate::bus::RAW_CHANNEL), 1);
    }
}
