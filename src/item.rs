// src/item.rs
//! Canonical news item shared by every adapter, the bus and the hub.
//!
//! Identity is `sha256(link | title | published truncated to the minute)`,
//! first 16 hex chars. Two reports of the same story captured seconds apart
//! collapse to one id; so do distinct stories sharing link+title inside the
//! same minute. The granularity is a tunable (`IdGranularity`), minute by default.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::error::ValidationError;

/// Truncation applied to `published` before hashing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdGranularity {
    #[default]
    Minute,
    Second,
}

impl IdGranularity {
    pub fn truncate(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let ts = ts.trunc_subsecs(0);
        match self {
            IdGranularity::Second => ts,
            IdGranularity::Minute => ts.with_second(0).unwrap_or(ts),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub topic: String,
    pub title: String,
    pub link: String,
    pub published: DateTime<Utc>,
    /// Adapter-qualified origin, e.g. `webhook:acme`, `websocket:reuters-live`.
    pub source: String,
    pub publisher: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Comma-separated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<serde_json::Value>,
}

impl Item {
    /// Build an item and derive its id. `published` is truncated to whole seconds.
    pub fn new(
        topic: impl Into<String>,
        title: impl Into<String>,
        link: impl Into<String>,
        published: DateTime<Utc>,
        source: impl Into<String>,
        publisher: impl Into<String>,
    ) -> Self {
        Self::with_granularity(
            topic,
            title,
            link,
            published,
            source,
            publisher,
            IdGranularity::Minute,
        )
    }

    pub fn with_granularity(
        topic: impl Into<String>,
        title: impl Into<String>,
        link: impl Into<String>,
        published: DateTime<Utc>,
        source: impl Into<String>,
        publisher: impl Into<String>,
        granularity: IdGranularity,
    ) -> Self {
        let title = title.into();
        let link = link.into();
        let published = published.trunc_subsecs(0);
        Self {
            id: make_id(&link, &title, published, granularity),
            topic: topic.into(),
            title,
            link,
            published,
            source: source.into(),
            publisher: publisher.into(),
            summary: None,
            tags: None,
            raw_payload: None,
        }
    }

    pub fn summary(mut self, summary: Option<String>) -> Self {
        self.summary = summary.filter(|s| !s.is_empty());
        self
    }

    pub fn tags(mut self, tags: Option<String>) -> Self {
        self.tags = tags.filter(|s| !s.is_empty());
        self
    }

    pub fn raw_payload(mut self, payload: Option<serde_json::Value>) -> Self {
        self.raw_payload = payload;
        self
    }

    /// Structural check run by the bus before anything else.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let required = [
            ("id", &self.id),
            ("title", &self.title),
            ("link", &self.link),
            ("source", &self.source),
            ("publisher", &self.publisher),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField(name));
            }
        }
        Ok(())
    }

    /// Lenient decode for items read back from disk. Accepts the legacy
    /// `category` field as `topic` and rejects unparseable timestamps.
    pub fn from_value(mut value: serde_json::Value) -> Result<Self, ValidationError> {
        let obj = value
            .as_object_mut()
            .ok_or(ValidationError::MissingField("id"))?;
        if !obj.contains_key("topic") {
            let topic = obj
                .get("category")
                .cloned()
                .unwrap_or_else(|| serde_json::Value::String("news".into()));
            obj.insert("topic".into(), topic);
        }
        let published = obj
            .get("published")
            .and_then(|v| v.as_str())
            .ok_or(ValidationError::MissingField("published"))?
            .to_string();
        let ts = parse_timestamp(&TimestampInput::Text(&published))
            .ok_or_else(|| ValidationError::BadTimestamp(published.clone()))?;
        obj.insert(
            "published".into(),
            serde_json::Value::String(ts.to_rfc3339()),
        );
        for key in ["id", "title", "link", "source", "publisher"] {
            if !obj.get(key).is_some_and(|v| v.is_string()) {
                return Err(ValidationError::MissingField(key));
            }
        }
        serde_json::from_value(value).map_err(|_| ValidationError::MissingField("id"))
    }
}

/// `sha256(link|title|published_norm)`, first 16 hex chars.
pub fn make_id(
    link: &str,
    title: &str,
    published: DateTime<Utc>,
    granularity: IdGranularity,
) -> String {
    let norm = granularity
        .truncate(published)
        .format("%Y-%m-%dT%H:%M:%S+00:00");
    let mut hasher = Sha256::new();
    hasher.update(format!("{link}|{title}|{norm}").as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Timestamp shapes vendors send us.
#[derive(Debug, Clone, Copy)]
pub enum TimestampInput<'a> {
    /// Unix epoch seconds.
    Epoch(f64),
    Text(&'a str),
    Instant(DateTime<Utc>),
    Missing,
}

impl<'a> TimestampInput<'a> {
    pub fn from_json(v: Option<&'a serde_json::Value>) -> Self {
        match v {
            Some(serde_json::Value::Number(n)) => {
                n.as_f64().map(Self::Epoch).unwrap_or(Self::Missing)
            }
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Self::Text(s),
            _ => Self::Missing,
        }
    }
}

/// Best-effort parse; `None` when nothing matched.
pub fn parse_timestamp(input: &TimestampInput<'_>) -> Option<DateTime<Utc>> {
    match *input {
        TimestampInput::Instant(dt) => Some(dt),
        TimestampInput::Epoch(secs) => from_epoch(secs),
        TimestampInput::Text(s) => parse_text(s.trim()),
        TimestampInput::Missing => None,
    }
}

/// Always converges to a UTC instant with second precision. Unparseable or
/// absent input falls back to the current time.
pub fn normalize_timestamp(input: &TimestampInput<'_>) -> DateTime<Utc> {
    match parse_timestamp(input) {
        Some(ts) => ts.trunc_subsecs(0),
        None => {
            if let TimestampInput::Text(raw) = input {
                tracing::debug!(target: "normalize", raw = %raw, "unparseable timestamp, using now");
            }
            Utc::now().trunc_subsecs(0)
        }
    }
}

fn from_epoch(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    Utc.timestamp_opt(whole, nanos).single()
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

fn parse_text(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc2822) {
        return from_epoch(dt.unix_timestamp() as f64);
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    // Naive values carry no zone; treat them as UTC.
    for fmt in NAIVE_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|ndt| Utc.from_utc_datetime(&ndt));
    }
    s.parse::<f64>().ok().and_then(from_epoch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn same_minute_collapses_to_one_id() {
        let a = Item::new("news", "A", "http://x/1", ts("2024-01-01T00:00:30Z"), "t", "p");
        let b = Item::new("news", "A", "http://x/1", ts("2024-01-01T00:00:45Z"), "t", "p");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
    }

    #[test]
    fn different_minute_or_title_changes_id() {
        let a = Item::new("news", "A", "http://x/1", ts("2024-01-01T00:00:30Z"), "t", "p");
        let b = Item::new("news", "A", "http://x/1", ts("2024-01-01T00:01:00Z"), "t", "p");
        let c = Item::new("news", "B", "http://x/1", ts("2024-01-01T00:00:30Z"), "t", "p");
        assert_ne!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn second_granularity_keeps_them_apart() {
        let g = IdGranularity::Second;
        let a = make_id("http://x/1", "A", ts("2024-01-01T00:00:30Z"), g);
        let b = make_id("http://x/1", "A", ts("2024-01-01T00:00:45Z"), g);
        assert_ne!(a, b);
    }

    #[test]
    fn id_is_first_sixteen_hex_of_sha256() {
        let id = make_id("http://x/1", "A", ts("2024-01-01T00:00:30Z"), IdGranularity::Minute);
        let full = hex::encode(Sha256::digest(b"http://x/1|A|2024-01-01T00:00:00+00:00"));
        assert_eq!(id, full[..16]);
    }

    #[test]
    fn id_ignores_source_and_publisher() {
        let a = Item::new("x", "A", "http://x/1", ts("2024-01-01T00:00:30Z"), "webhook:a", "P1");
        let b = Item::new("y", "A", "http://x/1", ts("2024-01-01T00:00:31Z"), "websocket:b", "P2");
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn parses_common_shapes_to_utc() {
        let cases = [
            TimestampInput::Text("2024-01-01T01:00:00+01:00"),
            TimestampInput::Text("Mon, 01 Jan 2024 00:00:00 +0000"),
            TimestampInput::Text("2024-01-01 00:00:00"),
            TimestampInput::Text("2024-01-01T00:00:00.250Z"),
            TimestampInput::Epoch(1_704_067_200.0),
            TimestampInput::Instant(ts("2024-01-01T00:00:00Z")),
        ];
        for c in cases {
            let got = normalize_timestamp(&c);
            assert_eq!(got, ts("2024-01-01T00:00:00Z"), "input {c:?}");
        }
    }

    #[test]
    fn unparseable_or_missing_falls_back_to_now() {
        // Non-deterministic by contract: assert it lands close to the wall clock.
        let before = Utc::now().trunc_subsecs(0);
        let a = normalize_timestamp(&TimestampInput::Text("not a date"));
        let b = normalize_timestamp(&TimestampInput::Missing);
        let after = Utc::now();
        assert!(a >= before && a <= after);
        assert!(b >= before && b <= after);
    }

    #[test]
    fn optional_fields_are_omitted_on_the_wire() {
        let it = Item::new("news", "A", "http://x/1", ts("2024-01-01T00:00:30Z"), "t", "p");
        let v = serde_json::to_value(&it).unwrap();
        assert!(v.get("summary").is_none());
        assert!(v.get("tags").is_none());
        assert!(v.get("raw_payload").is_none());
        assert_eq!(v["published"], "2024-01-01T00:00:30Z");
    }

    #[test]
    fn validate_flags_empty_link() {
        let it = Item::new("news", "A", "", ts("2024-01-01T00:00:30Z"), "t", "p");
        assert_eq!(it.validate(), Err(ValidationError::MissingField("link")));
    }

    #[test]
    fn from_value_accepts_legacy_category() {
        let v = serde_json::json!({
            "id": "abc", "title": "T", "link": "http://x", "published": "2024-01-01T00:00:00+00:00",
            "source": "feed", "publisher": "P", "category": "markets"
        });
        let it = Item::from_value(v).unwrap();
        assert_eq!(it.topic, "markets");
        assert_eq!(it.id, "abc");
    }

    #[test]
    fn from_value_rejects_bad_timestamp() {
        let v = serde_json::json!({
            "id": "abc", "title": "T", "link": "http://x", "published": "yesterday-ish",
            "source": "feed", "publisher": "P"
        });
        assert!(matches!(Item::from_value(v), Err(ValidationError::BadTimestamp(_))));
    }
}
