// src/normalize/mod.rs
//! Vendor payload -> canonical [`Item`].
//!
//! `normalize` is pure: no I/O, no shared state. Anything that cannot be turned
//! into a valid item yields `None` and a debug log line.

pub mod text;
pub mod vendors;

use std::collections::HashMap;

use metrics::counter;
use serde_json::Value;

use crate::item::{normalize_timestamp, IdGranularity, Item};

/// Which adapter family produced the payload. Selects the mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    WebSocket,
    Webhook,
    Newswire,
    Feed,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::WebSocket => "websocket",
            SourceKind::Webhook => "webhook",
            SourceKind::Newswire => "newswire",
            SourceKind::Feed => "feed",
        }
    }
}

/// Everything the mapping needs besides the payload itself.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub kind: SourceKind,
    /// Configured source name (websocket/newswire/feed), or the detected webhook vendor.
    pub name: String,
    pub vendor: Option<String>,
    pub topic: Option<String>,
    pub publisher: Option<String>,
    /// Lower-cased header names.
    headers: HashMap<String, String>,
    pub granularity: IdGranularity,
}

impl NormalizeContext {
    fn new(kind: SourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            vendor: None,
            topic: None,
            publisher: None,
            headers: HashMap::new(),
            granularity: IdGranularity::default(),
        }
    }

    pub fn websocket(name: impl Into<String>) -> Self {
        Self::new(SourceKind::WebSocket, name)
    }

    pub fn newswire(name: impl Into<String>, vendor: impl Into<String>) -> Self {
        let mut ctx = Self::new(SourceKind::Newswire, name);
        ctx.vendor = Some(vendor.into());
        ctx
    }

    pub fn feed(name: impl Into<String>) -> Self {
        Self::new(SourceKind::Feed, name)
    }

    pub fn webhook<K, V>(headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut ctx = Self::new(SourceKind::Webhook, "webhook");
        ctx.headers = headers
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
            .collect();
        ctx
    }

    pub fn with_vendor(mut self, vendor: Option<String>) -> Self {
        if vendor.is_some() {
            self.vendor = vendor;
        }
        self
    }

    pub fn with_topic(mut self, topic: Option<String>) -> Self {
        self.topic = topic;
        self
    }

    pub fn with_publisher(mut self, publisher: Option<String>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_granularity(mut self, granularity: IdGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// Case-insensitive, non-empty header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Map a vendor payload to an [`Item`]. Never panics; failure is `None`.
pub fn normalize(payload: &Value, ctx: &NormalizeContext) -> Option<Item> {
    if !payload.is_object() {
        tracing::debug!(target: "normalize", kind = ctx.kind.as_str(), name = %ctx.name, "payload is not an object");
        counter!("normalize_failed_total", "kind" => ctx.kind.as_str()).increment(1);
        return None;
    }

    let draft = vendors::map(payload, ctx);
    let summary_cap = match ctx.kind {
        SourceKind::Feed => 500,
        _ => text::MAX_TEXT_CHARS,
    };

    let item = Item::with_granularity(
        draft.topic,
        text::clean_text(&draft.title),
        draft.link.trim(),
        normalize_timestamp(&draft.published),
        draft.source,
        draft.publisher,
        ctx.granularity,
    )
    .summary(draft.summary.map(|s| text::clean_text_capped(&s, summary_cap)))
    .tags(draft.tags)
    .raw_payload(match ctx.kind {
        SourceKind::Feed => None,
        _ => Some(payload.clone()),
    });

    match item.validate() {
        Ok(()) => Some(item),
        Err(e) => {
            tracing::debug!(target: "normalize", kind = ctx.kind.as_str(), name = %ctx.name, error = %e, "mapped item failed validation");
            counter!("normalize_failed_total", "kind" => ctx.kind.as_str()).increment(1);
            None
        }
    }
}
