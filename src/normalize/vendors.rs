// src/normalize/vendors.rs
//! Explicit per-vendor field mappings plus the generic probing fallback.
//!
//! Every mapper produces a [`Draft`]; turning it into an [`Item`](crate::item::Item)
//! (cleanup, timestamp normalization, id, validation) happens in `normalize`.

use serde_json::Value;

use super::{NormalizeContext, SourceKind};
use crate::item::TimestampInput;

pub(crate) const NO_TITLE: &str = "No Title";

/// Vendor-agnostic intermediate shape.
#[derive(Debug)]
pub(crate) struct Draft<'a> {
    pub topic: String,
    pub title: String,
    pub link: String,
    pub published: TimestampInput<'a>,
    pub source: String,
    pub publisher: String,
    pub summary: Option<String>,
    pub tags: Option<String>,
}

/// Candidate field names probed in order by the generic strategy.
struct Candidates {
    title: &'static [&'static str],
    link: &'static [&'static str],
    time: &'static [&'static str],
    summary: &'static [&'static str],
}

const WS_CANDIDATES: Candidates = Candidates {
    title: &["title", "headline", "subject", "summary"],
    link: &["url", "link", "href", "story_url"],
    time: &["timestamp", "published", "datetime", "created_at", "date"],
    summary: &["summary", "description", "body", "abstract", "lead"],
};

const WEBHOOK_CANDIDATES: Candidates = Candidates {
    title: &["title", "headline", "subject", "name"],
    link: &["url", "link", "href", "canonical_url", "story_url"],
    time: &["published", "datePublished", "created_at", "timestamp", "date"],
    summary: &["description", "summary", "abstract", "excerpt"],
};

const NEWSWIRE_CANDIDATES: Candidates = Candidates {
    title: &["headline", "title", "subject"],
    link: &["url", "link", "uri"],
    time: &["published_date", "date_created", "timestamp"],
    summary: &["body", "text", "summary", "abstract"],
};

/// Non-empty string value of `key`. Numbers are stringified.
pub(crate) fn text(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First non-empty value among `keys`.
pub(crate) fn first(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| text(payload, k))
}

fn time<'a>(payload: &'a Value, keys: &[&str]) -> TimestampInput<'a> {
    keys.iter()
        .map(|k| TimestampInput::from_json(payload.get(*k)))
        .find(|t| !matches!(t, TimestampInput::Missing))
        .unwrap_or(TimestampInput::Missing)
}

/// Arrays are comma-joined, strings passed through.
pub(crate) fn tags(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::Array(xs) if !xs.is_empty() => {
            let joined = xs
                .iter()
                .filter_map(|x| match x {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(",");
            (!joined.is_empty()).then_some(joined)
        }
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn or(v: Option<String>, fallback: &str) -> String {
    v.unwrap_or_else(|| fallback.to_string())
}

/// Vendor hint for a webhook: X-Vendor, User-Agent, payload `vendor`, payload `source`.
pub(crate) fn webhook_vendor_hint(payload: &Value, ctx: &NormalizeContext) -> String {
    ctx.header("x-vendor")
        .or_else(|| ctx.header("user-agent"))
        .map(str::to_string)
        .or_else(|| text(payload, "vendor"))
        .or_else(|| text(payload, "source"))
        .unwrap_or_else(|| "unknown".into())
        .to_lowercase()
}

pub(crate) fn map<'a>(payload: &'a Value, ctx: &NormalizeContext) -> Draft<'a> {
    match ctx.kind {
        SourceKind::WebSocket => map_websocket(payload, ctx),
        SourceKind::Webhook => map_webhook(payload, ctx),
        SourceKind::Newswire => map_newswire(payload, ctx),
        SourceKind::Feed => map_feed(payload, ctx),
    }
}

// ---------------- websocket ----------------

fn map_websocket<'a>(p: &'a Value, ctx: &NormalizeContext) -> Draft<'a> {
    let hint = ctx.vendor.as_deref().unwrap_or(&ctx.name).to_lowercase();
    let source = format!("websocket:{}", ctx.name);
    let topic = |keys: &[&str], dflt: &str| {
        first(p, keys).unwrap_or_else(|| ctx.topic.clone().unwrap_or_else(|| dflt.into()))
    };

    if hint.contains("reuters") {
        Draft {
            topic: topic(&["category"], "business"),
            title: or(first(p, &["headline", "title"]), NO_TITLE),
            link: or(first(p, &["url", "link"]), ""),
            published: time(p, &["timestamp", "published"]),
            source,
            publisher: "Reuters".into(),
            summary: first(p, &["summary", "lead"]),
            tags: tags(p, "tags"),
        }
    } else if hint.contains("bloomberg") {
        Draft {
            topic: topic(&["topic", "category"], "markets"),
            title: or(first(p, &["headline", "title"]), NO_TITLE),
            link: or(first(p, &["url", "story_url"]), ""),
            published: time(p, &["datetime", "timestamp"]),
            source,
            publisher: "Bloomberg".into(),
            summary: first(p, &["summary", "abstract"]),
            tags: tags(p, "keywords"),
        }
    } else if hint.contains("cnbc") {
        Draft {
            topic: topic(&["section"], "business"),
            title: or(first(p, &["title", "headline"]), NO_TITLE),
            link: or(first(p, &["link", "url"]), ""),
            published: time(p, &["datePublished", "timestamp"]),
            source,
            publisher: "CNBC".into(),
            summary: first(p, &["description", "summary"]),
            tags: None,
        }
    } else {
        generic(p, &WS_CANDIDATES, source, || {
            (
                ctx.topic.clone().unwrap_or_else(|| "news".into()),
                ctx.publisher.clone().unwrap_or_else(|| ctx.name.clone()),
            )
        })
    }
}

// ---------------- webhook ----------------

fn map_webhook<'a>(p: &'a Value, ctx: &NormalizeContext) -> Draft<'a> {
    let hint = webhook_vendor_hint(p, ctx);

    if hint.contains("reuters") {
        Draft {
            topic: or(text(p, "category"), "business"),
            title: or(first(p, &["headline", "title"]), NO_TITLE),
            link: or(first(p, &["canonical_url", "url"]), ""),
            published: time(p, &["date_published"]),
            source: "webhook:reuters".into(),
            publisher: "Reuters".into(),
            summary: first(p, &["description", "lead"]),
            tags: tags(p, "topics"),
        }
    } else if hint.contains("bloomberg") {
        Draft {
            topic: or(first(p, &["primary_category", "category"]), "markets"),
            title: or(text(p, "headline"), NO_TITLE),
            link: or(first(p, &["story_url", "url"]), ""),
            published: time(p, &["published_at"]),
            source: "webhook:bloomberg".into(),
            publisher: "Bloomberg".into(),
            summary: first(p, &["abstract", "summary"]),
            tags: tags(p, "tags"),
        }
    } else if hint.contains("nbc") {
        Draft {
            topic: or(text(p, "section"), "business"),
            title: or(first(p, &["headline", "title"]), NO_TITLE),
            link: or(text(p, "url"), ""),
            published: time(p, &["dateFirstPublished"]),
            source: "webhook:cnbc".into(),
            publisher: "CNBC".into(),
            summary: text(p, "description"),
            tags: None,
        }
    } else if hint.contains("yahoo") {
        Draft {
            topic: or(text(p, "category"), "finance"),
            title: or(text(p, "title"), NO_TITLE),
            link: or(text(p, "link"), ""),
            published: time(p, &["pubDate"]),
            source: "webhook:yahoo".into(),
            publisher: "Yahoo Finance".into(),
            summary: text(p, "summary"),
            tags: None,
        }
    } else {
        let vendor = ctx
            .vendor
            .clone()
            .or_else(|| ctx.header("x-vendor").map(str::to_string))
            .unwrap_or_else(|| "unknown".into());
        generic(
            p,
            &WEBHOOK_CANDIDATES,
            format!("webhook:{vendor}"),
            || {
                (
                    or(first(p, &["category", "topic"]), "news"),
                    text(p, "publisher").unwrap_or_else(|| vendor.clone()),
                )
            },
        )
    }
}

// ---------------- newswire ----------------

fn map_newswire<'a>(p: &'a Value, ctx: &NormalizeContext) -> Draft<'a> {
    let vendor = ctx.vendor.clone().unwrap_or_else(|| ctx.name.clone());
    let source = format!("newswire:{vendor}");
    let topic = |dflt: &str| {
        ctx.topic
            .clone()
            .or_else(|| text(p, "category"))
            .unwrap_or_else(|| dflt.into())
    };
    let synthetic = |scheme: &str, key: &str| {
        format!("{scheme}{}", text(p, key).unwrap_or_default())
    };

    match vendor.to_lowercase().as_str() {
        "bloomberg" | "bloomberg_api" => Draft {
            topic: topic("markets"),
            title: or(first(p, &["headline", "title"]), NO_TITLE),
            link: text(p, "url").unwrap_or_else(|| synthetic("bloomberg://story/", "story_id")),
            published: time(p, &["published_date"]),
            source,
            publisher: "Bloomberg Terminal".into(),
            summary: text(p, "story_abstract"),
            tags: tags(p, "topics"),
        },
        "reuters" | "reuters_eikon" => Draft {
            topic: topic("business"),
            title: or(text(p, "headline"), NO_TITLE),
            link: text(p, "url").unwrap_or_else(|| synthetic("reuters://story/", "storyId")),
            published: time(p, &["versionCreated"]),
            source,
            publisher: "Reuters Terminal".into(),
            summary: text(p, "bodyText"),
            tags: tags(p, "subject"),
        },
        "dow_jones" | "factiva" => Draft {
            topic: topic("business"),
            title: or(first(p, &["headline", "title"]), NO_TITLE),
            link: text(p, "url").unwrap_or_else(|| synthetic("factiva://article/", "an")),
            published: time(p, &["publication_date"]),
            source,
            publisher: or(text(p, "source_name"), "Dow Jones"),
            summary: first(p, &["snippet", "lead_paragraph"]),
            tags: None,
        },
        _ => generic(p, &NEWSWIRE_CANDIDATES, source, || {
            (
                ctx.topic.clone().unwrap_or_else(|| "news".into()),
                ctx.publisher.clone().unwrap_or_else(|| vendor.clone()),
            )
        }),
    }
}

// ---------------- feed ----------------

/// Scheduler entries arrive pre-extracted as `{title, link, published, summary, category}`.
fn map_feed<'a>(p: &'a Value, ctx: &NormalizeContext) -> Draft<'a> {
    Draft {
        topic: text(p, "category")
            .or_else(|| ctx.topic.clone())
            .unwrap_or_else(|| "general".into()),
        title: or(text(p, "title"), "No title"),
        link: or(text(p, "link"), ""),
        published: time(p, &["published", "updated"]),
        source: ctx.name.clone(),
        publisher: text(p, "publisher")
            .or_else(|| ctx.publisher.clone())
            .unwrap_or_else(|| ctx.name.clone()),
        summary: first(p, &["summary", "description"]),
        tags: None,
    }
}

fn generic<'a>(
    p: &'a Value,
    c: &Candidates,
    source: String,
    topic_and_publisher: impl FnOnce() -> (String, String),
) -> Draft<'a> {
    let (topic, publisher) = topic_and_publisher();
    Draft {
        topic,
        title: or(first(p, c.title), NO_TITLE).trim().to_string(),
        link: or(first(p, c.link), "").trim().to_string(),
        published: time(p, c.time),
        source,
        publisher,
        summary: first(p, c.summary),
        tags: None,
    }
}
