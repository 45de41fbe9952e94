// src/scheduler/feed.rs
//! RSS 2.0 / Atom parsing into flat entries the normalizer understands.

use quick_xml::de::from_str;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ParseError;

/// Element text, tolerant of attributes and CDATA.
#[derive(Debug, Default, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: Option<String>,
}

impl Text {
    fn get(&self) -> Option<String> {
        self.value
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

fn text_of(t: &Option<Text>) -> Option<String> {
    t.as_ref().and_then(Text::get)
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    title: Option<Text>,
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    #[serde(default)]
    title: Option<Text>,
    #[serde(default)]
    link: Option<Text>,
    #[serde(rename = "pubDate", default)]
    pub_date: Option<Text>,
    #[serde(rename = "dc:date", default)]
    dc_date: Option<Text>,
    #[serde(default)]
    description: Option<Text>,
    #[serde(rename = "category", default)]
    categories: Vec<Text>,
}

#[derive(Debug, Deserialize)]
struct Atom {
    #[serde(default)]
    title: Option<Text>,
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    #[serde(default)]
    title: Option<Text>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    #[serde(default)]
    published: Option<Text>,
    #[serde(default)]
    updated: Option<Text>,
    #[serde(default)]
    summary: Option<Text>,
    #[serde(default)]
    content: Option<Text>,
    #[serde(rename = "category", default)]
    categories: Vec<AtomCategory>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href", default)]
    href: Option<String>,
    #[serde(rename = "@rel", default)]
    rel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomCategory {
    #[serde(rename = "@term", default)]
    term: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedEntry {
    pub title: Option<String>,
    pub link: Option<String>,
    pub published: Option<String>,
    pub summary: Option<String>,
    pub category: Option<String>,
}

impl FeedEntry {
    /// Shape consumed by the `feed` mapping in `normalize`.
    pub fn to_payload(&self) -> Value {
        let mut v = json!({});
        let pairs = [
            ("title", &self.title),
            ("link", &self.link),
            ("published", &self.published),
            ("summary", &self.summary),
            ("category", &self.category),
        ];
        for (k, val) in pairs {
            if let Some(s) = val {
                v[k] = Value::String(s.clone());
            }
        }
        v
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub entries: Vec<FeedEntry>,
}

/// Parse an RSS or Atom document. At most `max_entries` entries are kept.
pub fn parse_feed(body: &str, max_entries: usize) -> Result<ParsedFeed, ParseError> {
    let xml = scrub_html_entities_for_xml(body);
    let head: String = xml.chars().take(2048).collect();

    let mut feed = if head.contains("<rss") || head.contains("<channel") {
        let rss: Rss = from_str(&xml).map_err(|e| ParseError::Xml(e.to_string()))?;
        ParsedFeed {
            title: text_of(&rss.channel.title),
            entries: rss.channel.items.into_iter().map(rss_entry).collect(),
        }
    } else if head.contains("<feed") {
        let atom: Atom = from_str(&xml).map_err(|e| ParseError::Xml(e.to_string()))?;
        ParsedFeed {
            title: text_of(&atom.title),
            entries: atom.entries.into_iter().map(atom_entry).collect(),
        }
    } else {
        return Err(ParseError::Unrecognized(
            head.chars().take(64).collect::<String>(),
        ));
    };
    feed.entries.truncate(max_entries);
    Ok(feed)
}

fn rss_entry(it: RssItem) -> FeedEntry {
    FeedEntry {
        title: text_of(&it.title),
        link: text_of(&it.link),
        published: text_of(&it.pub_date).or_else(|| text_of(&it.dc_date)),
        summary: text_of(&it.description),
        category: it.categories.iter().find_map(Text::get),
    }
}

fn atom_entry(e: AtomEntry) -> FeedEntry {
    let link = e
        .links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| e.links.first())
        .and_then(|l| l.href.clone());
    FeedEntry {
        title: text_of(&e.title),
        link,
        published: text_of(&e.published).or_else(|| text_of(&e.updated)),
        summary: text_of(&e.summary).or_else(|| text_of(&e.content)),
        category: e.categories.iter().find_map(|c| c.term.clone()),
    }
}

/// HTML entities that are undefined in XML and would abort the parser.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Federal Reserve Press</title>
    <link>https://www.federalreserve.gov</link>
    <item>
      <title>FOMC statement&nbsp;released</title>
      <link>https://www.federalreserve.gov/a</link>
      <pubDate>Mon, 01 Jan 2024 00:00:30 +0000</pubDate>
      <description><![CDATA[<p>Rates unchanged</p>]]></description>
      <category>Monetary Policy</category>
    </item>
    <item>
      <title>Second</title>
      <link>https://www.federalreserve.gov/b</link>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title type="text">Example Atom</title>
  <entry>
    <title>Atom entry</title>
    <link rel="self" href="https://example.test/self"/>
    <link rel="alternate" href="https://example.test/e1"/>
    <updated>2024-01-01T00:00:00Z</updated>
    <summary>Short</summary>
    <category term="markets"/>
  </entry>
</feed>"#;

    #[test]
    fn parses_rss_items() {
        let f = parse_feed(RSS, 100).unwrap();
        assert_eq!(f.title.as_deref(), Some("Federal Reserve Press"));
        assert_eq!(f.entries.len(), 2);
        let e = &f.entries[0];
        assert_eq!(e.title.as_deref(), Some("FOMC statement released"));
        assert_eq!(e.category.as_deref(), Some("Monetary Policy"));
        assert_eq!(e.published.as_deref(), Some("Mon, 01 Jan 2024 00:00:30 +0000"));
        assert!(f.entries[1].published.is_none());
    }

    #[test]
    fn parses_atom_and_prefers_alternate_link() {
        let f = parse_feed(ATOM, 100).unwrap();
        assert_eq!(f.title.as_deref(), Some("Example Atom"));
        let e = &f.entries[0];
        assert_eq!(e.link.as_deref(), Some("https://example.test/e1"));
        assert_eq!(e.published.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(e.category.as_deref(), Some("markets"));
    }

    #[test]
    fn caps_entries() {
        assert_eq!(parse_feed(RSS, 1).unwrap().entries.len(), 1);
    }

    #[test]
    fn rejects_non_feeds() {
        assert!(matches!(
            parse_feed("<html><body>nope</body></html>", 10),
            Err(ParseError::Unrecognized(_))
        ));
    }

    #[test]
    fn payload_omits_missing_fields() {
        let e = FeedEntry {
            title: Some("T".into()),
            ..FeedEntry::default()
        };
        let p = e.to_payload();
        assert_eq!(p["title"], "T");
        assert!(p.get("link").is_none());
    }
}
