// src/normalize/text.rs
use once_cell::sync::OnceCell;
use regex::Regex;

/// Default cap for free-text fields.
pub const MAX_TEXT_CHARS: usize = 1500;

/// Clean vendor text: decode entities, strip tags, ASCII quotes, collapse whitespace.
/// Punctuation is kept; titles feed the identity hash and must stay recognisable.
pub fn clean_text(s: &str) -> String {
    clean_text_capped(s, MAX_TEXT_CHARS)
}

pub fn clean_text_capped(s: &str, max_chars: usize) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<Option<Regex>> = OnceCell::new();
    if let Some(re) = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").ok()) {
        out = re.replace_all(&out, "").to_string();
    }

    // 3) Curly/guillemet quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<Option<Regex>> = OnceCell::new();
    if let Some(re) = RE_WS.get_or_init(|| Regex::new(r"\s+").ok()) {
        out = re.replace_all(&out, " ").to_string();
    }
    let out = out.trim();

    // 5) Length cap
    if out.chars().count() > max_chars {
        out.chars().take(max_chars).collect()
    } else {
        out.to_string()
    }
}
