// src/scheduler/fetch.rs
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
    REFERER, RETRY_AFTER,
};
use reqwest::StatusCode;

use crate::config::SchedulerSettings;
use crate::error::{ParseError, TransportError};

const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5";
const USER_AGENT: &str = concat!("newsflow/", env!("CARGO_PKG_VERSION"), " (+feed reader)");

/// Conditional-request validators cached per feed URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResponse {
    NotModified,
    Fresh { body: String, validators: Validators },
    Status { code: u16, retry_after: Option<Duration> },
}

#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str, validators: &Validators)
        -> Result<FetchResponse, TransportError>;
}

/// Polite `Referer`: scheme://host/ of the feed.
pub fn referer_for(url: &str) -> Option<String> {
    let u = url::Url::parse(url).ok()?;
    let host = u.host_str()?;
    Some(match u.port() {
        Some(p) => format!("{}://{}:{}/", u.scheme(), host, p),
        None => format!("{}://{}/", u.scheme(), host),
    })
}

/// Delta-seconds or an HTTP-date.
pub fn parse_retry_after(v: &str) -> Option<Duration> {
    let v = v.trim();
    if let Ok(secs) = v.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(v).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or_default())
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(settings: &SchedulerSettings) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

fn header_str(h: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    h.get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        validators: &Validators,
    ) -> Result<FetchResponse, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(FEED_ACCEPT));
        let referer = referer_for(url);
        let conditional = [
            (IF_NONE_MATCH, validators.etag.as_deref()),
            (IF_MODIFIED_SINCE, validators.last_modified.as_deref()),
            (REFERER, referer.as_deref()),
        ];
        for (name, value) in conditional {
            if let Some(v) = value.and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(name, v);
            }
        }

        let resp = self.client.get(url).headers(headers).send().await?;
        let status = resp.status();
        match status {
            StatusCode::NOT_MODIFIED => Ok(FetchResponse::NotModified),
            StatusCode::OK => {
                let validators = Validators {
                    etag: header_str(resp.headers(), ETAG),
                    last_modified: header_str(resp.headers(), LAST_MODIFIED),
                };
                let bytes = resp.bytes().await?;
                let body = match String::from_utf8(bytes.to_vec()) {
                    Ok(s) => s,
                    Err(e) => {
                        let err = ParseError::Encoding(e.to_string());
                        tracing::warn!(target: "scheduler", url, error = %err, "lossy feed body");
                        String::from_utf8_lossy(e.as_bytes()).into_owned()
                    }
                };
                Ok(FetchResponse::Fresh { body, validators })
            }
            other => Ok(FetchResponse::Status {
                code: other.as_u16(),
                retry_after: header_str(resp.headers(), RETRY_AFTER)
                    .as_deref()
                    .and_then(parse_retry_after),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referer_is_scheme_and_host() {
        assert_eq!(
            referer_for("https://www.federalreserve.gov/feeds/press_all.xml").as_deref(),
            Some("https://www.federalreserve.gov/")
        );
        assert_eq!(
            referer_for("http://127.0.0.1:8080/rss").as_deref(),
            Some("http://127.0.0.1:8080/")
        );
        assert_eq!(referer_for("not a url"), None);
    }

    #[test]
    fn retry_after_seconds_and_dates() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        // Past date clamps to zero.
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon"), None);
    }
}
