//! Varnish-style cache invalidation over HTTP `BAN` requests.
//!
//! Bans are expressed entirely through request headers: a site token scoping
//! the ban to this installation, an optional host-match expression, and
//! either a URL wildcard (full flush) or a tag alternation matched against
//! the `X-Cache-Tags` header recorded by the proxy at cache time.

mod client;
mod dispatcher;

pub use client::{ClientError, HttpProxyClient, ProxySender, SendOutcome};
pub use dispatcher::{BanDispatcher, BanOutcome, BanReport};

use crate::headers::{HEADER_CACHE_TAGS, HEADER_SITE};

/// Ban header carrying the host-match expression.
pub const HEADER_BAN_HOST: &str = "X-Host";
/// Ban header carrying the URL pattern for full flushes.
pub const HEADER_BAN_URL: &str = "X-Url";
/// Ban header narrowing a full flush to one content type.
pub const HEADER_BAN_CONTENT_TYPE: &str = "X-Content-Type";

/// Fallback endpoint when no proxy URL is configured.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1";

/// URL pattern matching every cached object.
const MATCH_ALL_URLS: &str = ".*";

/// One invalidation request, sent to every configured endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRequest {
    /// Installation scope token, carried on every ban.
    pub site_token: String,
    /// Host-match expression; `None` bans across all hosts.
    pub host_match: Option<String>,
    pub kind: BanKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BanKind {
    /// Wildcard URL ban, optionally narrowed to one content type.
    All { content_type: Option<String> },
    /// Tag alternation produced by [`chunk_tag_expressions`].
    Tags { expression: String },
}

impl BanRequest {
    /// Header pairs in wire order.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![(HEADER_SITE, self.site_token.clone())];
        if let Some(host) = &self.host_match {
            headers.push((HEADER_BAN_HOST, host.clone()));
        }
        match &self.kind {
            BanKind::All { content_type } => {
                headers.push((HEADER_BAN_URL, MATCH_ALL_URLS.to_string()));
                if let Some(content_type) = content_type {
                    headers.push((HEADER_BAN_CONTENT_TYPE, content_type.clone()));
                }
            }
            BanKind::Tags { expression } => {
                headers.push((HEADER_CACHE_TAGS, expression.clone()));
            }
        }
        headers
    }
}

/// Normalizes the configured proxy endpoints.
///
/// Accepts comma-separated strings, trims whitespace, strips trailing
/// slashes and defaults bare host/port values to `http`. An empty
/// configuration falls back to [`DEFAULT_ENDPOINT`].
pub fn prepare_proxy_urls(configured: &[String]) -> Vec<String> {
    let urls: Vec<String> = configured
        .iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| {
            let value = value.trim_end_matches('/');
            if value.contains("://") {
                value.to_string()
            } else {
                format!("http://{value}")
            }
        })
        .collect();

    if urls.is_empty() {
        vec![DEFAULT_ENDPOINT.to_string()]
    } else {
        urls
    }
}

/// Builds the host-match expression for a ban.
///
/// A single domain matches literally, several become an anchored
/// alternation, none means the ban applies to every host.
pub fn host_match_header(domains: &[String]) -> Option<String> {
    match domains {
        [] => None,
        [single] => Some(single.clone()),
        many => Some(format!("^({})$", many.join("|"))),
    }
}

/// Joins tags into `(tag1|tag2)(,|$)` ban expressions, starting a new
/// expression whenever the next tag would push the header value past
/// `max_header_length`.
///
/// Every expression carries at least one tag, so a single oversized tag is
/// still sent rather than dropped.
pub fn chunk_tag_expressions(tags: &[String], max_header_length: usize) -> Vec<String> {
    const WRAPPER_LENGTH: usize = "()(,|$)".len();

    let wrap = |chunk: &[&str]| format!("({})(,|$)", chunk.join("|"));

    let mut expressions = Vec::new();
    let mut chunk: Vec<&str> = Vec::new();
    let mut joined_length = 0;

    for tag in tags {
        let projected = joined_length + 1 + tag.len() + WRAPPER_LENGTH;
        if !chunk.is_empty() && projected > max_header_length {
            expressions.push(wrap(&chunk));
            chunk.clear();
            joined_length = 0;
        }
        if !chunk.is_empty() {
            joined_length += 1;
        }
        joined_length += tag.len();
        chunk.push(tag.as_str());
    }
    if !chunk.is_empty() {
        expressions.push(wrap(&chunk));
    }

    expressions
}
