//! Response cache-control annotation.
//!
//! After a page renders, the metadata of every cache entry it consulted is
//! folded into response headers: the tag union, the site token and a shared
//! lifetime. A short-circuit ladder decides first whether the response may
//! be annotated at all, so personalized or unpublished responses never
//! advertise cacheability.

mod middleware;

use std::collections::BTreeSet;

use axum::http::{HeaderMap, HeaderValue, header};
use tracing::debug;

use crate::config::CacheHeaderSettings;
use crate::store::EntryMetadata;
use crate::tags::TagSanitizer;

pub use middleware::{AnnotatorState, RenderFlags, annotate_response_layer};

/// Response header naming the tags a cached page depends on.
pub const HEADER_CACHE_TAGS: &str = "X-Cache-Tags";
/// Header scoping cache entries and bans to this installation.
pub const HEADER_SITE: &str = "X-Site";
/// Marker header identifying annotated responses while debugging.
pub const HEADER_CACHE_DEBUG: &str = "X-Cache-Debug";

/// Workspace whose content is publicly visible.
pub const LIVE_WORKSPACE: &str = "live";

/// Cache-relevant facts about the document a response was rendered from.
#[derive(Debug, Clone)]
pub struct DocumentContext {
    /// Workspace the document was resolved in.
    pub workspace: String,
    /// Editorial opt-out from shared caching.
    pub disable_cache: bool,
    /// Per-document TTL override in seconds, used verbatim when present.
    pub shared_max_age: Option<u64>,
}

impl DocumentContext {
    pub fn is_live(&self) -> bool {
        self.workspace == LIVE_WORKSPACE
    }
}

/// Terminal outcome of the annotation ladder for one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDecision {
    /// Leave the response untouched.
    Skip { reason: SkipReason },
    /// Explicitly forbid shared caching.
    NoCache,
    /// Advertise tags, scope and lifetime to the caching proxy.
    Annotate {
        tags: Vec<String>,
        shared_max_age: Option<u64>,
        token: String,
        debug: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    CookiePresent,
    UnresolvableDocument,
    NotLiveWorkspace,
}

/// Everything the annotation decision depends on. No hidden state: the same
/// inputs always produce the same decision.
#[derive(Debug)]
pub struct AnnotationInputs<'a> {
    pub settings: &'a CacheHeaderSettings,
    /// Master engine switch.
    pub enabled: bool,
    pub has_set_cookie: bool,
    pub document: Option<&'a DocumentContext>,
    /// Whether any uncacheable segment was evaluated during render.
    pub uncacheable_evaluated: bool,
    /// Metadata of every cache entry consulted during render.
    pub entries: &'a [EntryMetadata],
    pub token: &'a str,
}

/// Walks the annotation ladder and returns the first terminal decision.
pub fn decide(inputs: &AnnotationInputs<'_>) -> CacheDecision {
    if !inputs.enabled || inputs.settings.disabled {
        return CacheDecision::Skip {
            reason: SkipReason::Disabled,
        };
    }
    if inputs.has_set_cookie {
        debug!(reason = "set_cookie", "Leaving response unannotated");
        return CacheDecision::Skip {
            reason: SkipReason::CookiePresent,
        };
    }
    let Some(document) = inputs.document else {
        debug!(reason = "unresolvable_document", "Leaving response unannotated");
        return CacheDecision::Skip {
            reason: SkipReason::UnresolvableDocument,
        };
    };
    if !document.is_live() {
        debug!(workspace = %document.workspace, "Leaving response unannotated");
        return CacheDecision::Skip {
            reason: SkipReason::NotLiveWorkspace,
        };
    }
    if document.disable_cache {
        debug!(reason = "document_opt_out", "Disallowing shared caching");
        return CacheDecision::NoCache;
    }
    if inputs.uncacheable_evaluated {
        debug!(reason = "uncacheable_segment", "Disallowing shared caching");
        return CacheDecision::NoCache;
    }

    let (tags, min_lifetime) = aggregate_entries(inputs.entries);
    let sanitizer = TagSanitizer::new(
        inputs.settings.shorten_tags,
        inputs.settings.tag_length.get(),
    );
    let tags = sanitizer.shorten_tags(sanitizer.sanitize_tags(&tags));
    let shared_max_age = resolve_time_to_live(
        document.shared_max_age,
        inputs.settings.default_shared_max_age,
        min_lifetime,
    );

    CacheDecision::Annotate {
        tags,
        shared_max_age,
        token: inputs.token.to_string(),
        debug: inputs.settings.debug,
    }
}

/// Writes a decision onto response headers.
pub fn apply(decision: &CacheDecision, headers: &mut HeaderMap) {
    match decision {
        CacheDecision::Skip { .. } => {}
        CacheDecision::NoCache => {
            insert_header(headers, header::CACHE_CONTROL, "no-cache");
        }
        CacheDecision::Annotate {
            tags,
            shared_max_age,
            token,
            debug,
        } => {
            if !tags.is_empty() {
                insert_header(headers, HEADER_CACHE_TAGS, &tags.join(","));
            }
            insert_header(headers, HEADER_SITE, token);
            if let Some(seconds) = shared_max_age {
                insert_header(
                    headers,
                    header::CACHE_CONTROL,
                    &format!("public, s-maxage={seconds}"),
                );
            }
            if *debug {
                insert_header(headers, HEADER_CACHE_DEBUG, "1");
            }
        }
    }
}

/// Unions the tags and takes the minimum known lifetime over all consulted
/// entries. Commutative, so collection order never changes the outcome.
fn aggregate_entries(entries: &[EntryMetadata]) -> (Vec<String>, Option<u64>) {
    let mut tags = BTreeSet::new();
    let mut min_lifetime: Option<u64> = None;

    for entry in entries {
        tags.extend(entry.tags.iter().cloned());
        if let Some(lifetime) = entry.lifetime {
            min_lifetime = Some(min_lifetime.map_or(lifetime, |current| current.min(lifetime)));
        }
    }

    (tags.into_iter().collect(), min_lifetime)
}

/// A per-document override wins verbatim; otherwise the configured default
/// is clamped by the shortest consulted lifetime.
fn resolve_time_to_live(
    document_override: Option<u64>,
    configured_default: Option<u64>,
    min_lifetime: Option<u64>,
) -> Option<u64> {
    if let Some(ttl) = document_override {
        return Some(ttl);
    }
    match (configured_default, min_lifetime) {
        (Some(default), Some(min)) => Some(default.min(min)),
        (Some(default), None) => Some(default),
        (None, min) => min,
    }
}

fn insert_header<K>(headers: &mut HeaderMap, name: K, value: &str)
where
    K: axum::http::header::IntoHeaderName,
{
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
