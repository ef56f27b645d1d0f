use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use futures::future::join_all;
use metrics::{counter, histogram};
use tracing::{debug, error};

use crate::config::{CacheHeaderSettings, ProxySettings};
use crate::tags::TagSanitizer;

use super::client::{ProxySender, SendOutcome};
use super::{BanKind, BanRequest, chunk_tag_expressions, host_match_header};

const METRIC_BAN_REQUESTS: &str = "spurgo_ban_requests_total";
const METRIC_BAN_FAILURES: &str = "spurgo_ban_failures_total";
const METRIC_BAN_DURATION_MS: &str = "spurgo_ban_request_ms";

/// Classified result of one ban request against one endpoint.
#[derive(Debug, Clone)]
pub enum BanOutcome {
    Success {
        endpoint: String,
        status: StatusCode,
    },
    /// Proxy reachable but answered with an error status.
    ErrorResponse {
        endpoint: String,
        status: StatusCode,
    },
    /// Network-level failure before any response arrived.
    Unreachable {
        endpoint: String,
        detail: String,
    },
    Other {
        endpoint: String,
        detail: String,
    },
}

impl BanOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BanOutcome::Success { .. })
    }
}

/// Batch result of one dispatcher call.
///
/// Failures are recorded here and logged where they happened; they never
/// propagate as errors to the caller.
#[derive(Debug, Default)]
pub struct BanReport {
    pub outcomes: Vec<BanOutcome>,
}

impl BanReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(BanOutcome::is_success)
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.is_success())
            .count()
    }
}

/// Issues cache bans to every configured proxy endpoint.
///
/// Dispatch is best-effort. Requests go to all endpoints concurrently,
/// failures are classified and logged once each, and a partially failed
/// batch never aborts the content mutation that triggered it.
pub struct BanDispatcher {
    endpoints: Vec<String>,
    token: String,
    ignored_tags: Vec<String>,
    max_header_length: usize,
    sanitizer: TagSanitizer,
    sender: Arc<dyn ProxySender>,
}

impl BanDispatcher {
    pub fn new(
        proxy: &ProxySettings,
        cache_headers: &CacheHeaderSettings,
        token: String,
        sender: Arc<dyn ProxySender>,
    ) -> Self {
        Self {
            endpoints: proxy.endpoints.clone(),
            token,
            ignored_tags: proxy.ignored_tags.clone(),
            max_header_length: proxy.max_header_length.get(),
            sanitizer: TagSanitizer::new(
                cache_headers.shorten_tags,
                cache_headers.tag_length.get(),
            ),
            sender,
        }
    }

    /// Bans every cached object, optionally narrowed to the given domains
    /// and content type.
    pub async fn ban_all(&self, domains: &[String], content_type: Option<&str>) -> BanReport {
        debug!(domains = ?domains, content_type, "Banning all cached objects");

        let request = BanRequest {
            site_token: self.token.clone(),
            host_match: host_match_header(domains),
            kind: BanKind::All {
                content_type: content_type.map(str::to_string),
            },
        };

        self.execute(vec![request]).await
    }

    /// Bans every cached object carrying one of the given tags.
    ///
    /// Ignored tags are dropped before sanitizing; when nothing remains, no
    /// request is issued at all.
    pub async fn ban_by_tags(&self, tags: &[String], domains: &[String]) -> BanReport {
        let kept: Vec<String> = tags
            .iter()
            .filter(|tag| !self.ignored_tags.contains(tag))
            .cloned()
            .collect();
        if kept.is_empty() {
            debug!("No tags left to ban after filtering");
            return BanReport::default();
        }

        let mut tags = self
            .sanitizer
            .shorten_tags(self.sanitizer.sanitize_tags(&kept));
        tags.sort();
        tags.dedup();

        debug!(tags = ?tags, domains = ?domains, "Banning cached objects by tag");

        let host_match = host_match_header(domains);
        let requests = chunk_tag_expressions(&tags, self.max_header_length)
            .into_iter()
            .map(|expression| BanRequest {
                site_token: self.token.clone(),
                host_match: host_match.clone(),
                kind: BanKind::Tags { expression },
            })
            .collect();

        self.execute(requests).await
    }

    async fn execute(&self, requests: Vec<BanRequest>) -> BanReport {
        let calls = requests.iter().flat_map(|request| {
            self.endpoints
                .iter()
                .map(move |endpoint| self.dispatch_one(endpoint, request))
        });

        BanReport {
            outcomes: join_all(calls).await,
        }
    }

    async fn dispatch_one(&self, endpoint: &str, request: &BanRequest) -> BanOutcome {
        let started_at = Instant::now();
        counter!(METRIC_BAN_REQUESTS).increment(1);

        let outcome = match self.sender.send(endpoint, request).await {
            SendOutcome::Delivered { status } if status.is_success() => BanOutcome::Success {
                endpoint: endpoint.to_string(),
                status,
            },
            SendOutcome::Delivered { status } => BanOutcome::ErrorResponse {
                endpoint: endpoint.to_string(),
                status,
            },
            SendOutcome::Unreachable { detail } => BanOutcome::Unreachable {
                endpoint: endpoint.to_string(),
                detail,
            },
            SendOutcome::Failed { detail } => BanOutcome::Other {
                endpoint: endpoint.to_string(),
                detail,
            },
        };
        histogram!(METRIC_BAN_DURATION_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        match &outcome {
            BanOutcome::Success { .. } => {}
            BanOutcome::ErrorResponse { endpoint, status } => {
                counter!(METRIC_BAN_FAILURES, "kind" => "error_response").increment(1);
                error!(
                    endpoint = %endpoint,
                    status = %status,
                    "Caching proxy returned an error response to a ban request"
                );
            }
            BanOutcome::Unreachable { endpoint, detail } => {
                counter!(METRIC_BAN_FAILURES, "kind" => "unreachable").increment(1);
                error!(
                    endpoint = %endpoint,
                    detail = %detail,
                    "Cannot connect to the caching proxy for a ban request"
                );
            }
            BanOutcome::Other { endpoint, detail } => {
                counter!(METRIC_BAN_FAILURES, "kind" => "other").increment(1);
                error!(
                    endpoint = %endpoint,
                    detail = %detail,
                    "Ban request to the caching proxy failed"
                );
            }
        }

        outcome
    }
}
