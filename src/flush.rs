//! Deferred cache invalidation for content mutations.
//!
//! Mutations register what changed; the accumulated tags are banned in one
//! batch when the surrounding transaction completes, so publishing many
//! nodes at once never triggers one ban storm per node.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::lock::mutex_lock;
use crate::tags::{ChangedNode, NodeTypeRegistry, derive_tags};
use crate::varnish::{BanDispatcher, BanReport};

const SOURCE: &str = "flush";

/// Content mutations that invalidate cached pages.
#[derive(Debug, Clone)]
pub enum ContentEvent {
    /// A node was published to the live workspace.
    NodePublished {
        node: ChangedNode,
        domains: Vec<String>,
    },
    /// An editor or operator requested a wholesale flush.
    FullFlushRequested {
        domains: Vec<String>,
        content_type: Option<String>,
    },
}

/// Work accumulated during one content-mutation transaction.
#[derive(Debug, Default)]
struct PendingInvalidation {
    /// Tag to ban, mapped to the reason it was queued.
    tags: BTreeMap<String, String>,
    domains: BTreeSet<String>,
    full_flushes: Vec<FullFlush>,
}

#[derive(Debug)]
struct FullFlush {
    domains: Vec<String>,
    content_type: Option<String>,
}

/// Collects invalidation work for one transaction and dispatches it once.
///
/// Each in-flight transaction owns its own flusher; the accumulator never
/// crosses transaction boundaries.
pub struct ContentCacheFlusher {
    registry: Arc<NodeTypeRegistry>,
    state: Mutex<PendingInvalidation>,
}

impl ContentCacheFlusher {
    pub fn new(registry: Arc<NodeTypeRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(PendingInvalidation::default()),
        }
    }

    /// Records one content mutation.
    pub fn handle(&self, event: &ContentEvent) {
        match event {
            ContentEvent::NodePublished { node, domains } => self.flush_for_node(node, domains),
            ContentEvent::FullFlushRequested {
                domains,
                content_type,
            } => self.request_full_flush(domains.clone(), content_type.clone()),
        }
    }

    /// Queues every tag derived from a changed node.
    pub fn flush_for_node(&self, node: &ChangedNode, domains: &[String]) {
        let tags = derive_tags(node, &self.registry);
        let queued = tags.len();

        let mut state = mutex_lock(&self.state, SOURCE, "flush_for_node");
        for tag in tags {
            let reason = format!("node \"{}\" changed", node.identifier);
            state.tags.entry(tag).or_insert(reason);
        }
        state.domains.extend(domains.iter().cloned());
        drop(state);

        debug!(node = %node.identifier, queued, "Queued cache flush for changed node");
    }

    /// Queues a wildcard flush.
    pub fn request_full_flush(&self, domains: Vec<String>, content_type: Option<String>) {
        mutex_lock(&self.state, SOURCE, "request_full_flush")
            .full_flushes
            .push(FullFlush {
                domains,
                content_type,
            });
    }

    /// Dispatches everything accumulated since the last flush.
    ///
    /// The state is drained first, so a second flush within the same
    /// transaction finds nothing left and issues no requests.
    pub async fn flush(&self, dispatcher: &BanDispatcher) -> BanReport {
        let pending = mem::take(&mut *mutex_lock(&self.state, SOURCE, "flush"));

        let mut outcomes = Vec::new();

        for full in &pending.full_flushes {
            let report = dispatcher
                .ban_all(&full.domains, full.content_type.as_deref())
                .await;
            outcomes.extend(report.outcomes);
        }

        if !pending.tags.is_empty() {
            for (tag, reason) in &pending.tags {
                debug!(tag = %tag, reason = %reason, "Banning cache entries");
            }
            let tags: Vec<String> = pending.tags.into_keys().collect();
            let domains: Vec<String> = pending.domains.into_iter().collect();
            let report = dispatcher.ban_by_tags(&tags, &domains).await;
            outcomes.extend(report.outcomes);
        }

        if !outcomes.is_empty() {
            info!(requests = outcomes.len(), "Content cache flush dispatched");
        }

        BanReport { outcomes }
    }
}

/// Runs `work` and flushes afterwards, on success and failure alike.
///
/// The result of `work` passes through untouched; ban failures surface only
/// in the dispatcher's logs.
pub async fn flush_after<T, E, F>(
    flusher: &ContentCacheFlusher,
    dispatcher: &BanDispatcher,
    work: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    let result = work.await;
    flusher.flush(dispatcher).await;
    result
}
