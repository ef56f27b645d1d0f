use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::Response,
};
use tracing::instrument;

use crate::config::CacheHeaderSettings;
use crate::store::TaggedCacheStore;

use super::{AnnotationInputs, DocumentContext, apply, decide};

/// Shared state for the annotation middleware.
#[derive(Clone)]
pub struct AnnotatorState {
    pub enabled: bool,
    pub settings: CacheHeaderSettings,
    pub store: Arc<TaggedCacheStore>,
    pub token: String,
}

/// Handle through which render code flags dynamic segments.
///
/// The middleware inserts one into request extensions before the handler
/// runs. Any code that evaluates an uncacheable segment calls
/// [`RenderFlags::mark_uncacheable`] and the response is downgraded to
/// `no-cache`.
#[derive(Debug, Clone, Default)]
pub struct RenderFlags {
    uncacheable: Arc<AtomicBool>,
}

impl RenderFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_uncacheable(&self) {
        self.uncacheable.store(true, Ordering::Relaxed);
    }

    pub fn uncacheable_evaluated(&self) -> bool {
        self.uncacheable.load(Ordering::Relaxed)
    }
}

/// Annotates responses with cache tags, site scope and lifetime headers.
///
/// Handlers publish their rendering context by inserting a
/// [`DocumentContext`] into response extensions. Everything the store served
/// while the handler ran is folded into the annotation afterwards.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn annotate_response_layer(
    State(state): State<AnnotatorState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    // Metadata recorded for a previous response must never leak into this one.
    state.store.reset();

    let flags = RenderFlags::new();
    request.extensions_mut().insert(flags.clone());

    let mut response = next.run(request).await;

    let document = response.extensions().get::<DocumentContext>().cloned();
    let entries = state.store.seen_metadata();
    let decision = decide(&AnnotationInputs {
        settings: &state.settings,
        enabled: state.enabled,
        has_set_cookie: response.headers().contains_key(header::SET_COOKIE),
        document: document.as_ref(),
        uncacheable_evaluated: flags.uncacheable_evaluated(),
        entries: &entries,
        token: &state.token,
    });
    apply(&decision, response.headers_mut());

    response
}
