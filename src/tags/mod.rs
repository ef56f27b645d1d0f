//! Cache tag model, derivation and rewriting.
//!
//! Tags name the content a cached response depends on. They are attached to
//! cache entries at render time, surfaced on responses through
//! [`crate::headers`] and matched again by ban requests in
//! [`crate::varnish`], so all three speak the grammar defined here.

mod derive;
mod sanitize;

use std::collections::BTreeSet;

pub use derive::{NodeTypeRegistry, derive_tags};
pub use sanitize::TagSanitizer;

/// Catch-all tag attached to every derivation, so a single ban can drop
/// everything this installation published.
pub const TAG_EVERYTHING: &str = "Everything";

/// Ordered, duplicate-free tag collection.
pub type TagSet = BTreeSet<String>;

/// Workspace visibility of a change.
///
/// Published content lives in the live workspace and carries unprefixed
/// tags. Content in a personal or shared workspace carries tags prefixed
/// with the workspace name, and a chain covers every workspace an edit
/// shines through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceScope {
    Live,
    Workspace(String),
    Chain(Vec<String>),
}

impl WorkspaceScope {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// One tag prefix per affected workspace. An empty chain degrades to
    /// the live prefix.
    pub(crate) fn prefixes(&self) -> Vec<String> {
        match self {
            Self::Live => vec![String::new()],
            Self::Workspace(name) => vec![format!("{name}_")],
            Self::Chain(names) if names.is_empty() => vec![String::new()],
            Self::Chain(names) => names.iter().map(|name| format!("{name}_")).collect(),
        }
    }
}

/// Description of one content mutation, as handed to tag derivation.
#[derive(Debug, Clone)]
pub struct ChangedNode {
    pub identifier: String,
    /// Fully qualified node type name, e.g. `Acme.Site:Page`.
    pub node_type: String,
    /// Identifiers on the path from the tree root down to the node's
    /// immediate parent, excluding the root itself. A walk that broke off
    /// early simply yields a shorter list.
    pub ancestors: Vec<String>,
    pub workspace: WorkspaceScope,
}
