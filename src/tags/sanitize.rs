//! Proxy-safe tag rewriting.

use sha2::{Digest, Sha256};

/// Rewrites tags so caching proxies treat them as opaque values.
///
/// `.` and `:` are structurally significant to common proxy tag matchers
/// and are mapped to safe substitutes. Shortening replaces each tag with a
/// fixed-length digest prefix to bound header size; a collision can only
/// widen an invalidation, never narrow one.
#[derive(Debug, Clone)]
pub struct TagSanitizer {
    shorten: bool,
    length: usize,
}

impl TagSanitizer {
    pub fn new(shorten: bool, length: usize) -> Self {
        Self { shorten, length }
    }

    /// Maps blocked punctuation to safe substitutes, preserving order.
    pub fn sanitize_tags(&self, tags: &[String]) -> Vec<String> {
        tags.iter().map(|tag| sanitize_tag(tag)).collect()
    }

    /// Replaces each tag with its digest prefix when shortening is enabled,
    /// preserving order.
    pub fn shorten_tags(&self, tags: Vec<String>) -> Vec<String> {
        if !self.shorten {
            return tags;
        }
        tags.into_iter().map(|tag| self.shorten_tag(&tag)).collect()
    }

    fn shorten_tag(&self, tag: &str) -> String {
        let digest = hex::encode(Sha256::digest(tag.as_bytes()));
        let length = self.length.min(digest.len());
        digest[..length].to_string()
    }
}

fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .map(|ch| match ch {
            '.' => '_',
            ':' => '-',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_maps_blocked_punctuation() {
        let sanitizer = TagSanitizer::new(false, 8);

        assert_eq!(
            sanitizer.sanitize_tags(&["a.b:c".to_string()]),
            vec!["a_b-c".to_string()]
        );
        assert_eq!(
            sanitizer.sanitize_tags(&["NodeType_Acme.Site:Page".to_string()]),
            vec!["NodeType_Acme_Site-Page".to_string()]
        );
    }

    #[test]
    fn sanitize_preserves_order_and_clean_tags() {
        let sanitizer = TagSanitizer::new(false, 8);
        let tags = vec![
            "Node_af6f1b15".to_string(),
            "Everything".to_string(),
            "DescendantOf_9fd9b188".to_string(),
        ];

        assert_eq!(sanitizer.sanitize_tags(&tags), tags);
    }

    #[test]
    fn shorten_is_deterministic_with_fixed_length() {
        let sanitizer = TagSanitizer::new(true, 8);
        let tags = vec!["Node_af6f1b15".to_string(), "Everything".to_string()];

        let first = sanitizer.shorten_tags(tags.clone());
        let second = sanitizer.shorten_tags(tags);

        assert_eq!(first, second);
        assert!(first.iter().all(|tag| tag.len() == 8));
        assert_ne!(first[0], first[1]);
    }

    #[test]
    fn shorten_disabled_is_identity() {
        let sanitizer = TagSanitizer::new(false, 8);
        let tags = vec!["Node_af6f1b15".to_string()];

        assert_eq!(sanitizer.shorten_tags(tags.clone()), tags);
    }

    #[test]
    fn shorten_length_is_capped_at_digest_size() {
        let sanitizer = TagSanitizer::new(true, 64);
        let shortened = sanitizer.shorten_tags(vec!["Everything".to_string()]);

        assert_eq!(shortened[0].len(), 64);
    }
}
