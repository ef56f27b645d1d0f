//! Metadata-aware cache storage.
//!
//! Entries are stored as a compact JSON header holding the identifier, tags
//! and lifetime, a one-byte separator and the original payload. Every entry
//! consulted through this frontend leaves its decoded metadata in a
//! per-process map, which is what response annotation later aggregates.

mod backend;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::RuntimeContext;
use crate::lock::{rw_read, rw_write};

pub use backend::{BackendError, CacheBackend, FileBackend, MemoryBackend};

const SOURCE: &str = "store";
const METRIC_CORRUPT_ENTRIES: &str = "spurgo_corrupt_entries_total";

/// Separator between the metadata header and the payload. The header is
/// compact JSON, which never emits this byte outside of string values.
pub const METADATA_SEPARATOR: u8 = b'|';

/// Tags and lifetime attached to one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub identifier: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub lifetime: Option<u64>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache entry `{identifier}` has no metadata separator")]
    MissingSeparator { identifier: String },
    #[error("cache entry `{identifier}` has an undecodable metadata header: {reason}")]
    InvalidHeader { identifier: String, reason: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

enum Decoded {
    Tagged(EntryMetadata, String),
    Raw(String),
}

/// String cache frontend that records the metadata of every consulted entry.
pub struct TaggedCacheStore {
    backend: Arc<dyn CacheBackend>,
    context: RuntimeContext,
    seen: RwLock<HashMap<String, EntryMetadata>>,
}

impl TaggedCacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, context: RuntimeContext) -> Self {
        Self {
            backend,
            context,
            seen: RwLock::new(HashMap::new()),
        }
    }

    /// Stores `content` under `identifier` and records its metadata.
    pub fn set(
        &self,
        identifier: &str,
        content: &str,
        tags: &[String],
        lifetime: Option<u64>,
    ) -> Result<(), StoreError> {
        let metadata = EntryMetadata {
            identifier: identifier.to_string(),
            tags: tags.to_vec(),
            lifetime,
        };
        let header = serde_json::to_vec(&metadata).map_err(BackendError::from)?;

        let mut blob = Vec::with_capacity(header.len() + 1 + content.len());
        blob.extend_from_slice(&header);
        blob.push(METADATA_SEPARATOR);
        blob.extend_from_slice(content.as_bytes());

        self.backend.set(identifier, Bytes::from(blob), tags, lifetime)?;
        rw_write(&self.seen, SOURCE, "set.record").insert(identifier.to_string(), metadata);
        Ok(())
    }

    /// Returns the payload for `identifier`, recording its metadata.
    pub fn get(&self, identifier: &str) -> Result<Option<String>, StoreError> {
        let Some(raw) = self.backend.get(identifier)? else {
            return Ok(None);
        };
        match self.decode(identifier, &raw)? {
            Decoded::Tagged(metadata, content) => {
                rw_write(&self.seen, SOURCE, "get.record")
                    .insert(identifier.to_string(), metadata);
                Ok(Some(content))
            }
            Decoded::Raw(content) => Ok(Some(content)),
        }
    }

    /// Returns `(identifier, payload)` pairs for every live entry carrying
    /// `tag`, sorted by identifier.
    pub fn get_by_tag(&self, tag: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut entries = Vec::new();
        for identifier in self.backend.find_identifiers_by_tag(tag)? {
            if let Some(content) = self.get(&identifier)? {
                entries.push((identifier, content));
            }
        }
        Ok(entries)
    }

    pub fn remove(&self, identifier: &str) -> Result<bool, StoreError> {
        Ok(self.backend.remove(identifier)?)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush()?;
        self.reset();
        Ok(())
    }

    /// Metadata of every entry consulted since the last [`reset`](Self::reset),
    /// sorted by identifier.
    pub fn seen_metadata(&self) -> Vec<EntryMetadata> {
        let seen = rw_read(&self.seen, SOURCE, "seen_metadata");
        let mut entries: Vec<EntryMetadata> = seen.values().cloned().collect();
        entries.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        entries
    }

    /// Forgets all recorded metadata. Called at the start of each request so
    /// long-lived workers never leak annotations across responses.
    pub fn reset(&self) {
        rw_write(&self.seen, SOURCE, "reset").clear();
    }

    fn decode(&self, identifier: &str, raw: &Bytes) -> Result<Decoded, StoreError> {
        let Some(split_at) = raw.iter().position(|byte| *byte == METADATA_SEPARATOR) else {
            return self.degrade(
                raw,
                StoreError::MissingSeparator {
                    identifier: identifier.to_string(),
                },
            );
        };
        match serde_json::from_slice::<EntryMetadata>(&raw[..split_at]) {
            Ok(metadata) => {
                let content = String::from_utf8_lossy(&raw[split_at + 1..]).into_owned();
                Ok(Decoded::Tagged(metadata, content))
            }
            Err(err) => self.degrade(
                raw,
                StoreError::InvalidHeader {
                    identifier: identifier.to_string(),
                    reason: err.to_string(),
                },
            ),
        }
    }

    /// Corrupt entries fail loudly during development. In production the raw
    /// blob is served unchanged and nothing is recorded, so the response is
    /// still usable but never advertised as cacheable under stale tags.
    fn degrade(&self, raw: &Bytes, error: StoreError) -> Result<Decoded, StoreError> {
        if !self.context.is_production() {
            return Err(error);
        }
        counter!(METRIC_CORRUPT_ENTRIES).increment(1);
        warn!(%error, "Serving cache entry without usable metadata");
        Ok(Decoded::Raw(String::from_utf8_lossy(raw).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    fn store(context: RuntimeContext) -> (Arc<MemoryBackend>, TaggedCacheStore) {
        let backend = Arc::new(MemoryBackend::new(
            NonZeroUsize::new(16).expect("non-zero limit"),
        ));
        let store = TaggedCacheStore::new(backend.clone(), context);
        (backend, store)
    }

    #[test]
    fn metadata_roundtrips_invisibly() {
        let (_, store) = store(RuntimeContext::Production);

        store
            .set(
                "foo",
                "Bar",
                &["Tag1".to_string(), "Tag2".to_string()],
                Some(10240),
            )
            .expect("set succeeds");

        assert_eq!(store.get("foo").expect("get succeeds"), Some("Bar".to_string()));

        let seen = store.seen_metadata();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].identifier, "foo");
        assert_eq!(seen[0].tags, vec!["Tag1".to_string(), "Tag2".to_string()]);
        assert_eq!(seen[0].lifetime, Some(10240));
    }

    #[test]
    fn payload_may_contain_the_separator() {
        let (_, store) = store(RuntimeContext::Production);

        store
            .set("pipes", "left|right|end", &[], None)
            .expect("set succeeds");

        assert_eq!(
            store.get("pipes").expect("get succeeds"),
            Some("left|right|end".to_string())
        );
    }

    #[test]
    fn get_by_tag_returns_payloads_not_blobs() {
        let (_, store) = store(RuntimeContext::Production);

        store
            .set("first", "Content A", &["Shared".to_string()], None)
            .expect("set succeeds");
        store
            .set("second", "Content B", &["Shared".to_string()], Some(60))
            .expect("set succeeds");

        let entries = store.get_by_tag("Shared").expect("get_by_tag succeeds");
        assert_eq!(
            entries,
            vec![
                ("first".to_string(), "Content A".to_string()),
                ("second".to_string(), "Content B".to_string()),
            ]
        );
    }

    #[test]
    fn missing_separator_raises_in_development() {
        let (backend, store) = store(RuntimeContext::Development);

        backend
            .set("broken", Bytes::from("no separator here"), &[], None)
            .expect("raw set succeeds");

        let error = store.get("broken").expect_err("corrupt entry raises");
        assert!(matches!(
            error,
            StoreError::MissingSeparator { identifier } if identifier == "broken"
        ));
    }

    #[test]
    fn missing_separator_degrades_in_production() {
        let (backend, store) = store(RuntimeContext::Production);

        backend
            .set("broken", Bytes::from("no separator here"), &[], None)
            .expect("raw set succeeds");

        assert_eq!(
            store.get("broken").expect("degrades to raw content"),
            Some("no separator here".to_string())
        );
        assert!(store.seen_metadata().is_empty());
    }

    #[test]
    fn undecodable_header_raises_in_development() {
        let (backend, store) = store(RuntimeContext::Development);

        backend
            .set("broken", Bytes::from("not-json|payload"), &[], None)
            .expect("raw set succeeds");

        let error = store.get("broken").expect_err("corrupt header raises");
        assert!(matches!(error, StoreError::InvalidHeader { .. }));
    }

    #[test]
    fn undecodable_header_degrades_in_production() {
        let (backend, store) = store(RuntimeContext::Production);

        backend
            .set("broken", Bytes::from("not-json|payload"), &[], None)
            .expect("raw set succeeds");

        assert_eq!(
            store.get("broken").expect("degrades to raw content"),
            Some("not-json|payload".to_string())
        );
        assert!(store.seen_metadata().is_empty());
    }

    #[test]
    fn reset_forgets_recorded_metadata() {
        let (_, store) = store(RuntimeContext::Production);

        store
            .set("foo", "Bar", &["Tag1".to_string()], None)
            .expect("set succeeds");
        assert_eq!(store.seen_metadata().len(), 1);

        store.reset();
        assert!(store.seen_metadata().is_empty());

        store.get("foo").expect("get succeeds");
        assert_eq!(store.seen_metadata().len(), 1);
    }

    #[test]
    fn seen_metadata_is_sorted_by_identifier() {
        let (_, store) = store(RuntimeContext::Production);

        for identifier in ["zeta", "alpha", "mid"] {
            store
                .set(identifier, "x", &[], None)
                .expect("set succeeds");
        }

        let identifiers: Vec<String> = store
            .seen_metadata()
            .into_iter()
            .map(|entry| entry.identifier)
            .collect();
        assert_eq!(identifiers, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn store_recovers_from_poisoned_metadata_lock() {
        let (_, store) = store(RuntimeContext::Production);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.seen.write().expect("fresh lock");
            panic!("poison the metadata lock");
        }));

        store
            .set("foo", "Bar", &[], None)
            .expect("set succeeds after poisoning");
        assert_eq!(store.seen_metadata().len(), 1);
    }
}
