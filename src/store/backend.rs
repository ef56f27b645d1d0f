//! Storage backends for tagged cache entries.
//!
//! The memory backend covers per-process caches with LRU eviction, the file
//! backend covers state that must survive restarts, such as the site token.

use std::fs;
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "store::backend";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("cache backend io failure: {0}")]
    Io(#[from] io::Error),
    #[error("cache metadata codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Raw keyed storage with tag lookup.
///
/// Implementations store opaque byte payloads. Interpreting the payload,
/// including the embedded metadata header, is the frontend's business.
pub trait CacheBackend: Send + Sync {
    /// Stores a payload under `identifier`, replacing any previous entry.
    fn set(
        &self,
        identifier: &str,
        data: Bytes,
        tags: &[String],
        lifetime: Option<u64>,
    ) -> Result<(), BackendError>;

    /// Returns the payload for `identifier`, or `None` when absent or expired.
    fn get(&self, identifier: &str) -> Result<Option<Bytes>, BackendError>;

    /// Returns the identifiers of all live entries carrying `tag`, sorted.
    fn find_identifiers_by_tag(&self, tag: &str) -> Result<Vec<String>, BackendError>;

    /// Removes one entry, reporting whether it existed.
    fn remove(&self, identifier: &str) -> Result<bool, BackendError>;

    /// Removes every entry.
    fn flush(&self) -> Result<(), BackendError>;
}

fn expiry_from_lifetime(lifetime: Option<u64>) -> Option<OffsetDateTime> {
    let seconds = i64::try_from(lifetime?).ok()?;
    OffsetDateTime::now_utc().checked_add(Duration::seconds(seconds))
}

fn is_expired(expires_at: Option<OffsetDateTime>) -> bool {
    expires_at.is_some_and(|at| at <= OffsetDateTime::now_utc())
}

// ============================================================================
// Memory backend
// ============================================================================

#[derive(Clone)]
struct StoredEntry {
    data: Bytes,
    tags: Vec<String>,
    expires_at: Option<OffsetDateTime>,
}

/// In-memory backend with LRU eviction and lazy expiry.
pub struct MemoryBackend {
    entries: RwLock<LruCache<String, StoredEntry>>,
}

impl MemoryBackend {
    pub fn new(entry_limit: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(entry_limit)),
        }
    }
}

impl CacheBackend for MemoryBackend {
    fn set(
        &self,
        identifier: &str,
        data: Bytes,
        tags: &[String],
        lifetime: Option<u64>,
    ) -> Result<(), BackendError> {
        rw_write(&self.entries, SOURCE, "memory_set").put(
            identifier.to_string(),
            StoredEntry {
                data,
                tags: tags.to_vec(),
                expires_at: expiry_from_lifetime(lifetime),
            },
        );
        Ok(())
    }

    fn get(&self, identifier: &str) -> Result<Option<Bytes>, BackendError> {
        let mut entries = rw_write(&self.entries, SOURCE, "memory_get");
        if let Some(entry) = entries.get(identifier) {
            if !is_expired(entry.expires_at) {
                return Ok(Some(entry.data.clone()));
            }
        } else {
            return Ok(None);
        }
        entries.pop(identifier);
        Ok(None)
    }

    fn find_identifiers_by_tag(&self, tag: &str) -> Result<Vec<String>, BackendError> {
        let entries = rw_read(&self.entries, SOURCE, "memory_find_by_tag");
        let mut identifiers: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| {
                !is_expired(entry.expires_at) && entry.tags.iter().any(|candidate| candidate == tag)
            })
            .map(|(identifier, _)| identifier.clone())
            .collect();
        identifiers.sort();
        Ok(identifiers)
    }

    fn remove(&self, identifier: &str) -> Result<bool, BackendError> {
        Ok(rw_write(&self.entries, SOURCE, "memory_remove")
            .pop(identifier)
            .is_some())
    }

    fn flush(&self) -> Result<(), BackendError> {
        rw_write(&self.entries, SOURCE, "memory_flush").clear();
        Ok(())
    }
}

// ============================================================================
// File backend
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct FileMeta {
    identifier: String,
    tags: Vec<String>,
    expires_at: Option<i64>,
}

/// Directory-backed storage surviving process restarts.
///
/// Each entry is a `<digest>.blob` payload plus a `<digest>.meta` JSON
/// sidecar, both written atomically through a temporary file in the same
/// directory.
pub struct FileBackend {
    directory: PathBuf,
}

impl FileBackend {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    fn file_stem(identifier: &str) -> String {
        hex::encode(Sha256::digest(identifier.as_bytes()))
    }

    fn blob_path(&self, identifier: &str) -> PathBuf {
        self.directory
            .join(format!("{}.blob", Self::file_stem(identifier)))
    }

    fn meta_path(&self, identifier: &str) -> PathBuf {
        self.directory
            .join(format!("{}.meta", Self::file_stem(identifier)))
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<(), BackendError> {
        let mut file = NamedTempFile::new_in(&self.directory)?;
        file.write_all(contents)?;
        file.persist(path).map_err(|err| BackendError::Io(err.error))?;
        Ok(())
    }

    fn read_meta(&self, path: &Path) -> Result<Option<FileMeta>, BackendError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }
}

impl CacheBackend for FileBackend {
    fn set(
        &self,
        identifier: &str,
        data: Bytes,
        tags: &[String],
        lifetime: Option<u64>,
    ) -> Result<(), BackendError> {
        let meta = FileMeta {
            identifier: identifier.to_string(),
            tags: tags.to_vec(),
            expires_at: expiry_from_lifetime(lifetime).map(|at| at.unix_timestamp()),
        };
        self.write_atomic(&self.blob_path(identifier), &data)?;
        self.write_atomic(&self.meta_path(identifier), &serde_json::to_vec(&meta)?)?;
        Ok(())
    }

    fn get(&self, identifier: &str) -> Result<Option<Bytes>, BackendError> {
        let Some(meta) = self.read_meta(&self.meta_path(identifier))? else {
            return Ok(None);
        };
        if meta
            .expires_at
            .is_some_and(|at| at <= OffsetDateTime::now_utc().unix_timestamp())
        {
            self.remove(identifier)?;
            return Ok(None);
        }
        match fs::read(self.blob_path(identifier)) {
            Ok(raw) => Ok(Some(Bytes::from(raw))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn find_identifiers_by_tag(&self, tag: &str) -> Result<Vec<String>, BackendError> {
        let mut identifiers = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("meta") {
                continue;
            }
            let meta = match self.read_meta(&path) {
                Ok(Some(meta)) => meta,
                Ok(None) => continue,
                Err(error) => {
                    debug!(
                        path = %path.display(),
                        %error,
                        "Skipping undecodable metadata file"
                    );
                    continue;
                }
            };
            if meta
                .expires_at
                .is_some_and(|at| at <= OffsetDateTime::now_utc().unix_timestamp())
            {
                continue;
            }
            if meta.tags.iter().any(|candidate| candidate == tag) {
                identifiers.push(meta.identifier);
            }
        }
        identifiers.sort();
        Ok(identifiers)
    }

    fn remove(&self, identifier: &str) -> Result<bool, BackendError> {
        let blob_existed = remove_file_if_present(&self.blob_path(identifier))?;
        let meta_existed = remove_file_if_present(&self.meta_path(identifier))?;
        Ok(blob_existed || meta_existed)
    }

    fn flush(&self) -> Result<(), BackendError> {
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("blob") | Some("meta")
            ) {
                remove_file_if_present(&path)?;
            }
        }
        Ok(())
    }
}

fn remove_file_if_present(path: &Path) -> Result<bool, BackendError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn limit(value: usize) -> NonZeroUsize {
        NonZeroUsize::new(value).expect("non-zero limit")
    }

    #[test]
    fn memory_roundtrip_and_remove() {
        let backend = MemoryBackend::new(limit(8));

        backend
            .set("foo", Bytes::from("Bar"), &["Tag1".to_string()], None)
            .expect("set succeeds");
        assert_eq!(
            backend.get("foo").expect("get succeeds"),
            Some(Bytes::from("Bar"))
        );

        assert!(backend.remove("foo").expect("remove succeeds"));
        assert!(!backend.remove("foo").expect("second remove succeeds"));
        assert_eq!(backend.get("foo").expect("get succeeds"), None);
    }

    #[test]
    fn memory_evicts_least_recently_used_entry() {
        let backend = MemoryBackend::new(limit(2));

        for identifier in ["a", "b", "c"] {
            backend
                .set(identifier, Bytes::from(identifier), &[], None)
                .expect("set succeeds");
        }

        assert_eq!(backend.get("a").expect("get succeeds"), None);
        assert!(backend.get("b").expect("get succeeds").is_some());
        assert!(backend.get("c").expect("get succeeds").is_some());
    }

    #[test]
    fn memory_find_by_tag_matches_only_tagged_entries() {
        let backend = MemoryBackend::new(limit(8));

        backend
            .set("first", Bytes::from("1"), &["Shared".to_string()], None)
            .expect("set succeeds");
        backend
            .set(
                "second",
                Bytes::from("2"),
                &["Shared".to_string(), "Own".to_string()],
                None,
            )
            .expect("set succeeds");
        backend
            .set("third", Bytes::from("3"), &["Other".to_string()], None)
            .expect("set succeeds");

        assert_eq!(
            backend.find_identifiers_by_tag("Shared").expect("find succeeds"),
            vec!["first".to_string(), "second".to_string()]
        );
        assert_eq!(
            backend.find_identifiers_by_tag("Own").expect("find succeeds"),
            vec!["second".to_string()]
        );
        assert!(backend
            .find_identifiers_by_tag("Missing")
            .expect("find succeeds")
            .is_empty());
    }

    #[test]
    fn memory_zero_lifetime_expires_immediately() {
        let backend = MemoryBackend::new(limit(8));

        backend
            .set("flash", Bytes::from("gone"), &[], Some(0))
            .expect("set succeeds");

        assert_eq!(backend.get("flash").expect("get succeeds"), None);
        assert!(backend
            .find_identifiers_by_tag("any")
            .expect("find succeeds")
            .is_empty());
    }

    #[test]
    fn file_backend_survives_reopen() {
        let dir = TempDir::new().expect("temp dir");

        {
            let backend = FileBackend::new(dir.path()).expect("backend");
            backend
                .set("foo", Bytes::from("Bar"), &["Tag1".to_string()], None)
                .expect("set succeeds");
        }

        let reopened = FileBackend::new(dir.path()).expect("backend");
        assert_eq!(
            reopened.get("foo").expect("get succeeds"),
            Some(Bytes::from("Bar"))
        );
        assert_eq!(
            reopened.find_identifiers_by_tag("Tag1").expect("find succeeds"),
            vec!["foo".to_string()]
        );
    }

    #[test]
    fn file_backend_honors_recorded_expiry() {
        let dir = TempDir::new().expect("temp dir");
        let backend = FileBackend::new(dir.path()).expect("backend");

        backend
            .set("stale", Bytes::from("old"), &["Tag1".to_string()], Some(600))
            .expect("set succeeds");

        let meta = FileMeta {
            identifier: "stale".to_string(),
            tags: vec!["Tag1".to_string()],
            expires_at: Some(OffsetDateTime::now_utc().unix_timestamp() - 10),
        };
        fs::write(
            backend.meta_path("stale"),
            serde_json::to_vec(&meta).expect("encode meta"),
        )
        .expect("overwrite meta");

        assert_eq!(backend.get("stale").expect("get succeeds"), None);
        assert!(backend
            .find_identifiers_by_tag("Tag1")
            .expect("find succeeds")
            .is_empty());
    }

    #[test]
    fn file_backend_remove_and_flush() {
        let dir = TempDir::new().expect("temp dir");
        let backend = FileBackend::new(dir.path()).expect("backend");

        backend
            .set("one", Bytes::from("1"), &[], None)
            .expect("set succeeds");
        backend
            .set("two", Bytes::from("2"), &[], None)
            .expect("set succeeds");

        assert!(backend.remove("one").expect("remove succeeds"));
        assert!(!backend.remove("one").expect("second remove succeeds"));
        assert!(backend.get("two").expect("get succeeds").is_some());

        backend.flush().expect("flush succeeds");
        assert_eq!(backend.get("two").expect("get succeeds"), None);
    }
}
