//! Local content-addressed blob cache.
//!
//! Blobs live under `<root>/blobs/sha256/<hex>`. Writes land in `<root>/tmp` first
//! and are renamed into place once complete, so a reader never sees a partial
//! entry. Puts for the same digest are serialized through a per-digest lock;
//! distinct digests proceed concurrently. The directory is created lazily on the
//! first write and never removed by this crate.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::digest;
use crate::error::CacheError;

const BLOBS_DIR: &str = "blobs";
const TMP_DIR: &str = "tmp";

/// One immutable cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub digest: String,
    pub size: u64,
    pub path: PathBuf,
}

pub struct BlobCache {
    root: PathBuf,
    verify_on_read: bool,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BlobCache {
    /// Opens a cache rooted at `root`. Nothing is created until the first `put`.
    pub fn open<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            verify_on_read: true,
            locks: DashMap::new(),
        }
    }

    /// Toggles re-hashing on every `get`. Enabled by default.
    pub fn with_verify_on_read(mut self, verify: bool) -> Self {
        self.verify_on_read = verify;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path an entry for `digest` occupies (whether or not it exists yet).
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf, CacheError> {
        let hex_part = digest::validate(digest)?;
        Ok(self.root.join(BLOBS_DIR).join("sha256").join(hex_part))
    }

    pub fn has(&self, digest: &str) -> Result<bool, CacheError> {
        Ok(self.blob_path(digest)?.is_file())
    }

    /// Metadata of an existing entry without reading its content.
    pub fn entry(&self, digest: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.blob_path(digest)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(CacheEntry {
                digest: digest.to_string(),
                size: meta.len(),
                path,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    /// Reads a blob. With verify-on-read enabled a content/digest mismatch is
    /// reported as [`CacheError::Corrupted`] instead of serving the bytes.
    pub fn get(&self, digest: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.blob_path(digest)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CacheError::NotFound {
                    digest: digest.to_string(),
                })
            }
            Err(source) => return Err(CacheError::Io { path, source }),
        };

        if self.verify_on_read {
            let actual = digest::sha256_digest(&data);
            if actual != digest {
                log::warn!("Cache entry {} is corrupted (hashes to {})", digest, actual);
                return Err(CacheError::Corrupted {
                    digest: digest.to_string(),
                    actual,
                });
            }
        }

        Ok(data)
    }

    /// Stores `data` under `digest`. A no-op when the digest is already cached;
    /// new content must hash to `digest`.
    pub fn put(&self, digest: &str, data: &[u8]) -> Result<CacheEntry, CacheError> {
        let path = self.blob_path(digest)?;

        let lock = Arc::clone(&self.locks.entry(digest.to_string()).or_default());
        let result = {
            let _guard = lock.lock();
            self.put_locked(digest, data, path)
        };

        // Drop the lock entry once no other writer holds or waits on it.
        drop(lock);
        self.locks
            .remove_if(digest, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    fn put_locked(&self, digest: &str, data: &[u8], path: PathBuf) -> Result<CacheEntry, CacheError> {
        if let Some(existing) = self.entry(digest)? {
            log::trace!("Blob {} already cached", digest);
            return Ok(existing);
        }

        let actual = digest::sha256_digest(data);
        if actual != digest {
            return Err(CacheError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }

        let tmp_dir = self.root.join(TMP_DIR);
        create_dir(&tmp_dir)?;
        if let Some(parent) = path.parent() {
            create_dir(parent)?;
        }

        let mut tmp = tempfile::NamedTempFile::new_in(&tmp_dir).map_err(|source| CacheError::Io {
            path: tmp_dir.clone(),
            source,
        })?;
        tmp.write_all(data)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|source| CacheError::Io {
                path: tmp.path().to_path_buf(),
                source,
            })?;
        tmp.persist(&path).map_err(|e| CacheError::Io {
            path: path.clone(),
            source: e.error,
        })?;

        log::debug!("Cached blob {} ({} bytes)", digest, data.len());

        Ok(CacheEntry {
            digest: digest.to_string(),
            size: data.len() as u64,
            path,
        })
    }

    /// Hashes `data` and stores it, returning the new (or existing) entry.
    pub fn put_bytes(&self, data: &[u8]) -> Result<CacheEntry, CacheError> {
        let digest = digest::sha256_digest(data);
        self.put(&digest, data)
    }
}

fn create_dir(path: &Path) -> Result<(), CacheError> {
    fs::create_dir_all(path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })
}
