//! Common transport format (CTF) bundles.
//!
//! A bundle moves many component archives between registries as one file. On
//! disk it is a single tar that only ever grows:
//!
//! ```text
//! blobs/sha256.<hex>.tar   packed component archive, stored once per digest
//! index/00000000.json      {"component": {...}, "digest": "sha256:..."}
//! index/00000001.json
//! SEALED                   written once; nothing may follow it
//! ```
//!
//! [`TransportBundle::flush`] appends whatever was added since the last flush
//! after the last stored entry, so existing entries are never rewritten.
//!
//! Adding follows one rule for archives and merged bundles alike: a new
//! identity is recorded (sharing the blob when the digest already exists), the
//! same identity with the same digest is a no-op, and the same identity with
//! different content is a [`BundleError::Conflict`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar_rs as tar;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::archive::{ComponentArchive, ExportFormat};
use crate::cancel::CancelSignal;
use crate::config::ReplicationSettings;
use crate::descriptor::ComponentIdentity;
use crate::digest::{blob_file_name, digest_from_file_name, sha256_digest};
use crate::error::{BundleError, PushError};
use crate::push::{PublishedComponent, PushOptions, PushPipeline};
use crate::tarball;

const BLOBS_PREFIX: &str = "blobs/";
const INDEX_PREFIX: &str = "index/";
const SEALED_MARKER: &str = "SEALED";
const BLOCK_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    Empty,
    Accumulating,
    Sealed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub component: ComponentIdentity,
    pub digest: String,
}

/// Outcome of replicating one bundle entry.
///
/// `component` is the identity the entry was recorded under. The artifact is
/// always published under the name and version of the archived descriptor,
/// which differ from `component` for entries added with
/// [`TransportBundle::add_archive_as`].
#[derive(Debug)]
pub struct ReplicationResult {
    pub component: ComponentIdentity,
    pub outcome: Result<PublishedComponent, PushError>,
}

impl ReplicationResult {
    /// Identity the registry received, when the push succeeded.
    pub fn published_as(&self) -> Option<&ComponentIdentity> {
        self.outcome.as_ref().ok().map(|published| &published.component)
    }

    /// True when the entry was published under a different identity.
    pub fn is_alias(&self) -> bool {
        self.published_as()
            .is_some_and(|published| published != &self.component)
    }
}

#[derive(Debug, Default)]
struct Persisted {
    entries: usize,
    blobs: BTreeSet<String>,
    sealed: bool,
}

#[derive(Debug, Default)]
pub struct TransportBundle {
    path: Option<PathBuf>,
    entries: Vec<BundleEntry>,
    blobs: BTreeMap<String, Arc<Vec<u8>>>,
    sealed: bool,
    persisted: Persisted,
}

impl TransportBundle {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the bundle file at `path`, or starts an empty one if it does not
    /// exist yet. Nothing is written until [`TransportBundle::flush`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BundleError> {
        let path = path.as_ref().to_path_buf();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("Starting new transport bundle at {}", path.display());
                return Ok(Self {
                    path: Some(path),
                    ..Default::default()
                });
            }
            Err(source) => return Err(BundleError::Io { path, source }),
        };

        let mut bundle = Self::read_from(file, &path)?;
        bundle.path = Some(path);
        Ok(bundle)
    }

    /// Loads a bundle from in-memory tar bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, BundleError> {
        Self::read_from(io::Cursor::new(data), Path::new("<memory>"))
    }

    fn read_from<R: Read>(reader: R, path: &Path) -> Result<Self, BundleError> {
        let io_err = |source| BundleError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut bundle = Self::default();
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries().map_err(io_err)? {
            let mut entry = entry.map_err(io_err)?;
            let name = entry.path().map_err(io_err)?.to_string_lossy().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).map_err(io_err)?;

            if bundle.sealed {
                return Err(BundleError::Malformed(format!(
                    "entry {} follows the {} marker",
                    name, SEALED_MARKER
                )));
            }

            if name == SEALED_MARKER {
                bundle.sealed = true;
            } else if let Some(file_name) = name.strip_prefix(BLOBS_PREFIX) {
                let digest = file_name
                    .strip_suffix(".tar")
                    .and_then(digest_from_file_name)
                    .ok_or_else(|| BundleError::Malformed(format!("unexpected blob {}", name)))?;
                if sha256_digest(&data) != digest {
                    return Err(BundleError::Malformed(format!(
                        "blob {} does not match its digest",
                        name
                    )));
                }
                bundle.blobs.insert(digest, Arc::new(data));
            } else if name.starts_with(INDEX_PREFIX) {
                let record: BundleEntry = serde_json::from_slice(&data).map_err(|e| {
                    BundleError::Malformed(format!("invalid index record {}: {}", name, e))
                })?;
                bundle.record(record)?;
            } else {
                return Err(BundleError::Malformed(format!("unexpected entry {}", name)));
            }
        }

        for entry in &bundle.entries {
            if !bundle.blobs.contains_key(&entry.digest) {
                return Err(BundleError::MissingBlob {
                    digest: entry.digest.clone(),
                });
            }
        }

        bundle.persisted = Persisted {
            entries: bundle.entries.len(),
            blobs: bundle.blobs.keys().cloned().collect(),
            sealed: bundle.sealed,
        };
        log::debug!(
            "Read transport bundle {} with {} entries and {} blobs",
            path.display(),
            bundle.entries.len(),
            bundle.blobs.len()
        );
        Ok(bundle)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn state(&self) -> BundleState {
        if self.sealed {
            BundleState::Sealed
        } else if self.entries.is_empty() {
            BundleState::Empty
        } else {
            BundleState::Accumulating
        }
    }

    pub fn entries(&self) -> &[BundleEntry] {
        &self.entries
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Packs `archive` and records it under its descriptor's identity.
    pub fn add_archive(&mut self, archive: &ComponentArchive) -> Result<BundleEntry, BundleError> {
        self.add_archive_as(archive.descriptor().identity(), archive)
    }

    /// Packs `archive` and records it under `identity`.
    pub fn add_archive_as(
        &mut self,
        identity: ComponentIdentity,
        archive: &ComponentArchive,
    ) -> Result<BundleEntry, BundleError> {
        self.ensure_open()?;
        let data = archive.export(ExportFormat::Tar)?;
        let digest = sha256_digest(&data);
        let entry = BundleEntry {
            component: identity,
            digest,
        };

        if self.check(&entry)? {
            self.blobs
                .entry(entry.digest.clone())
                .or_insert_with(|| Arc::new(data));
            self.record(entry.clone())?;
        }
        Ok(entry)
    }

    /// Merges every entry of `other`. Either all entries are merged or, on a
    /// conflict, none.
    pub fn add_bundle(&mut self, other: &TransportBundle) -> Result<usize, BundleError> {
        self.ensure_open()?;

        let mut new_entries = Vec::new();
        for entry in &other.entries {
            if self.check(entry)? && !new_entries.contains(entry) {
                new_entries.push(entry.clone());
            }
        }

        for entry in &new_entries {
            let blob = other
                .blobs
                .get(&entry.digest)
                .ok_or_else(|| BundleError::MissingBlob {
                    digest: entry.digest.clone(),
                })?;
            self.blobs
                .entry(entry.digest.clone())
                .or_insert_with(|| Arc::clone(blob));
        }
        let added = new_entries.len();
        for entry in new_entries {
            self.record(entry)?;
        }
        Ok(added)
    }

    /// Forbids further additions.
    pub fn seal(&mut self) {
        if !self.sealed {
            log::info!("Sealing transport bundle with {} entries", self.entries.len());
            self.sealed = true;
        }
    }

    fn ensure_open(&self) -> Result<(), BundleError> {
        if self.sealed {
            Err(BundleError::Sealed)
        } else {
            Ok(())
        }
    }

    /// True when `entry` is new, false when it is already recorded.
    fn check(&self, entry: &BundleEntry) -> Result<bool, BundleError> {
        match self.entries.iter().find(|e| e.component == entry.component) {
            None => Ok(true),
            Some(existing) if existing.digest == entry.digest => {
                log::debug!("{} is already in the bundle", entry.component);
                Ok(false)
            }
            Some(existing) => Err(BundleError::Conflict {
                identity: entry.component.clone(),
                existing: existing.digest.clone(),
                new: entry.digest.clone(),
            }),
        }
    }

    fn record(&mut self, entry: BundleEntry) -> Result<(), BundleError> {
        if self.check(&entry)? {
            log::debug!("Recorded {} as {}", entry.component, entry.digest);
            self.entries.push(entry);
        }
        Ok(())
    }

    /// Unpacks the archive stored for `entry`.
    pub fn archive(&self, entry: &BundleEntry) -> Result<ComponentArchive, BundleError> {
        let blob = self
            .blobs
            .get(&entry.digest)
            .ok_or_else(|| BundleError::MissingBlob {
                digest: entry.digest.clone(),
            })?;
        Ok(ComponentArchive::from_tar_bytes(blob)?)
    }

    /// Appends everything added since the last flush to the bundle file. A no-op
    /// for in-memory bundles.
    pub fn flush(&mut self) -> Result<(), BundleError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        let new_blobs: Vec<(&String, &Arc<Vec<u8>>)> = self
            .blobs
            .iter()
            .filter(|(digest, _)| !self.persisted.blobs.contains(*digest))
            .collect();
        let new_entries = &self.entries[self.persisted.entries..];
        let seal = self.sealed && !self.persisted.sealed;
        if new_blobs.is_empty() && new_entries.is_empty() && !seal {
            return Ok(());
        }

        let io_err = |source| BundleError::Io {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;
        let end = data_end(&file).map_err(io_err)?;
        file.set_len(end).map_err(io_err)?;
        file.seek(SeekFrom::Start(end)).map_err(io_err)?;

        let mut builder = tar::Builder::new(file);
        for (digest, data) in &new_blobs {
            tarball::append_file(&mut builder, &blob_entry_name(digest), data).map_err(io_err)?;
        }
        for (offset, entry) in new_entries.iter().enumerate() {
            let record = serde_json::to_vec(entry)
                .map_err(|e| BundleError::Malformed(format!("unable to encode index: {}", e)))?;
            let name = index_entry_name(self.persisted.entries + offset);
            tarball::append_file(&mut builder, &name, &record).map_err(io_err)?;
        }
        if seal {
            tarball::append_file(&mut builder, SEALED_MARKER, &[]).map_err(io_err)?;
        }
        let file = builder.into_inner().map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        log::info!(
            "Appended {} blobs and {} index records to {}",
            new_blobs.len(),
            new_entries.len(),
            path.display()
        );

        let written: Vec<String> = new_blobs.iter().map(|(d, _)| (*d).clone()).collect();
        self.persisted.blobs.extend(written);
        self.persisted.entries = self.entries.len();
        self.persisted.sealed = self.sealed;
        Ok(())
    }

    /// Serializes the whole bundle into one tar.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BundleError> {
        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        for (digest, data) in &self.blobs {
            files.push((blob_entry_name(digest), data.as_ref().clone()));
        }
        for (seq, entry) in self.entries.iter().enumerate() {
            let record = serde_json::to_vec(entry)
                .map_err(|e| BundleError::Malformed(format!("unable to encode index: {}", e)))?;
            files.push((index_entry_name(seq), record));
        }
        if self.sealed {
            files.push((SEALED_MARKER.to_string(), Vec::new()));
        }
        tarball::pack(&files, false).map_err(|source| BundleError::Io {
            path: PathBuf::from("<memory>"),
            source,
        })
    }

    /// Pushes every entry to `target_base_url`, at most `settings.concurrency`
    /// at a time. Results come back in bundle order, one per entry; a failing
    /// component does not affect the others.
    pub async fn replicate(
        &self,
        pipeline: &PushPipeline,
        target_base_url: &str,
        settings: &ReplicationSettings,
        cancel: &CancelSignal,
    ) -> Vec<ReplicationResult> {
        let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (index, entry) in self.entries.iter().enumerate() {
            let Some(blob) = self.blobs.get(&entry.digest).cloned() else {
                continue;
            };
            let component = entry.component.clone();
            let pipeline = pipeline.clone();
            let options = PushOptions::with_base_url(target_base_url);
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        replicate_one(&pipeline, &component, blob, &options, &cancel).await
                    }
                    Err(_) => Err(PushError::Interrupted {
                        component: component.clone(),
                        message: "worker pool closed".to_string(),
                    }),
                };
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<Result<PublishedComponent, PushError>>> =
            self.entries.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => log::error!("Replication task failed: {}", e),
            }
        }

        self.entries
            .iter()
            .zip(outcomes)
            .map(|(entry, outcome)| {
                let outcome = outcome.unwrap_or_else(|| {
                    Err(if self.blobs.contains_key(&entry.digest) {
                        PushError::Interrupted {
                            component: entry.component.clone(),
                            message: "replication task did not complete".to_string(),
                        }
                    } else {
                        PushError::Interrupted {
                            component: entry.component.clone(),
                            message: format!("blob {} is missing", entry.digest),
                        }
                    })
                });
                ReplicationResult {
                    component: entry.component.clone(),
                    outcome,
                }
            })
            .collect()
    }
}

async fn replicate_one(
    pipeline: &PushPipeline,
    component: &ComponentIdentity,
    blob: Arc<Vec<u8>>,
    options: &PushOptions,
    cancel: &CancelSignal,
) -> Result<PublishedComponent, PushError> {
    if cancel.is_cancelled() {
        return Err(PushError::Cancelled {
            component: component.clone(),
        });
    }

    let archive = tokio::task::spawn_blocking(move || ComponentArchive::from_tar_bytes(&blob))
        .await
        .map_err(|e| PushError::Interrupted {
            component: component.clone(),
            message: format!("unpack task failed: {}", e),
        })?
        .map_err(|source| PushError::Archive {
            component: component.clone(),
            source,
        })?;

    log::info!("Replicating {}", component);
    pipeline.push(&archive, options, cancel).await
}

fn blob_entry_name(digest: &str) -> String {
    format!("{}{}.tar", BLOBS_PREFIX, blob_file_name(digest))
}

fn index_entry_name(seq: usize) -> String {
    format!("{}{:08}.json", INDEX_PREFIX, seq)
}

/// Offset just past the data of the last entry, i.e. where the end-of-archive
/// blocks start.
fn data_end(file: &File) -> io::Result<u64> {
    let mut end = 0;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries()? {
        let entry = entry?;
        let size = entry.size();
        let data_end = entry.raw_file_position() + size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        end = end.max(data_end);
    }
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ComponentDescriptor;
    use std::fs;
    use tempfile::tempdir;

    fn archive(dir: &Path, name: &str, version: &str, payload: &[u8]) -> ComponentArchive {
        let root = dir.join(format!("{}-{}", name.replace('/', "_"), version));
        let mut archive =
            ComponentArchive::create(&root, ComponentDescriptor::new(name, version)).unwrap();
        let input = dir.join(format!("{}-{}.bin", name.replace('/', "_"), version));
        fs::write(&input, payload).unwrap();
        archive
            .add_local_resource(
                crate::descriptor::Resource {
                    name: "data".to_string(),
                    version: version.to_string(),
                    resource_type: "blob".to_string(),
                    extra_identity: Default::default(),
                    relation: None,
                    labels: Vec::new(),
                    access: crate::descriptor::Access::local_filesystem_blob("", None),
                },
                &input,
            )
            .unwrap();
        archive
    }

    #[test]
    fn test_state_transitions() {
        let dir = tempdir().unwrap();
        let mut bundle = TransportBundle::in_memory();
        assert_eq!(bundle.state(), BundleState::Empty);

        bundle
            .add_archive(&archive(dir.path(), "example/foo", "1.0.0", b"foo"))
            .unwrap();
        assert_eq!(bundle.state(), BundleState::Accumulating);

        bundle.seal();
        assert_eq!(bundle.state(), BundleState::Sealed);
        let err = bundle
            .add_archive(&archive(dir.path(), "example/bar", "1.0.0", b"bar"))
            .unwrap_err();
        assert!(matches!(err, BundleError::Sealed));
    }

    #[test]
    fn test_identity_rules() {
        let dir = tempdir().unwrap();
        let foo = archive(dir.path(), "example/foo", "1.0.0", b"foo");
        let mut bundle = TransportBundle::in_memory();

        let first = bundle.add_archive(&foo).unwrap();
        let again = bundle.add_archive(&foo).unwrap();
        assert_eq!(first, again);
        assert_eq!(bundle.entries().len(), 1);

        let alias = ComponentIdentity::new("example/alias", "1.0.0");
        bundle.add_archive_as(alias, &foo).unwrap();
        assert_eq!(bundle.entries().len(), 2);
        assert_eq!(bundle.blob_count(), 1);

        let other_dir = tempdir().unwrap();
        let changed = archive(other_dir.path(), "example/foo", "1.0.0", b"different");
        let err = bundle.add_archive(&changed).unwrap_err();
        assert!(matches!(err, BundleError::Conflict { .. }));
        assert_eq!(bundle.entries().len(), 2);
    }

    #[test]
    fn test_add_bundle_is_all_or_nothing() {
        let dir = tempdir().unwrap();
        let mut target = TransportBundle::in_memory();
        target
            .add_archive(&archive(dir.path(), "example/foo", "1.0.0", b"foo"))
            .unwrap();

        let other_dir = tempdir().unwrap();
        let mut source = TransportBundle::in_memory();
        source
            .add_archive(&archive(other_dir.path(), "example/bar", "1.0.0", b"bar"))
            .unwrap();
        source
            .add_archive(&archive(other_dir.path(), "example/foo", "1.0.0", b"changed"))
            .unwrap();

        assert!(matches!(
            target.add_bundle(&source),
            Err(BundleError::Conflict { .. })
        ));
        assert_eq!(target.entries().len(), 1);

        let mut compatible = TransportBundle::in_memory();
        compatible
            .add_archive(&archive(other_dir.path(), "example/baz", "1.0.0", b"baz"))
            .unwrap();
        assert_eq!(target.add_bundle(&compatible).unwrap(), 1);
        assert_eq!(target.entries().len(), 2);
    }

    #[test]
    fn test_flush_appends_without_rewriting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bundle.ctf");

        let mut bundle = TransportBundle::open(&path).unwrap();
        bundle
            .add_archive(&archive(dir.path(), "example/foo", "1.0.0", b"foo"))
            .unwrap();
        bundle.flush().unwrap();
        let first = fs::read(&path).unwrap();

        let mut reopened = TransportBundle::open(&path).unwrap();
        assert_eq!(reopened.entries().len(), 1);
        reopened
            .add_archive(&archive(dir.path(), "example/bar", "2.0.0", b"bar"))
            .unwrap();
        reopened.seal();
        reopened.flush().unwrap();
        let second = fs::read(&path).unwrap();

        // Everything before the old end-of-archive blocks is untouched.
        let data_len = first.len() - 2 * BLOCK_SIZE as usize;
        assert!(second.len() > first.len());
        assert_eq!(&second[..data_len], &first[..data_len]);

        let final_bundle = TransportBundle::open(&path).unwrap();
        assert_eq!(final_bundle.state(), BundleState::Sealed);
        assert_eq!(
            final_bundle
                .entries()
                .iter()
                .map(|e| e.component.to_string())
                .collect::<Vec<_>>(),
            vec!["example/foo:1.0.0", "example/bar:2.0.0"]
        );

        let restored = final_bundle.archive(&final_bundle.entries()[1]).unwrap();
        assert_eq!(
            restored.descriptor().identity(),
            ComponentIdentity::new("example/bar", "2.0.0")
        );
    }

    #[test]
    fn test_to_bytes_round_trip() {
        let dir = tempdir().unwrap();
        let mut bundle = TransportBundle::in_memory();
        bundle
            .add_archive(&archive(dir.path(), "example/foo", "1.0.0", b"foo"))
            .unwrap();

        let loaded = TransportBundle::from_bytes(&bundle.to_bytes().unwrap()).unwrap();
        assert_eq!(loaded.entries(), bundle.entries());
        assert_eq!(loaded.state(), BundleState::Accumulating);
    }

    #[test]
    fn test_rejects_unknown_entries() {
        let data = tarball::pack(&[("README".to_string(), b"hi".to_vec())], false).unwrap();
        assert!(matches!(
            TransportBundle::from_bytes(&data),
            Err(BundleError::Malformed(_))
        ));
    }
}
