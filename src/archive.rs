//! On-disk component archives.
//!
//! A [`ComponentArchive`] is a directory holding exactly one
//! `component-descriptor.yaml` and a `blobs/` directory with the bytes of every
//! local resource and source:
//!
//! ```text
//! my-component/
//! ├── component-descriptor.yaml
//! └── blobs/
//!     └── sha256.3a6eb079…
//! ```
//!
//! Loading validates the whole archive up front: a missing descriptor, a decode
//! error, a duplicate identity or a local entry without its blob fails the load.
//! A tar (or tar.gz) of that layout can be loaded as well; it is unpacked into a
//! private temporary directory that lives as long as the archive.
//!
//! Mutations ([`ComponentArchive::add_local_resource`], [`ComponentArchive::add_resource`],
//! [`ComponentArchive::remove_resource`]) keep descriptor and blob directory
//! consistent and persist the descriptor atomically.

use std::collections::BTreeSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component as PathComponent, Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::descriptor::{Access, ComponentDescriptor, Resource, ResourceIdentity};
use crate::digest;
use crate::error::ArchiveError;
use crate::tarball;

pub const COMPONENT_DESCRIPTOR_FILE_NAME: &str = "component-descriptor.yaml";
pub const BLOBS_DIR: &str = "blobs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Tar,
    TarGz,
}

/// Clones share the directory (and keep an unpacked temporary directory alive)
/// but each carries its own copy of the descriptor.
#[derive(Clone)]
pub struct ComponentArchive {
    root: PathBuf,
    descriptor: ComponentDescriptor,
    _temp_dir: Option<Arc<TempDir>>,
}

impl ComponentArchive {
    /// Creates a new, empty archive directory for `descriptor`.
    pub fn create<P: AsRef<Path>>(
        root: P,
        descriptor: ComponentDescriptor,
    ) -> Result<Self, ArchiveError> {
        let root = root.as_ref();
        descriptor.validate().map_err(ArchiveError::Structural)?;

        let descriptor_path = root.join(COMPONENT_DESCRIPTOR_FILE_NAME);
        if descriptor_path.exists() {
            return Err(ArchiveError::Structural(format!(
                "{} already contains a component descriptor",
                root.display()
            )));
        }

        let blobs_dir = root.join(BLOBS_DIR);
        fs::create_dir_all(&blobs_dir).map_err(|source| ArchiveError::Io {
            path: blobs_dir,
            source,
        })?;

        let archive = Self {
            root: root.to_path_buf(),
            descriptor,
            _temp_dir: None,
        };
        archive.save()?;
        Ok(archive)
    }

    /// Loads and validates an archive from a directory or a (gzipped) tar file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        let meta = fs::metadata(path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => ArchiveError::NotFound {
                path: path.to_path_buf(),
            },
            _ => ArchiveError::Io {
                path: path.to_path_buf(),
                source,
            },
        })?;

        if meta.is_dir() {
            return Self::load_dir(path.to_path_buf(), None);
        }

        log::debug!("Unpacking component archive {}", path.display());
        let temp_dir = new_temp_dir()?;
        tarball::extract_tar(path, temp_dir.path()).map_err(|e| {
            ArchiveError::Structural(format!("{} is not a readable tar: {}", path.display(), e))
        })?;
        Self::load_dir(temp_dir.path().to_path_buf(), Some(temp_dir))
    }

    /// Loads an archive from the bytes produced by [`ComponentArchive::export`].
    pub fn from_tar_bytes(data: &[u8]) -> Result<Self, ArchiveError> {
        let temp_dir = new_temp_dir()?;
        tarball::extract_tar_bytes(data, temp_dir.path())
            .map_err(|e| ArchiveError::Structural(format!("unreadable archive tar: {}", e)))?;
        Self::load_dir(temp_dir.path().to_path_buf(), Some(temp_dir))
    }

    fn load_dir(root: PathBuf, temp_dir: Option<TempDir>) -> Result<Self, ArchiveError> {
        let descriptor_path = root.join(COMPONENT_DESCRIPTOR_FILE_NAME);
        let data = fs::read(&descriptor_path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => ArchiveError::NotFound {
                path: descriptor_path.clone(),
            },
            _ => ArchiveError::Io {
                path: descriptor_path.clone(),
                source,
            },
        })?;

        let descriptor = ComponentDescriptor::from_yaml(&data).map_err(|source| {
            ArchiveError::InvalidDescriptor {
                path: descriptor_path.clone(),
                source,
            }
        })?;
        descriptor.validate().map_err(ArchiveError::Structural)?;

        let archive = Self {
            root,
            descriptor,
            _temp_dir: temp_dir.map(Arc::new),
        };
        for entry in archive.descriptor.artifacts() {
            archive.check_local_blob(entry)?;
        }

        log::debug!(
            "Loaded component archive {} with {} resources and {} sources",
            archive.descriptor.identity(),
            archive.descriptor.component.resources.len(),
            archive.descriptor.component.sources.len()
        );

        Ok(archive)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    pub fn descriptor_mut(&mut self) -> &mut ComponentDescriptor {
        &mut self.descriptor
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join(BLOBS_DIR)
    }

    /// Resolves a blob file name against the blob directory, rejecting names that
    /// would leave it.
    pub fn blob_path(&self, filename: &str) -> Result<PathBuf, ArchiveError> {
        let relative = Path::new(filename);
        let plain = !filename.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, PathComponent::Normal(_)));
        if !plain {
            return Err(ArchiveError::Structural(format!(
                "blob file name '{}' must be a relative path inside {}",
                filename, BLOBS_DIR
            )));
        }
        Ok(self.blobs_dir().join(relative))
    }

    fn check_local_blob(&self, entry: &Resource) -> Result<(), ArchiveError> {
        if !entry.is_local() {
            return Ok(());
        }
        if let Some((filename, _)) = entry.access.local_blob() {
            let path = self.blob_path(filename)?;
            if !path.is_file() {
                return Err(ArchiveError::NotFound { path });
            }
        }
        Ok(())
    }

    /// Serializes descriptor and referenced blobs into one tar. Identical archives
    /// export to identical bytes; the archive itself is left untouched.
    pub fn export(&self, format: ExportFormat) -> Result<Vec<u8>, ArchiveError> {
        let descriptor = self.descriptor.to_yaml().map_err(ArchiveError::Encode)?;
        let mut files = vec![(
            COMPONENT_DESCRIPTOR_FILE_NAME.to_string(),
            descriptor.into_bytes(),
        )];

        for filename in self.referenced_blobs() {
            let path = self.blob_path(&filename)?;
            let data = fs::read(&path).map_err(|source| ArchiveError::Io {
                path: path.clone(),
                source,
            })?;
            files.push((format!("{}/{}", BLOBS_DIR, filename), data));
        }

        tarball::pack(&files, format == ExportFormat::TarGz).map_err(|source| ArchiveError::Io {
            path: self.root.clone(),
            source,
        })
    }

    /// Writes the export to `path` via a temporary file in the same directory.
    pub fn export_to<P: AsRef<Path>>(
        &self,
        path: P,
        format: ExportFormat,
    ) -> Result<(), ArchiveError> {
        let data = self.export(format)?;
        write_atomic(path.as_ref(), &data)
    }

    /// Copies `input` into the blob directory, points the resource's access at it
    /// and stores the resource (replacing one with the same identity).
    pub fn add_local_resource<P: AsRef<Path>>(
        &mut self,
        mut resource: Resource,
        input: P,
    ) -> Result<(), ArchiveError> {
        let input = input.as_ref();
        if resource.relation == Some(crate::descriptor::Relation::External) {
            return Err(ArchiveError::Structural(format!(
                "{} is external and cannot carry a local blob",
                resource.identity()
            )));
        }

        let data = fs::read(input).map_err(|source| match source.kind() {
            ErrorKind::NotFound => ArchiveError::NotFound {
                path: input.to_path_buf(),
            },
            _ => ArchiveError::Io {
                path: input.to_path_buf(),
                source,
            },
        })?;

        let filename = digest::blob_file_name(&digest::sha256_digest(&data));
        let blob_path = self.blob_path(&filename)?;

        let media_type = resource
            .access
            .local_blob()
            .and_then(|(_, media_type)| media_type.map(str::to_string));
        resource.access = Access::local_filesystem_blob(&filename, media_type);
        let identity = resource.identity();
        let updated = self.with_resource(resource)?;

        if !blob_path.is_file() {
            write_atomic(&blob_path, &data)?;
        }
        log::info!("Adding local resource {} ({} bytes)", identity, data.len());
        self.commit(updated)
    }

    /// Stores a resource whose access is already resolvable (external, or a local
    /// blob already present in the blob directory).
    pub fn add_resource(&mut self, resource: Resource) -> Result<(), ArchiveError> {
        self.check_local_blob(&resource)?;
        let updated = self.with_resource(resource)?;
        self.commit(updated)
    }

    /// Copy of the descriptor with `resource` added (or replacing the entry with
    /// the same identity), validated.
    fn with_resource(&self, resource: Resource) -> Result<ComponentDescriptor, ArchiveError> {
        let mut updated = self.descriptor.clone();
        let identity = resource.identity();
        let resources = &mut updated.component.resources;
        match resources.iter().position(|r| r.identity() == identity) {
            Some(index) => {
                log::debug!("Replacing resource {}", identity);
                resources[index] = resource;
            }
            None => resources.push(resource),
        }

        updated.validate().map_err(ArchiveError::Structural)?;
        Ok(updated)
    }

    /// Persists `updated`, then swaps it in and drops blobs it no longer references.
    fn commit(&mut self, updated: ComponentDescriptor) -> Result<(), ArchiveError> {
        write_descriptor(&self.root, &updated)?;
        self.descriptor = updated;
        self.remove_orphaned_blobs()
    }

    /// Removes the resource with `identity`. Returns false when it did not exist.
    pub fn remove_resource(&mut self, identity: &ResourceIdentity) -> Result<bool, ArchiveError> {
        let mut updated = self.descriptor.clone();
        let resources = &mut updated.component.resources;
        let before = resources.len();
        resources.retain(|r| &r.identity() != identity);
        if resources.len() == before {
            return Ok(false);
        }

        self.commit(updated)?;
        log::info!("Removed resource {}", identity);
        Ok(true)
    }

    /// Persists the descriptor atomically.
    pub fn save(&self) -> Result<(), ArchiveError> {
        write_descriptor(&self.root, &self.descriptor)
    }

    /// Blob file names referenced by local entries, sorted and de-duplicated.
    pub fn referenced_blobs(&self) -> BTreeSet<String> {
        self.descriptor
            .artifacts()
            .filter(|entry| entry.is_local())
            .filter_map(|entry| entry.access.local_blob().map(|(name, _)| name.to_string()))
            .collect()
    }

    fn remove_orphaned_blobs(&self) -> Result<(), ArchiveError> {
        let referenced = self.referenced_blobs();
        let blobs_dir = self.blobs_dir();
        let entries = match fs::read_dir(&blobs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(ArchiveError::Io {
                    path: blobs_dir,
                    source,
                })
            }
        };

        for entry in entries {
            let entry = entry.map_err(|source| ArchiveError::Io {
                path: blobs_dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            // Only digest-named blobs are managed here; anything else was put there by hand.
            if digest::digest_from_file_name(&name).is_some() && !referenced.contains(&name) {
                log::debug!("Removing unreferenced blob {}", name);
                fs::remove_file(entry.path()).map_err(|source| ArchiveError::Io {
                    path: entry.path(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}

fn new_temp_dir() -> Result<TempDir, ArchiveError> {
    tempfile::tempdir().map_err(|source| ArchiveError::Io {
        path: std::env::temp_dir(),
        source,
    })
}

fn write_descriptor(root: &Path, descriptor: &ComponentDescriptor) -> Result<(), ArchiveError> {
    let yaml = descriptor.to_yaml().map_err(ArchiveError::Encode)?;
    write_atomic(&root.join(COMPONENT_DESCRIPTOR_FILE_NAME), yaml.as_bytes())
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), ArchiveError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|source| ArchiveError::Io {
        path: parent.clone(),
        source,
    })?;

    let io_err = |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(io_err)?;
    tmp.write_all(data).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
