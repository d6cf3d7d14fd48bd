//! Turns a component archive into an OCI image manifest.
//!
//! Every local resource and source becomes one layer, the descriptor itself
//! becomes the config blob. All blobs go through the [`BlobCache`], so the push
//! step only ever reads bytes that were digested here.

use oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest, ImageManifest, ImageManifestBuilder, MediaType,
    SCHEMA_VERSION,
};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use crate::archive::ComponentArchive;
use crate::cache::BlobCache;
use crate::descriptor::{Access, ComponentDescriptor, KnownAccess, Resource};
use crate::digest::sha256_digest;
use crate::error::BuildError;

pub const COMPONENT_CONFIG_MEDIA_TYPE: &str =
    "application/vnd.gardener.cloud.cnudie.component.config.v1+json";
pub const OCTET_STREAM_MEDIA_TYPE: &str = "application/octet-stream";

/// Layer media type for a resource type without an explicit `mediaType`.
pub fn media_type_for(resource_type: &str) -> &'static str {
    match resource_type {
        "ociImage" => "application/vnd.oci.image.layer.v1.tar",
        "json" => "application/json",
        "yaml" => "application/x-yaml",
        "directoryTree" => "application/x-tar",
        "helm" => "application/vnd.cncf.helm.chart.content.v1.tar+gzip",
        _ => OCTET_STREAM_MEDIA_TYPE,
    }
}

/// A built manifest together with its serialized form.
#[derive(Debug, Clone)]
pub struct ComponentManifest {
    pub manifest: ImageManifest,
    pub bytes: Vec<u8>,
    pub digest: String,
}

impl ComponentManifest {
    pub fn config(&self) -> &Descriptor {
        self.manifest.config()
    }

    pub fn layers(&self) -> &[Descriptor] {
        self.manifest.layers()
    }
}

#[derive(Clone)]
struct BlobRef {
    digest: String,
    size: u64,
}

pub struct ManifestBuilder<'a> {
    cache: &'a BlobCache,
    archive: &'a ComponentArchive,
    descriptor: Option<&'a ComponentDescriptor>,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(cache: &'a BlobCache, archive: &'a ComponentArchive) -> Self {
        Self {
            cache,
            archive,
            descriptor: None,
        }
    }

    /// Builds from `descriptor` instead of the archive's own, e.g. one with an
    /// extra repository context. Blob files still come from the archive.
    pub fn with_descriptor(mut self, descriptor: &'a ComponentDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    pub fn build(&self) -> Result<ComponentManifest, BuildError> {
        let mut descriptor = self
            .descriptor
            .unwrap_or_else(|| self.archive.descriptor())
            .clone();
        let mut read_paths: HashMap<PathBuf, BlobRef> = HashMap::new();
        let mut layer_digests = HashSet::new();
        let mut layers = Vec::new();

        let component = &mut descriptor.component;
        for entry in component
            .resources
            .iter_mut()
            .chain(component.sources.iter_mut())
        {
            if !entry.is_local() {
                log::trace!("Skipping external entry {}", entry.identity());
                continue;
            }

            let (blob, media_type) = self.materialize(entry, &mut read_paths)?;
            entry.access = Access::local_oci_blob(&blob.digest);

            if layer_digests.insert(blob.digest.clone()) {
                layers.push(oci_descriptor(&media_type, &blob)?);
            }
        }

        let config = descriptor
            .to_canonical_json()
            .map_err(|e| serialization("component descriptor", e))?;
        let config_entry = self.cache.put_bytes(&config)?;
        let config_descriptor = oci_descriptor(
            COMPONENT_CONFIG_MEDIA_TYPE,
            &BlobRef {
                digest: config_entry.digest,
                size: config_entry.size,
            },
        )?;

        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .config(config_descriptor)
            .layers(layers)
            .build()
            .map_err(|e| serialization("manifest", e))?;

        let bytes = serde_json::to_vec(&manifest).map_err(|e| serialization("manifest", e))?;
        let digest = sha256_digest(&bytes);

        log::debug!(
            "Built manifest {} for {} with {} layers",
            digest,
            descriptor.identity(),
            manifest.layers().len()
        );

        Ok(ComponentManifest {
            manifest,
            bytes,
            digest,
        })
    }

    /// Makes sure the entry's bytes are cached and returns their digest and the
    /// layer media type.
    fn materialize(
        &self,
        entry: &Resource,
        read_paths: &mut HashMap<PathBuf, BlobRef>,
    ) -> Result<(BlobRef, String), BuildError> {
        match &entry.access {
            Access::Known(KnownAccess::LocalFilesystemBlob {
                filename,
                media_type,
            }) => {
                let path = self.archive.blob_path(filename).map_err(|e| BuildError::BlobRead {
                    entry: entry.identity().to_string(),
                    path: PathBuf::from(filename),
                    source: io::Error::new(io::ErrorKind::InvalidInput, e.to_string()),
                })?;

                let blob = match read_paths.get(&path) {
                    Some(blob) => blob.clone(),
                    None => {
                        let data = fs::read(&path).map_err(|source| BuildError::BlobRead {
                            entry: entry.identity().to_string(),
                            path: path.clone(),
                            source,
                        })?;
                        let cached = self.cache.put_bytes(&data)?;
                        let blob = BlobRef {
                            digest: cached.digest,
                            size: cached.size,
                        };
                        read_paths.insert(path, blob.clone());
                        blob
                    }
                };

                let media_type = media_type
                    .clone()
                    .unwrap_or_else(|| media_type_for(&entry.resource_type).to_string());
                Ok((blob, media_type))
            }
            Access::Known(KnownAccess::LocalOciBlob { digest }) => {
                let cached = self
                    .cache
                    .entry(digest)?
                    .ok_or_else(|| BuildError::MissingBlob {
                        entry: entry.identity().to_string(),
                        digest: digest.clone(),
                    })?;
                let blob = BlobRef {
                    digest: cached.digest,
                    size: cached.size,
                };
                Ok((blob, media_type_for(&entry.resource_type).to_string()))
            }
            other => Err(BuildError::UnsupportedAccess {
                entry: entry.identity().to_string(),
                access_type: other.access_type().to_string(),
            }),
        }
    }
}

fn oci_descriptor(media_type: &str, blob: &BlobRef) -> Result<Descriptor, BuildError> {
    let digest = Digest::from_str(&blob.digest).map_err(|e| serialization("digest", e))?;
    DescriptorBuilder::default()
        .media_type(MediaType::Other(media_type.to_string()))
        .digest(digest)
        .size(blob.size)
        .build()
        .map_err(|e| serialization("layer descriptor", e))
}

fn serialization<E: std::fmt::Display>(what: &'static str, err: E) -> BuildError {
    BuildError::Serialization {
        what,
        message: err.to_string(),
    }
}
