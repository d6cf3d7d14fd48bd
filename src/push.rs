//! Publishing a component archive to an OCI registry.
//!
//! [`PushPipeline::push`] runs these steps in order:
//! 1. **Prepare**: check caller-declared name/version against the descriptor and
//!    append the requested base URL as the new effective repository context.
//!    Nothing touches the cache or the network before this succeeds.
//! 2. **Reference**: `<effective base>/component-descriptors/<name>:<version>`.
//! 3. **Build** the manifest through the blob cache, on the blocking pool.
//! 4. **Authenticate**: pick credentials for the reference from the keyring.
//! 5. **Upload** config, layers, then the manifest, raced against cancellation.
//!
//! The registry only sees complete artifacts: a failure before step 5 leaves it
//! untouched and step 5 is idempotent, so retrying a failed push completes it.

use oci_spec::image::Descriptor;
use std::sync::Arc;

use crate::archive::ComponentArchive;
use crate::cache::BlobCache;
use crate::cancel::CancelSignal;
use crate::credentials::Keyring;
use crate::descriptor::{ComponentDescriptor, ComponentIdentity, OCI_REGISTRY_TYPE};
use crate::error::{CacheError, PushError};
use crate::manifest::{ComponentManifest, ManifestBuilder};
use crate::reference::ArtifactReference;
use crate::registry::{ArtifactUpload, BlobUpload, Registry};

/// Caller overrides for a push. All fields are optional; a name or version is
/// only checked against the descriptor, never applied.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub base_url: Option<String>,
    pub component_name: Option<String>,
    pub version: Option<String>,
}

impl PushOptions {
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: Some(base_url.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedComponent {
    pub component: ComponentIdentity,
    pub reference: ArtifactReference,
    pub manifest_digest: String,
}

/// Effective descriptor and target reference of a push that passed validation.
#[derive(Debug, Clone)]
pub struct PreparedPush {
    pub descriptor: ComponentDescriptor,
    pub reference: ArtifactReference,
}

#[derive(Clone)]
pub struct PushPipeline {
    cache: Arc<BlobCache>,
    registry: Arc<dyn Registry>,
    keyring: Arc<Keyring>,
}

impl PushPipeline {
    pub fn new(cache: Arc<BlobCache>, registry: Arc<dyn Registry>, keyring: Arc<Keyring>) -> Self {
        Self {
            cache,
            registry,
            keyring,
        }
    }

    /// Validates `options` against `descriptor` and derives the target reference.
    /// Pure: performs no I/O.
    pub fn prepare(
        descriptor: &ComponentDescriptor,
        options: &PushOptions,
    ) -> Result<PreparedPush, PushError> {
        if let Some(name) = &options.component_name {
            if name != &descriptor.component.name {
                return Err(PushError::Validation(format!(
                    "name in component descriptor '{}' does not match the given name '{}'",
                    descriptor.component.name, name
                )));
            }
        }
        if let Some(version) = &options.version {
            if version != &descriptor.component.version {
                return Err(PushError::Validation(format!(
                    "version in component descriptor '{}' does not match the given version '{}'",
                    descriptor.component.version, version
                )));
            }
        }

        let mut descriptor = descriptor.clone();
        if let Some(base_url) = &options.base_url {
            descriptor.push_repository_context(base_url);
        }

        let context = descriptor.effective_repository_context().ok_or_else(|| {
            PushError::Validation(format!(
                "{} has no repository context; a base URL is required",
                descriptor.identity()
            ))
        })?;
        if context.context_type != OCI_REGISTRY_TYPE {
            return Err(PushError::Validation(format!(
                "unsupported repository context type '{}'",
                context.context_type
            )));
        }

        let reference = ArtifactReference::for_component(
            &context.base_url,
            &descriptor.component.name,
            &descriptor.component.version,
        )
        .map_err(|e| PushError::Validation(e.to_string()))?;

        Ok(PreparedPush {
            descriptor,
            reference,
        })
    }

    pub async fn push(
        &self,
        archive: &ComponentArchive,
        options: &PushOptions,
        cancel: &CancelSignal,
    ) -> Result<PublishedComponent, PushError> {
        let prepared = Self::prepare(archive.descriptor(), options)?;
        let component = prepared.descriptor.identity();
        let reference = prepared.reference;

        if cancel.is_cancelled() {
            return Err(PushError::Cancelled { component });
        }

        log::info!("Building oci artifact for {}", component);
        let build = {
            let cache = Arc::clone(&self.cache);
            let archive = archive.clone();
            let descriptor = prepared.descriptor;
            let component = component.clone();
            tokio::task::spawn_blocking(move || -> Result<ArtifactUpload, PushError> {
                let manifest = ManifestBuilder::new(&cache, &archive)
                    .with_descriptor(&descriptor)
                    .build()
                    .map_err(|source| PushError::ManifestBuild {
                        component: component.clone(),
                        source,
                    })?;
                collect_upload(&cache, &manifest)
                    .map_err(|source| PushError::Cache { component, source })
            })
        };
        let upload = build.await.map_err(|e| PushError::Interrupted {
            component: component.clone(),
            message: format!("artifact build task failed: {}", e),
        })??;

        let auth = self
            .keyring
            .get(&reference.locator())
            .map(|entry| &entry.credentials);
        match auth {
            Some(creds) => log::debug!("Using credentials of {} for {}", creds.username, reference),
            None => log::debug!("Pushing {} anonymously", reference),
        }

        if cancel.is_cancelled() {
            return Err(PushError::Cancelled { component });
        }

        let manifest_digest = tokio::select! {
            _ = cancel.cancelled() => {
                log::warn!("Push of {} cancelled", reference);
                return Err(PushError::Cancelled { component });
            }
            result = self.registry.push(&reference, &upload, auth) => {
                result.map_err(|e| PushError::from_registry(component.clone(), e))?
            }
        };

        log::info!("Pushed {} as {}", component, reference);

        Ok(PublishedComponent {
            component,
            reference,
            manifest_digest,
        })
    }
}

/// Reads every blob of `manifest` back from the cache.
fn collect_upload(cache: &BlobCache, manifest: &ComponentManifest) -> Result<ArtifactUpload, CacheError> {
    let read = |descriptor: &Descriptor| -> Result<BlobUpload, CacheError> {
        let digest = descriptor.digest().to_string();
        let data = cache.get(&digest)?;
        Ok(BlobUpload {
            digest,
            media_type: descriptor.media_type().to_string(),
            data,
        })
    };

    let config = read(manifest.config())?;
    let layers = manifest
        .layers()
        .iter()
        .map(read)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ArtifactUpload {
        config,
        layers,
        manifest: manifest.bytes.clone(),
        manifest_digest: manifest.digest.clone(),
    })
}
