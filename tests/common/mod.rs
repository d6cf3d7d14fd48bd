//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use component_cli::cache::BlobCache;
use component_cli::credentials::Keyring;
use component_cli::descriptor::{Access, ComponentDescriptor, Relation, Resource};
use component_cli::push::PushPipeline;
use component_cli::registry::MemoryRegistry;
use component_cli::ComponentArchive;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub const BASE_URL: &str = "example-registry.io/components";

/// An archive for `name:version` with one local blob resource holding `payload`.
pub fn archive_with_blob(dir: &Path, name: &str, version: &str, payload: &[u8]) -> ComponentArchive {
    let slug = format!("{}-{}", name.replace('/', "_"), version);
    let mut archive =
        ComponentArchive::create(dir.join(&slug), ComponentDescriptor::new(name, version)).unwrap();

    let input = dir.join(format!("{}.bin", slug));
    fs::write(&input, payload).unwrap();
    archive
        .add_local_resource(local_resource("data", version), &input)
        .unwrap();
    archive
}

pub fn local_resource(name: &str, version: &str) -> Resource {
    Resource {
        name: name.to_string(),
        version: version.to_string(),
        resource_type: "blob".to_string(),
        extra_identity: Default::default(),
        relation: None,
        labels: Vec::new(),
        access: Access::local_filesystem_blob("", None),
    }
}

pub fn external_image(name: &str, image: &str) -> Resource {
    Resource {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        resource_type: "ociImage".to_string(),
        extra_identity: Default::default(),
        relation: Some(Relation::External),
        labels: Vec::new(),
        access: Access::oci_registry(image),
    }
}

pub fn pipeline(cache_dir: &Path, registry: &Arc<MemoryRegistry>, keyring: Keyring) -> PushPipeline {
    PushPipeline::new(
        Arc::new(BlobCache::open(cache_dir)),
        registry.clone(),
        Arc::new(keyring),
    )
}
