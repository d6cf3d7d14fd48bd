use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::{ComponentArchive, ExportFormat};
use crate::descriptor::{Access, ComponentDescriptor, Label, Relation, Resource, ResourceIdentity};
use crate::notifier::Notifier;

#[derive(Args)]
pub struct ComponentArchiveCommand {
    #[command(subcommand)]
    action: ArchiveAction,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Format {
    Tar,
    Tgz,
}

impl From<Format> for ExportFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Tar => ExportFormat::Tar,
            Format::Tgz => ExportFormat::TarGz,
        }
    }
}

#[derive(Subcommand)]
enum ArchiveAction {
    /// Create an empty component archive
    Create {
        path: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        provider: Option<String>,
    },

    /// Manage the resources of a component archive
    Resources {
        #[command(subcommand)]
        action: ResourceAction,
    },

    /// Pack a component archive into a single tar file
    Export {
        path: PathBuf,
        #[arg(short, long, help = "Output file")]
        output: PathBuf,
        #[arg(short, long, value_enum, default_value = "tar")]
        format: Format,
    },
}

#[derive(Subcommand)]
enum ResourceAction {
    /// Add resources described by one or more YAML files (multiple documents allowed)
    Add {
        archive: PathBuf,
        #[arg(required = true)]
        resource_files: Vec<PathBuf>,
    },

    /// Remove a resource by identity
    Remove {
        archive: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long, help = "Defaults to the component version")]
        version: Option<String>,
        #[arg(long = "extra-identity", value_parser = parse_key_value, help = "key=value, repeatable")]
        extra_identity: Vec<(String, String)>,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

/// One document of a resource file. Exactly one of `input` (a local file to
/// copy into the archive) or `access` must be given.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceDefinition {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(rename = "type")]
    resource_type: String,
    #[serde(default)]
    extra_identity: BTreeMap<String, String>,
    #[serde(default)]
    relation: Option<Relation>,
    #[serde(default)]
    labels: Vec<Label>,
    #[serde(default)]
    access: Option<Access>,
    #[serde(default)]
    input: Option<ResourceInput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceInput {
    #[serde(rename = "type", default)]
    input_type: Option<String>,
    path: PathBuf,
    #[serde(default)]
    media_type: Option<String>,
}

fn read_definitions(path: &Path) -> Result<Vec<ResourceDefinition>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("unable to read resource file {}", path.display()))?;

    let mut definitions = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&contents) {
        let value = serde_yaml::Value::deserialize(document)
            .with_context(|| format!("invalid YAML in {}", path.display()))?;
        if value.is_null() {
            continue;
        }
        let definition: ResourceDefinition = serde_yaml::from_value(value)
            .with_context(|| format!("invalid resource definition in {}", path.display()))?;
        definitions.push(definition);
    }
    Ok(definitions)
}

fn add_definition(
    archive: &mut ComponentArchive,
    definition: ResourceDefinition,
    base_dir: &Path,
) -> Result<ResourceIdentity> {
    let version = definition
        .version
        .unwrap_or_else(|| archive.descriptor().component.version.clone());

    let mut resource = Resource {
        name: definition.name,
        version,
        resource_type: definition.resource_type,
        extra_identity: definition.extra_identity,
        relation: definition.relation,
        labels: definition.labels,
        access: Access::local_filesystem_blob("", None),
    };
    let identity = resource.identity();

    match (definition.input, definition.access) {
        (Some(_), Some(_)) => bail!("{} defines both input and access", identity),
        (None, None) => bail!("{} defines neither input nor access", identity),
        (Some(input), None) => {
            if let Some(kind) = input.input_type.as_deref().filter(|k| *k != "file") {
                bail!("{}: unsupported input type '{}'", identity, kind);
            }
            resource.access = Access::local_filesystem_blob("", input.media_type);
            let input_path = if input.path.is_absolute() {
                input.path
            } else {
                base_dir.join(input.path)
            };
            archive
                .add_local_resource(resource, &input_path)
                .with_context(|| format!("unable to add {}", identity))?;
        }
        (None, Some(access)) => {
            resource.access = access;
            archive
                .add_resource(resource)
                .with_context(|| format!("unable to add {}", identity))?;
        }
    }
    Ok(identity)
}

impl ComponentArchiveCommand {
    pub fn run(self, notifier: &Notifier) -> Result<()> {
        match self.action {
            ArchiveAction::Create {
                path,
                name,
                version,
                provider,
            } => {
                let mut descriptor = ComponentDescriptor::new(&name, &version);
                descriptor.component.provider = provider;
                ComponentArchive::create(&path, descriptor)
                    .with_context(|| format!("unable to create component archive at {}", path.display()))?;
                notifier.success(&format!("Created component archive {}", path.display()));
            }
            ArchiveAction::Resources {
                action:
                    ResourceAction::Add {
                        archive,
                        resource_files,
                    },
            } => {
                let mut component = ComponentArchive::load(&archive)
                    .with_context(|| format!("unable to load component archive {}", archive.display()))?;
                for file in &resource_files {
                    let base_dir = file.parent().unwrap_or_else(|| Path::new("."));
                    for definition in read_definitions(file)? {
                        let identity = add_definition(&mut component, definition, base_dir)?;
                        notifier.info(&format!("Added resource {}", identity));
                    }
                }
                notifier.finish();
            }
            ArchiveAction::Resources {
                action:
                    ResourceAction::Remove {
                        archive,
                        name,
                        version,
                        extra_identity,
                    },
            } => {
                let mut component = ComponentArchive::load(&archive)
                    .with_context(|| format!("unable to load component archive {}", archive.display()))?;
                let identity = ResourceIdentity {
                    name,
                    version: version
                        .unwrap_or_else(|| component.descriptor().component.version.clone()),
                    extra_identity: extra_identity.into_iter().collect(),
                };
                if !component.remove_resource(&identity)? {
                    bail!("resource {} not found", identity);
                }
                notifier.success(&format!("Removed resource {}", identity));
            }
            ArchiveAction::Export {
                path,
                output,
                format,
            } => {
                let component = ComponentArchive::load(&path)
                    .with_context(|| format!("unable to load component archive {}", path.display()))?;
                component
                    .export_to(&output, format.into())
                    .with_context(|| format!("unable to export to {}", output.display()))?;
                notifier.success(&format!("Exported {} to {}", component.descriptor().identity(), output.display()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const RESOURCES: &str = r#"
---
name: cli
type: executable
input:
  type: file
  path: ./cli.bin
  mediaType: application/x-elf
---
name: image
version: 2.0.0
type: ociImage
relation: external
access:
  type: ociRegistry
  imageReference: registry.io/image:2.0.0
"#;

    #[test]
    fn test_add_definitions() {
        let dir = tempdir().unwrap();
        let mut archive = ComponentArchive::create(
            dir.path().join("archive"),
            ComponentDescriptor::new("example/foo", "1.0.0"),
        )
        .unwrap();

        fs::write(dir.path().join("cli.bin"), b"binary").unwrap();
        let resource_file = dir.path().join("resources.yaml");
        fs::write(&resource_file, RESOURCES).unwrap();

        let definitions = read_definitions(&resource_file).unwrap();
        assert_eq!(definitions.len(), 2);
        for definition in definitions {
            add_definition(&mut archive, definition, dir.path()).unwrap();
        }

        let resources = &archive.descriptor().component.resources;
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].version, "1.0.0");
        assert_eq!(
            resources[0].access.local_blob().unwrap().1,
            Some("application/x-elf")
        );
        assert_eq!(resources[1].access.access_type(), "ociRegistry");

        let reloaded = ComponentArchive::load(archive.root()).unwrap();
        assert_eq!(reloaded.descriptor(), archive.descriptor());
    }

    #[test]
    fn test_definition_needs_input_or_access() {
        let dir = tempdir().unwrap();
        let mut archive = ComponentArchive::create(
            dir.path().join("archive"),
            ComponentDescriptor::new("example/foo", "1.0.0"),
        )
        .unwrap();
        let resource_file = dir.path().join("resources.yaml");
        fs::write(&resource_file, "name: broken\ntype: blob\n").unwrap();

        let definition = read_definitions(&resource_file).unwrap().remove(0);
        assert!(add_definition(&mut archive, definition, dir.path()).is_err());
    }
}
