//! Command line surface.
//!
//! ```text
//! component-cli component-archive create <dir> --name <name> --version <version>
//! component-cli component-archive resources add <archive> <resource-file>...
//! component-cli component-archive resources remove <archive> --name <name> [--version <v>]
//! component-cli component-archive export <archive> -o <file> [--format tar|tgz]
//! component-cli remote push [<base-url> <name> <version>] <archive>
//! component-cli ctf add <ctf> <archive>... [--seal]
//! component-cli ctf push <ctf> <base-url>
//! ```

mod component_archive;
mod ctf;
mod remote;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::BlobCache;
use crate::cancel::CancelSignal;
use crate::config::{self, TransportSettings};
use crate::credentials::{CredentialResolver, Privilege, SecretServerSource};
use crate::notifier::Notifier;
use crate::push::PushPipeline;
use crate::registry::OciRegistry;

pub use component_archive::ComponentArchiveCommand;
pub use ctf::CtfCommand;
pub use remote::RemoteCommand;

#[derive(Parser)]
#[command(author, version, about = "Package and publish components as OCI artifacts", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Also switches to text-based progress"
    )]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create and modify local component archives
    #[command(name = "component-archive", alias = "ca")]
    ComponentArchive(ComponentArchiveCommand),

    /// Interact with remote OCI registries
    Remote(RemoteCommand),

    /// Aggregate component archives into a transport bundle
    Ctf(CtfCommand),
}

/// Registry access flags shared by every command that pushes.
#[derive(Args, Debug, Clone, Default)]
pub struct RegistryArgs {
    #[arg(long, help = "Allow plain HTTP for registries without TLS")]
    pub allow_plain_http: bool,

    #[arg(
        long,
        help = "Path to a docker config.json with the registry credentials"
    )]
    pub registry_config: Option<PathBuf>,

    #[arg(
        long = "cc-config",
        help = "Path to a local concourse secret file, used when --registry-config is not given"
    )]
    pub cc_config: Option<PathBuf>,

    #[arg(
        long,
        env = config::CACHE_DIR_ENV,
        help = "OCI blob cache directory"
    )]
    pub cache_dir: Option<PathBuf>,
}

impl RegistryArgs {
    /// Resolves credentials for `hosts` and wires cache, registry and keyring.
    pub async fn pipeline(&self, hosts: &[String]) -> Result<PushPipeline> {
        let cache_dir = config::cache_dir(self.cache_dir.as_deref())
            .context("unable to determine the oci cache directory")?;
        log::debug!("Using oci cache at {}", cache_dir.display());

        let resolver = match (&self.registry_config, &self.cc_config) {
            (Some(path), _) => CredentialResolver::new().with_config_file(path),
            (None, Some(path)) => CredentialResolver::new()
                .with_fallback(Arc::new(SecretServerSource::new(path)))
                .with_min_privilege(Privilege::ReadWrite),
            (None, None) => CredentialResolver::new(),
        };
        let keyring = resolver
            .resolve(hosts)
            .await
            .context("unable to create keyring for the registry")?;

        let registry = OciRegistry::new(TransportSettings {
            allow_plain_http: self.allow_plain_http,
        });

        Ok(PushPipeline::new(
            Arc::new(BlobCache::open(cache_dir)),
            Arc::new(registry),
            Arc::new(keyring),
        ))
    }
}

pub async fn run(command: Command, notifier: &Notifier, cancel: &CancelSignal) -> Result<()> {
    match command {
        Command::ComponentArchive(cmd) => cmd.run(notifier),
        Command::Remote(cmd) => cmd.run(notifier, cancel).await,
        Command::Ctf(cmd) => cmd.run(notifier, cancel).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_push_forms() {
        let cli = Cli::try_parse_from(["component-cli", "remote", "push", "./archive"]).unwrap();
        assert!(matches!(cli.command, Command::Remote(_)));

        let cli = Cli::try_parse_from([
            "component-cli",
            "-vv",
            "remote",
            "push",
            "registry.io",
            "example/foo",
            "1.0.0",
            "./archive",
            "--allow-plain-http",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
