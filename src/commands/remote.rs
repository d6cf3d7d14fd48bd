use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use super::RegistryArgs;
use crate::archive::ComponentArchive;
use crate::cancel::CancelSignal;
use crate::notifier::Notifier;
use crate::push::{PushOptions, PushPipeline};

#[derive(Args)]
pub struct RemoteCommand {
    #[command(subcommand)]
    action: RemoteAction,
}

#[derive(Subcommand)]
enum RemoteAction {
    /// Push a component archive to an OCI registry.
    ///
    /// Either `push <archive>`, reading everything from the component descriptor,
    /// or `push <base-url> <name> <version> <archive>`, which checks name and
    /// version and adds the base URL as repository context.
    Push {
        #[arg(num_args = 1..=4, required = true, value_name = "ARGS")]
        args: Vec<String>,

        #[command(flatten)]
        registry: RegistryArgs,
    },
}

impl RemoteCommand {
    pub async fn run(self, notifier: &Notifier, cancel: &CancelSignal) -> Result<()> {
        match self.action {
            RemoteAction::Push { args, registry } => push(args, registry, notifier, cancel).await,
        }
    }
}

fn parse_push_args(args: Vec<String>) -> Result<(PathBuf, PushOptions)> {
    match args.as_slice() {
        [path] => Ok((PathBuf::from(path), PushOptions::default())),
        [base_url, name, version, path] => Ok((
            PathBuf::from(path),
            PushOptions {
                base_url: Some(base_url.clone()),
                component_name: Some(name.clone()),
                version: Some(version.clone()),
            },
        )),
        _ => bail!("expected either <archive> or <base-url> <name> <version> <archive>"),
    }
}

async fn push(
    args: Vec<String>,
    registry: RegistryArgs,
    notifier: &Notifier,
    cancel: &CancelSignal,
) -> Result<()> {
    let (path, options) = parse_push_args(args)?;

    notifier.info(&format!("Loading component archive {}", path.display()));
    let archive = ComponentArchive::load(&path)
        .with_context(|| format!("unable to build component archive from {}", path.display()))?;

    let prepared = PushPipeline::prepare(archive.descriptor(), &options)?;
    notifier.debug(&format!("Target reference: {}", prepared.reference));

    let pipeline = registry
        .pipeline(&[prepared.reference.host().to_string()])
        .await?;

    notifier.info(&format!("Pushing {}", prepared.reference));
    let published = pipeline.push(&archive, &options, cancel).await?;

    notifier.success(&format!("Successfully uploaded {}", published.reference));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_push_args() {
        let (path, options) = parse_push_args(vec!["./archive".to_string()]).unwrap();
        assert_eq!(path, PathBuf::from("./archive"));
        assert!(options.base_url.is_none());

        let (path, options) = parse_push_args(
            ["registry.io", "example/foo", "1.0.0", "./archive"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
        .unwrap();
        assert_eq!(path, PathBuf::from("./archive"));
        assert_eq!(options.component_name.as_deref(), Some("example/foo"));

        assert!(parse_push_args(vec!["a".to_string(), "b".to_string()]).is_err());
    }
}
