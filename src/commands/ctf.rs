use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use super::RegistryArgs;
use crate::archive::ComponentArchive;
use crate::cancel::CancelSignal;
use crate::config::ReplicationSettings;
use crate::ctf::TransportBundle;
use crate::notifier::Notifier;
use crate::reference::ArtifactReference;

#[derive(Args)]
pub struct CtfCommand {
    #[command(subcommand)]
    action: CtfAction,
}

#[derive(Subcommand)]
enum CtfAction {
    /// Add component archives (directories or tar files) to a transport bundle
    Add {
        ctf: PathBuf,
        #[arg(required = true)]
        archives: Vec<PathBuf>,
        #[arg(long, help = "Seal the bundle afterwards")]
        seal: bool,
    },

    /// Push every component of a transport bundle to a registry
    Push {
        ctf: PathBuf,
        base_url: String,
        #[arg(long, default_value_t = ReplicationSettings::default().concurrency)]
        concurrency: usize,
        #[command(flatten)]
        registry: RegistryArgs,
    },
}

impl CtfCommand {
    pub async fn run(self, notifier: &Notifier, cancel: &CancelSignal) -> Result<()> {
        match self.action {
            CtfAction::Add {
                ctf,
                archives,
                seal,
            } => {
                let mut bundle = TransportBundle::open(&ctf)
                    .with_context(|| format!("unable to open transport bundle {}", ctf.display()))?;
                for path in &archives {
                    let archive = ComponentArchive::load(path).with_context(|| {
                        format!("unable to load component archive {}", path.display())
                    })?;
                    let entry = bundle.add_archive(&archive)?;
                    notifier.info(&format!("Added {} ({})", entry.component, entry.digest));
                }
                if seal {
                    bundle.seal();
                }
                bundle.flush()?;
                notifier.success(&format!(
                    "{} contains {} components",
                    ctf.display(),
                    bundle.entries().len()
                ));
                Ok(())
            }
            CtfAction::Push {
                ctf,
                base_url,
                concurrency,
                registry,
            } => {
                let bundle = TransportBundle::open(&ctf)
                    .with_context(|| format!("unable to open transport bundle {}", ctf.display()))?;
                if bundle.entries().is_empty() {
                    bail!("transport bundle {} is empty", ctf.display());
                }

                // Every entry lands below the same base URL, so one host covers the keyring.
                let first = &bundle.entries()[0].component;
                let host = ArtifactReference::for_component(&base_url, &first.name, &first.version)?
                    .host()
                    .to_string();
                let pipeline = registry.pipeline(&[host]).await?;

                notifier.info(&format!(
                    "Replicating {} components to {}",
                    bundle.entries().len(),
                    base_url
                ));
                let results = bundle
                    .replicate(
                        &pipeline,
                        &base_url,
                        &ReplicationSettings::with_concurrency(concurrency),
                        cancel,
                    )
                    .await;

                let total = results.len();
                let mut failed = 0;
                for result in &results {
                    match &result.outcome {
                        Ok(published) if result.is_alias() => notifier.success(&format!(
                            "Successfully uploaded {} (bundle entry {})",
                            published.reference, result.component
                        )),
                        Ok(published) => {
                            notifier.success(&format!("Successfully uploaded {}", published.reference))
                        }
                        Err(err) => {
                            failed += 1;
                            notifier.warn(&format!("{}: {}", result.component, err));
                        }
                    }
                }

                if failed > 0 {
                    bail!("{} of {} components failed to replicate", failed, total);
                }
                Ok(())
            }
        }
    }
}
