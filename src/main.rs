use clap::Parser;
use log::debug;

use component_cli::commands::{self, Cli};
use component_cli::{CancelHandle, Notifier};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let notifier = Notifier::new(cli.verbose);
    debug!("Verbosity: {:?}", notifier.verbosity_level());

    let (handle, cancel) = CancelHandle::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupt received, cancelling");
            handle.cancel();
        }
    });

    if let Err(err) = commands::run(cli.command, &notifier, &cancel).await {
        notifier.finish();
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}
