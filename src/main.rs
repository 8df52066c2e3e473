use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tsidd::{daemon, logging, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbosity);

    match daemon::execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
