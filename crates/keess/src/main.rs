use std::process::ExitCode;

use clap::Parser;
use keess::{cli::Settings, logging, supervisor};
use snafu::Report;

#[tokio::main]
async fn main() -> ExitCode {
    let settings = Settings::parse();
    logging::initialize_logging("KEESS_LOG", &settings.log_level);

    if let Err(err) = supervisor::run(settings).await {
        tracing::error!("{}", Report::from_error(err));
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
