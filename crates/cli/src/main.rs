//! studyrun
//!
//! Headless participant for a study run: loads a component, works with the
//! batch and group session data, and leaves the component the way a page
//! would.

mod cli;
mod console;
mod logging;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    let logging = logging::init_logging()?;
    tracing::info!(
        component = "cli",
        event = "cli.started",
        version = env!("CARGO_PKG_VERSION"),
        log_path = %logging.log_path.display(),
        "studyrun started"
    );

    let result = cli::run(cli).await;
    if let Err(err) = &result {
        tracing::error!(
            component = "cli",
            event = "cli.failed",
            error = %err,
            "studyrun failed"
        );
    }
    drop(logging.guard);
    result
}
