//! CLI command implementations.

pub mod deploy;
pub mod init;
pub mod inspect;
pub mod remove;
pub mod rollback;
pub mod upgrade;

use deckhand_control::{DeckhandConfig, Orchestrator};
use tokio_util::sync::CancellationToken;

/// Connect an orchestrator to the configured host.
pub async fn connect(
    config: &DeckhandConfig,
    cancel: CancellationToken,
) -> anyhow::Result<Orchestrator> {
    Ok(Orchestrator::connect(config, cancel).await?)
}

/// Print non-fatal warnings collected by a workflow.
pub fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}
