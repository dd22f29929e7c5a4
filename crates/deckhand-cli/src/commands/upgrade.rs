//! Implementation of the `deckhand upgrade` command.

use anyhow::{bail, Result};
use deckhand_control::{DeckhandConfig, UpgradeOutcome, UpgradeRequest};
use tokio_util::sync::CancellationToken;

pub async fn run(
    config: &DeckhandConfig,
    cancel: CancellationToken,
    name: String,
    version: Option<String>,
) -> Result<()> {
    let orchestrator = super::connect(config, cancel).await?;
    let result = orchestrator.upgrade(UpgradeRequest { name, version }).await?;
    super::print_warnings(&result.warnings);

    match result.outcome {
        UpgradeOutcome::Upgraded => {
            println!("Upgraded {} from {} to {}", result.name, result.from, result.to);
            Ok(())
        }
        UpgradeOutcome::Unchanged => {
            println!("{} is already at {}", result.name, result.from);
            Ok(())
        }
        // the service is healthy again, but the upgrade did not happen
        UpgradeOutcome::RolledBack { reason } => {
            bail!("upgrade of {} to {} rolled back: {reason}", result.name, result.to)
        }
    }
}
