//! Implementation of the `deckhand rollback` command.

use anyhow::Result;
use deckhand_control::DeckhandConfig;
use tokio_util::sync::CancellationToken;

pub async fn run(config: &DeckhandConfig, cancel: CancellationToken, name: &str) -> Result<()> {
    let orchestrator = super::connect(config, cancel).await?;
    let result = orchestrator.rollback(name).await?;

    println!("Rolled back {} from {} to {}", result.name, result.from, result.to);
    Ok(())
}
