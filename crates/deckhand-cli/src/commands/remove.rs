//! Implementation of the `deckhand remove` command.

use std::io::{self, BufRead, Write};

use anyhow::{bail, Result};
use deckhand_control::{DeckhandConfig, Isolation, RemoveRequest, ServiceName};
use tokio_util::sync::CancellationToken;

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} [y/N] ");
    io::stderr().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

pub async fn run(
    config: &DeckhandConfig,
    cancel: CancellationToken,
    name: String,
    drop_database: bool,
    yes: bool,
) -> Result<()> {
    if drop_database && !yes {
        let iso = Isolation::for_service(&ServiceName::new(name.as_str())?);
        let prompt = format!(
            "Drop database {} and user {} for {name}? This cannot be undone.",
            iso.database, iso.database_user
        );
        if !confirm(&prompt)? {
            bail!("aborted; nothing was removed");
        }
    }

    let orchestrator = super::connect(config, cancel).await?;
    let result = orchestrator
        .remove(RemoveRequest {
            name,
            drop_database,
        })
        .await?;

    println!("Removed {}", result.record.name);
    if result.database_dropped {
        if let Some(db) = &result.record.database {
            println!("  Dropped database {}", db.name);
        }
    } else if let Some(db) = &result.record.database {
        println!("  Kept database {} (use --drop-database to remove it)", db.name);
    }
    super::print_warnings(&result.warnings);

    Ok(())
}
