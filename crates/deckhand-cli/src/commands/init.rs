//! Implementation of the `deckhand init` command.

use std::path::Path;

use anyhow::{Context, Result};
use deckhand_control::{DeckhandConfig, MariaDbManager, SqliteStore};

/// Write the starter config if none exists, otherwise check the host.
pub async fn run(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        return write_template(config_path).await;
    }

    let config = DeckhandConfig::from_file(config_path)?;
    println!("Checking setup from {}", config_path.display());

    let mut problems = 0;
    let mut check = |label: &str, result: Result<()>| match result {
        Ok(()) => println!("  ok    {label}"),
        Err(e) => {
            problems += 1;
            println!("  FAIL  {label}: {e:#}");
        }
    };

    check("configuration", config.validate().map_err(Into::into));

    for dir in [
        &config.paths.bin_dir,
        &config.paths.config_dir,
        &config.nginx.locations_dir,
    ] {
        let created = tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()));
        check(&format!("directory {}", dir.display()), created);
    }

    for dir in [&config.nginx.sites_dir, &config.nginx.enabled_dir] {
        let found = if dir.is_dir() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("missing; is nginx installed?"))
        };
        check(&format!("nginx {}", dir.display()), found);
    }

    let state = SqliteStore::open(&config.paths.state_db)
        .await
        .map(|_| ())
        .map_err(Into::into);
    check(&format!("state database {}", config.paths.state_db.display()), state);

    let mariadb = match MariaDbManager::connect(&config.mariadb) {
        Ok(manager) => manager.ping().await.map_err(Into::into),
        Err(e) => Err(e.into()),
    };
    check(
        &format!("MariaDB at {}:{}", config.mariadb.host, config.mariadb.port),
        mariadb,
    );

    if problems > 0 {
        anyhow::bail!("{problems} check(s) failed");
    }
    println!("Ready to deploy.");
    Ok(())
}

async fn write_template(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    tokio::fs::write(path, DeckhandConfig::template())
        .await
        .with_context(|| format!("writing {}", path.display()))?;

    println!("Created {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Set github.token and github.owner");
    println!("  2. Put the MariaDB admin password in the admin_password_file");
    println!("  3. Run deckhand init again to check the setup");
    Ok(())
}
