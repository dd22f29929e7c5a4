//! Read-only commands: `list`, `status`, `inspect` and `history`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use deckhand_control::{
    redact, DeckhandConfig, NginxProxy, SecretsWriter, ServiceName, ServiceRecord, ServiceStore,
    SqliteStore, SystemRunner,
};
use tokio_util::sync::CancellationToken;

fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

async fn open_store(config: &DeckhandConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.paths.state_db)
        .await
        .with_context(|| format!("opening state database {}", config.paths.state_db.display()))
}

async fn require(store: &SqliteStore, name: &str) -> Result<ServiceRecord> {
    let name = ServiceName::new(name)?;
    store
        .get(&name)
        .await?
        .with_context(|| format!("service {name} not found"))
}

pub async fn list(config: &DeckhandConfig) -> Result<()> {
    let store = open_store(config).await?;
    let records = store.list().await?;

    if records.is_empty() {
        eprintln!("No services deployed");
        return Ok(());
    }

    println!(
        "{:<20} {:<14} {:<6} {:<30} {:<19}",
        "NAME", "VERSION", "PORT", "ROUTE", "UPDATED"
    );
    for record in &records {
        let route = record
            .route
            .as_ref()
            .map_or_else(|| "-".to_owned(), |r| r.value.clone());
        println!(
            "{:<20} {:<14} {:<6} {:<30} {:<19}",
            record.name.as_str(),
            record.version,
            record.port,
            route,
            timestamp(&record.updated_at)
        );
    }
    Ok(())
}

pub async fn status(config: &DeckhandConfig, cancel: CancellationToken, name: &str) -> Result<()> {
    let orchestrator = super::connect(config, cancel).await?;
    let status = orchestrator.status(name).await?;
    let record = &status.record;

    println!("{}", record.name);
    println!("  State:    {}", if status.active { "active" } else { "inactive" });
    println!("  Repo:     {}", record.repo);
    println!("  Version:  {}", record.version);
    if let Some(previous) = &record.previous_version {
        println!("  Previous: {previous}");
    }
    println!("  Port:     {}", record.port);
    if let Some(route) = &record.route {
        println!("  Route:    {route}");
    }
    if let Some(db) = &record.database {
        println!("  Database: {} (user {})", db.name, db.user);
    }
    println!("  Deployed: {}", timestamp(&record.deployed_at));
    println!("  Updated:  {}", timestamp(&record.updated_at));
    Ok(())
}

async fn print_file(title: &str, path: &Path) {
    println!("# {title}: {}", path.display());
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => println!("{}", contents.trim_end()),
        Err(e) => println!("(unreadable: {e})"),
    }
    println!();
}

pub async fn inspect(config: &DeckhandConfig, name: &str) -> Result<()> {
    let store = open_store(config).await?;
    let record = require(&store, name).await?;
    let iso = record.isolation();

    print_file("unit", &config.paths.unit_dir.join(&iso.unit)).await;

    if let Some(route) = &record.route {
        let proxy = NginxProxy::new(
            Arc::new(SystemRunner::new(CancellationToken::new())),
            config.nginx.clone(),
        );
        if let Some(path) = proxy.config_paths(&record.name, route.kind).first() {
            print_file("proxy", path).await;
        }
    }

    let secrets = SecretsWriter::new(&config.paths.config_dir);
    println!("# secrets: {}", secrets.path(&record.name).display());
    match secrets.read(&record.name).await {
        Ok(contents) => println!("{}", redact(&contents)),
        Err(e) => println!("(unreadable: {e})"),
    }
    Ok(())
}

pub async fn history(config: &DeckhandConfig, name: &str) -> Result<()> {
    let store = open_store(config).await?;
    let entries = store.history(name).await?;

    if entries.is_empty() {
        eprintln!("No history for {name}");
        return Ok(());
    }

    println!("{:<19} {:<9} {:<14} DETAIL", "WHEN", "ACTION", "VERSION");
    for entry in &entries {
        let detail = entry
            .detail
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<19} {:<9} {:<14} {detail}",
            timestamp(&entry.timestamp),
            entry.action.as_str(),
            entry.version.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
