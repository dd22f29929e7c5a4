//! Deckhand Control
//!
//! This crate turns one operator command into a provisioned, running, routed
//! and database-backed service on a single host, and undoes partial failures.
//!
//! # Architecture
//!
//! The [`Orchestrator`] drives five independently operated subsystems, each
//! behind a trait so tests can replace it:
//!
//! - **Artifact fetch**: [`ArtifactFetcher`], GitHub Releases in production
//! - **Process supervision**: [`ProcessSupervisor`], systemd units
//! - **Routing**: [`ProxyManager`], nginx config files
//! - **Databases**: [`DatabaseManager`], MariaDB schema and principal pairs
//! - **State**: [`ServiceStore`], SQLite
//!
//! # Compensation
//!
//! A deploy records each completed step in a [`Journal`]. When a later step
//! fails, the journal is undone in strict reverse order. Every compensation is
//! attempted and any that fail are reported for manual cleanup:
//!
//! ```text
//! artifact ──▶ database ──▶ secrets ──▶ account ──▶ unit ──▶ route ──▶ record
//!    ▲            ▲            ▲           ▲          │
//!    └────────────┴────────────┴───────────┴──────────┘ undo on failure
//! ```
//!
//! Route activation is the one step whose failure only produces a warning.
//!
//! # Example
//!
//! ```ignore
//! use deckhand_control::{DeckhandConfig, DeployRequest, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = DeckhandConfig::load()?;
//! let orchestrator = Orchestrator::connect(&config, CancellationToken::new()).await?;
//!
//! let mut request = DeployRequest::new("acme/api");
//! request.route = Some("api.example.com".to_owned());
//! let result = orchestrator.deploy(request).await?;
//! println!("{} running on port {}", result.record.name, result.record.port);
//! ```

#![forbid(unsafe_code)]

pub mod artifacts;
pub mod config;
pub mod credentials;
pub mod database;
pub mod deployment;
pub mod error;
pub mod fetcher;
pub mod health;
pub mod poll;
pub mod ports;
pub mod proxy;
pub mod runner;
pub mod store;
pub mod supervisor;
pub mod types;

// Re-export commonly used types at the crate root
pub use artifacts::ArtifactLayout;
pub use config::DeckhandConfig;
pub use credentials::{redact, SecretsWriter};
pub use database::{DatabaseCredentials, DatabaseManager, MariaDbManager};
pub use deployment::{
    Components, DeployRequest, DeployResult, Journal, Orchestrator, RemoveRequest, RemoveResult,
    RollbackResult, ServiceStatus, UpgradeOutcome, UpgradeRequest, UpgradeResult,
};
pub use error::{CompensationFailure, ControlError, ControlResult};
pub use fetcher::{ArtifactFetcher, GithubFetcher};
pub use health::{HealthCheck, TcpHealthChecker};
pub use ports::PortAllocator;
pub use proxy::{NginxProxy, ProxyManager};
pub use runner::{CommandRunner, SystemRunner};
pub use store::{MemoryStore, ServiceStore, SqliteStore};
pub use supervisor::{ProcessSupervisor, SystemdSupervisor};
pub use types::{
    HistoryAction, HistoryEntry, Isolation, RepoRef, Route, RouteKind, SecretsFormat,
    ServiceName, ServiceRecord,
};
