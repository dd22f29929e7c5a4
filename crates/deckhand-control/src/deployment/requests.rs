//! Workflow requests and results.

use std::collections::BTreeMap;

use crate::types::{RouteKind, SecretsFormat, ServiceRecord};

/// Request to deploy a new service.
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    /// Repository reference, `owner/repo` or `repo`.
    pub repo: String,
    /// Service name; defaults to the repository's last path segment.
    pub name: Option<String>,
    /// Version to deploy; defaults to `latest`.
    pub version: Option<String>,
    /// Explicit port; allocated from the range when absent.
    pub port: Option<u16>,
    /// Host name or path prefix to route.
    pub route: Option<String>,
    /// Route shape; inferred from the route value when absent.
    pub route_kind: Option<RouteKind>,
    /// Extra entries for the secrets file.
    pub extra_env: BTreeMap<String, String>,
    /// Skip database provisioning.
    pub skip_database: bool,
    /// Format of the secrets file.
    pub secrets_format: SecretsFormat,
}

impl DeployRequest {
    /// Deploy the latest release of `repo` with defaults.
    #[must_use]
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            ..Self::default()
        }
    }
}

/// Outcome of a successful deploy.
#[derive(Debug, Clone)]
pub struct DeployResult {
    /// The stored service record.
    pub record: ServiceRecord,
    /// Non-fatal problems, such as a route that could not be activated.
    pub warnings: Vec<String>,
}

/// Request to move a service to another version.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Service name.
    pub name: String,
    /// Target version; defaults to `latest`.
    pub version: Option<String>,
}

/// How an upgrade ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// The new version is running and healthy.
    Upgraded,
    /// The target resolved to the installed version.
    Unchanged,
    /// The new version failed and the previous one was restored.
    RolledBack {
        /// Why the new version was abandoned.
        reason: String,
    },
}

/// Result of an upgrade.
#[derive(Debug, Clone)]
pub struct UpgradeResult {
    /// Service name.
    pub name: String,
    /// Version before the upgrade.
    pub from: String,
    /// Version the upgrade targeted.
    pub to: String,
    /// How it ended.
    pub outcome: UpgradeOutcome,
    /// Non-fatal problems, such as failed pruning.
    pub warnings: Vec<String>,
}

impl UpgradeResult {
    /// Whether the upgrade was abandoned in favour of the previous version.
    #[must_use]
    pub const fn rolled_back(&self) -> bool {
        matches!(self.outcome, UpgradeOutcome::RolledBack { .. })
    }
}

/// Result of a rollback.
#[derive(Debug, Clone)]
pub struct RollbackResult {
    /// Service name.
    pub name: String,
    /// Version that was running.
    pub from: String,
    /// Version now running.
    pub to: String,
}

/// Request to remove a service.
#[derive(Debug, Clone)]
pub struct RemoveRequest {
    /// Service name.
    pub name: String,
    /// Also drop the service's database and principal.
    pub drop_database: bool,
}

/// Result of a removal.
#[derive(Debug, Clone)]
pub struct RemoveResult {
    /// The record that was deleted.
    pub record: ServiceRecord,
    /// Whether the database was dropped.
    pub database_dropped: bool,
    /// Teardown steps that failed without stopping the removal.
    pub warnings: Vec<String>,
}

/// A service record plus its live state.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    /// Stored record.
    pub record: ServiceRecord,
    /// Whether the supervisor reports the unit active.
    pub active: bool,
}
