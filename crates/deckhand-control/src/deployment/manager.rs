//! Core orchestration logic.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactLayout;
use crate::config::DeckhandConfig;
use crate::credentials::{validate_extra_env, SecretEntries, SecretsWriter};
use crate::database::{DatabaseCredentials, DatabaseManager, MariaDbManager};
use crate::error::{CompensationFailure, ControlError, ControlResult};
use crate::fetcher::{ArtifactFetcher, GithubFetcher, LATEST};
use crate::health::{HealthCheck, TcpHealthChecker};
use crate::ports::PortAllocator;
use crate::proxy::{NginxProxy, ProxyManager};
use crate::runner::{CommandRunner, SystemRunner};
use crate::store::{ServiceStore, SqliteStore};
use crate::supervisor::{ProcessSupervisor, SystemdSupervisor};
use crate::types::{
    HistoryAction, HistoryEntry, Isolation, RepoRef, Route, ServiceName, ServiceRecord,
};

use super::journal::{CompletedStep, Journal};
use super::requests::{
    DeployRequest, DeployResult, RemoveRequest, RemoveResult, RollbackResult, ServiceStatus,
    UpgradeOutcome, UpgradeRequest, UpgradeResult,
};

/// Everything the orchestrator drives.
///
/// The trait objects are the seams tests replace; the layout and secrets
/// writer are plain filesystem code and are used as-is.
pub struct Components {
    /// State store.
    pub store: Arc<dyn ServiceStore>,
    /// Release source.
    pub fetcher: Arc<dyn ArtifactFetcher>,
    /// Process supervisor.
    pub supervisor: Arc<dyn ProcessSupervisor>,
    /// Reverse proxy.
    pub proxy: Arc<dyn ProxyManager>,
    /// Database server.
    pub database: Arc<dyn DatabaseManager>,
    /// Port health checker.
    pub health: Arc<dyn HealthCheck>,
    /// Port allocator over the store.
    pub ports: PortAllocator,
    /// Artifact layout.
    pub layout: ArtifactLayout,
    /// Secrets writer.
    pub secrets: SecretsWriter,
    /// Database host handed to services.
    pub database_host: String,
    /// Database port handed to services.
    pub database_port: u16,
}

/// Plan for a deploy, fully validated before any side effect.
struct DeployPlan {
    name: ServiceName,
    repo: RepoRef,
    version: String,
    port: u16,
    route: Option<Route>,
    request: DeployRequest,
}

/// Coordinates the deploy, upgrade, rollback and remove workflows.
///
/// Steps within a workflow run strictly in order. Concurrent invocations
/// against the same service are not serialised here; only the store
/// serialises its own writes.
pub struct Orchestrator {
    store: Arc<dyn ServiceStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    supervisor: Arc<dyn ProcessSupervisor>,
    proxy: Arc<dyn ProxyManager>,
    database: Arc<dyn DatabaseManager>,
    health: Arc<dyn HealthCheck>,
    ports: PortAllocator,
    layout: ArtifactLayout,
    secrets: SecretsWriter,
    database_host: String,
    database_port: u16,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator over the given components.
    #[must_use]
    pub fn new(components: Components, cancel: CancellationToken) -> Self {
        Self {
            store: components.store,
            fetcher: components.fetcher,
            supervisor: components.supervisor,
            proxy: components.proxy,
            database: components.database,
            health: components.health,
            ports: components.ports,
            layout: components.layout,
            secrets: components.secrets,
            database_host: components.database_host,
            database_port: components.database_port,
            cancel,
        }
    }

    /// Build the production component set from configuration.
    pub async fn connect(config: &DeckhandConfig, cancel: CancellationToken) -> ControlResult<Self> {
        let store: Arc<dyn ServiceStore> = Arc::new(SqliteStore::open(&config.paths.state_db).await?);
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(cancel.clone()));
        let layout = ArtifactLayout::new(&config.paths.bin_dir);
        let secrets = SecretsWriter::new(&config.paths.config_dir);

        let components = Components {
            ports: PortAllocator::new(&config.ports, Arc::clone(&store)),
            store,
            fetcher: Arc::new(GithubFetcher::new(&config.github, &config.releases)?),
            supervisor: Arc::new(SystemdSupervisor::new(
                Arc::clone(&runner),
                &config.paths.unit_dir,
                layout.clone(),
                secrets.clone(),
                config.timeouts.start_policy(),
            )),
            proxy: Arc::new(NginxProxy::new(runner, config.nginx.clone())),
            database: Arc::new(MariaDbManager::connect(&config.mariadb)?),
            health: Arc::new(TcpHealthChecker::new(config.timeouts.health_policy())),
            layout,
            secrets,
            database_host: config.mariadb.host.clone(),
            database_port: config.mariadb.port,
        };

        Ok(Self::new(components, cancel))
    }

    /// Token that interrupts the running workflow when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ------------------------------------------------------------------
    // Deploy
    // ------------------------------------------------------------------

    /// Deploy a new service.
    ///
    /// This orchestrates the full deployment:
    /// 1. Validate the request and assign a port
    /// 2. Resolve the version, fetch and link the artifact
    /// 3. Provision a database (unless skipped)
    /// 4. Write the secrets file
    /// 5. Create the account, write the unit, enable and start it
    /// 6. Activate the route (a failure here only produces a warning)
    /// 7. Record the service and append history
    ///
    /// A failure after the artifact fetch undoes every completed step in
    /// reverse order before the error is returned.
    pub async fn deploy(&self, request: DeployRequest) -> ControlResult<DeployResult> {
        let plan = self.plan_deploy(request).await?;
        let mut journal = Journal::new(plan.name.clone());

        info!(
            service = %plan.name,
            repo = %plan.repo,
            version = %plan.version,
            port = plan.port,
            "starting deploy"
        );

        match self.execute_deploy(&plan, &mut journal).await {
            Ok(result) => {
                self.append_history(
                    HistoryEntry::now(&plan.name, HistoryAction::Deploy, Some(plan.version.as_str()))
                        .with_detail("port", plan.port.to_string()),
                )
                .await;
                info!(service = %plan.name, version = %plan.version, "deploy complete");
                Ok(result)
            }
            Err(e) => Err(self.abandon(journal, e).await),
        }
    }

    async fn plan_deploy(&self, request: DeployRequest) -> ControlResult<DeployPlan> {
        let repo = RepoRef::new(request.repo.as_str())?;
        let name = ServiceName::new(
            request
                .name
                .clone()
                .unwrap_or_else(|| repo.last_segment().to_owned()),
        )?;
        let route = request
            .route
            .as_deref()
            .filter(|r| !r.is_empty())
            .map(|r| Route::new(r, request.route_kind))
            .transpose()?;
        validate_extra_env(&request.extra_env)?;

        if self.store.get(&name).await?.is_some() {
            return Err(ControlError::ServiceExists(name.to_string()));
        }

        let port = self.ports.assign(request.port).await?;
        let version = self
            .fetcher
            .resolve_version(&repo, request.version.as_deref().unwrap_or(LATEST))
            .await?;

        Ok(DeployPlan {
            name,
            repo,
            version,
            port,
            route,
            request,
        })
    }

    async fn execute_deploy(
        &self,
        plan: &DeployPlan,
        journal: &mut Journal,
    ) -> ControlResult<DeployResult> {
        let name = &plan.name;
        let mut warnings = Vec::new();

        self.ensure_live()?;
        let bytes = self.fetcher.download(&plan.repo, &plan.version, name).await?;
        self.layout.install(name, &plan.version, &bytes).await?;
        journal.record(CompletedStep::Artifact {
            version: plan.version.clone(),
        });
        self.layout.activate(name, &plan.version).await?;
        debug!(service = %name, step = "artifact", "step complete");

        let mut credentials: Option<DatabaseCredentials> = None;
        if !plan.request.skip_database {
            self.ensure_live()?;
            credentials = Some(self.database.create_database(name).await?);
            journal.record(CompletedStep::Database);
            debug!(service = %name, step = "database", "step complete");
        }

        self.ensure_live()?;
        let mut entries = SecretEntries::for_port(plan.port);
        if let Some(creds) = &credentials {
            entries = entries.with_database(&self.database_host, self.database_port, creds);
        }
        let entries = entries.with_extra(&plan.request.extra_env);
        self.secrets
            .write(name, &entries, plan.request.secrets_format)
            .await?;
        journal.record(CompletedStep::Secrets);
        debug!(service = %name, step = "secrets", "step complete");

        self.ensure_live()?;
        self.supervisor.create_account(name).await?;
        journal.record(CompletedStep::Account);

        self.supervisor.write_unit(name).await?;
        journal.record(CompletedStep::Unit);
        self.supervisor.reload().await?;
        self.supervisor.enable(name).await?;
        self.supervisor.start(name, &self.cancel).await?;
        debug!(service = %name, step = "unit", "step complete");

        let mut route = None;
        if let Some(wanted) = &plan.route {
            self.ensure_live()?;
            match self.proxy.activate_route(name, wanted, plan.port).await {
                Ok(()) => {
                    journal.record(CompletedStep::Route);
                    route = Some(wanted.clone());
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(service = %name, route = %wanted, error = %e, "route activation failed");
                    warnings.push(format!(
                        "route {wanted} was not activated: {e}; the service is reachable on port {}",
                        plan.port
                    ));
                }
            }
        }

        let now = Utc::now();
        let record = ServiceRecord {
            name: name.clone(),
            repo: plan.repo.clone(),
            version: plan.version.clone(),
            previous_version: None,
            port: plan.port,
            route,
            database: credentials.as_ref().map(DatabaseCredentials::binding),
            extra_env: plan.request.extra_env.clone(),
            deployed_at: now,
            updated_at: now,
        };
        self.store.insert(&record).await?;

        Ok(DeployResult { record, warnings })
    }

    /// Turn a failed deploy into its final error.
    ///
    /// Cancellation leaves everything applied. Any other failure undoes the
    /// journal in reverse, attempting every compensation.
    async fn abandon(&self, journal: Journal, cause: ControlError) -> ControlError {
        if cause.is_cancelled() || self.cancel.is_cancelled() {
            let applied = journal.applied();
            warn!(service = %journal.service(), ?applied, "deploy cancelled; completed steps left in place");
            return ControlError::Cancelled { applied };
        }

        error!(service = %journal.service(), error = %cause, "deploy failed; rolling back");

        let name = journal.service().clone();
        let mut failures = Vec::new();
        for step in journal.into_undo_order() {
            match self.compensate(&name, &step).await {
                Ok(()) => debug!(service = %name, step = step.label(), "compensated"),
                Err(e) => {
                    warn!(service = %name, step = step.label(), error = %e, "compensation failed");
                    failures.push(CompensationFailure {
                        step: step.label().to_owned(),
                        error: e.to_string(),
                        manual_cleanup: self.manual_cleanup(&name, &step),
                    });
                }
            }
        }

        if failures.is_empty() {
            info!(service = %name, "rollback complete");
            cause
        } else {
            ControlError::RollbackIncomplete {
                cause: Box::new(cause),
                failures,
            }
        }
    }

    async fn compensate(&self, name: &ServiceName, step: &CompletedStep) -> ControlResult<()> {
        match step {
            CompletedStep::Route => self.proxy.deactivate_route(name).await,
            CompletedStep::Unit => {
                // the unit may never have started
                if let Err(e) = self.supervisor.stop(name).await {
                    debug!(service = %name, error = %e, "stop during rollback");
                }
                if let Err(e) = self.supervisor.disable(name).await {
                    debug!(service = %name, error = %e, "disable during rollback");
                }
                self.supervisor.remove_unit(name).await?;
                self.supervisor.reload().await
            }
            CompletedStep::Account => self.supervisor.remove_account(name).await,
            CompletedStep::Secrets => self.secrets.remove(name).await,
            CompletedStep::Database => self.database.drop_database(name).await,
            CompletedStep::Artifact { .. } => self.layout.remove_all(name).await,
        }
    }

    fn manual_cleanup(&self, name: &ServiceName, step: &CompletedStep) -> String {
        let iso = Isolation::for_service(name);
        let what = match step {
            CompletedStep::Route => format!("proxy config {}", iso.proxy_config),
            CompletedStep::Unit => format!("unit {}", iso.unit),
            CompletedStep::Account => format!("system account {}", iso.account),
            CompletedStep::Secrets => self.secrets.dir(name).display().to_string(),
            CompletedStep::Database => format!(
                "database {} and user '{}'@'localhost'",
                iso.database, iso.database_user
            ),
            CompletedStep::Artifact { .. } => self.layout.service_dir(name).display().to_string(),
        };
        format!("remove {what}")
    }

    // ------------------------------------------------------------------
    // Upgrade
    // ------------------------------------------------------------------

    /// Move a service to another version.
    ///
    /// If the new version fails to start or never accepts connections on its
    /// port, the previous version is relinked and restarted and the result is
    /// [`UpgradeOutcome::RolledBack`]. Only when that fallback itself fails
    /// does the call return an error.
    pub async fn upgrade(&self, request: UpgradeRequest) -> ControlResult<UpgradeResult> {
        let mut record = self.require(&request.name).await?;
        let name = record.name.clone();
        let old = record.version.clone();

        let new = self
            .fetcher
            .resolve_version(&record.repo, request.version.as_deref().unwrap_or(LATEST))
            .await?;

        let mut result = UpgradeResult {
            name: name.to_string(),
            from: old.clone(),
            to: new.clone(),
            outcome: UpgradeOutcome::Unchanged,
            warnings: Vec::new(),
        };
        if new == old {
            info!(service = %name, version = %old, "already at requested version");
            return Ok(result);
        }

        info!(service = %name, from = %old, to = %new, "starting upgrade");

        self.ensure_live()?;
        let bytes = self.fetcher.download(&record.repo, &new, &name).await?;
        self.layout.install(&name, &new, &bytes).await?;

        self.ensure_live()?;
        self.supervisor.stop(&name).await?;

        if let Err(e) = self.layout.activate(&name, &new).await {
            warn!(service = %name, error = %e, "relink failed; restoring previous version");
            if let Err(relink) = self.layout.activate(&name, &old).await {
                warn!(service = %name, error = %relink, "restoring link failed");
            }
            if let Err(restart) = self.supervisor.start(&name, &self.cancel).await {
                warn!(service = %name, error = %restart, "restarting previous version failed");
            }
            return Err(e);
        }

        let failure = match self.supervisor.start(&name, &self.cancel).await {
            Ok(()) => match self.health.wait_for_port(record.port, &self.cancel).await {
                Ok(()) => None,
                Err(e) if e.is_cancelled() => return Err(self.interrupted(&name, &new)),
                Err(e) => Some(format!("health check failed for {new}: {e}")),
            },
            Err(e) if e.is_cancelled() => return Err(self.interrupted(&name, &new)),
            Err(e) => Some(format!("{new} failed to start: {e}")),
        };

        if let Some(reason) = failure {
            return self.fall_back(&name, &old, reason, result).await;
        }

        match self.layout.prune(&name, &[new.as_str(), old.as_str()]).await {
            Ok(removed) if !removed.is_empty() => {
                debug!(service = %name, ?removed, "pruned old artifacts");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(service = %name, error = %e, "pruning old artifacts failed");
                result.warnings.push(format!("pruning old artifacts failed: {e}"));
            }
        }

        record.previous_version = Some(old.clone());
        record.version = new.clone();
        record.updated_at = Utc::now();
        self.store.update(&record).await?;

        self.append_history(
            HistoryEntry::now(&name, HistoryAction::Upgrade, Some(new.as_str())).with_detail("from", &old),
        )
        .await;

        info!(service = %name, from = %old, to = %new, "upgrade complete");
        result.outcome = UpgradeOutcome::Upgraded;
        Ok(result)
    }

    /// Relink and restart the previous version after a failed upgrade.
    async fn fall_back(
        &self,
        name: &ServiceName,
        old: &str,
        reason: String,
        mut result: UpgradeResult,
    ) -> ControlResult<UpgradeResult> {
        warn!(service = %name, %reason, to = %old, "upgrade failed; rolling back");

        if let Err(e) = self.supervisor.stop(name).await {
            debug!(service = %name, error = %e, "stop before fallback");
        }

        let mut failures = Vec::new();
        if let Err(e) = self.layout.activate(name, old).await {
            failures.push(CompensationFailure {
                step: "relink".to_owned(),
                error: e.to_string(),
                manual_cleanup: format!(
                    "point {} back at {}",
                    self.layout.link_path(name).display(),
                    self.layout.version_path(name, old).display()
                ),
            });
        }
        if let Err(e) = self.supervisor.start(name, &self.cancel).await {
            failures.push(CompensationFailure {
                step: "restart".to_owned(),
                error: e.to_string(),
                manual_cleanup: format!("start {} by hand", Isolation::for_service(name).unit),
            });
        }

        if !failures.is_empty() {
            return Err(ControlError::RollbackIncomplete {
                cause: Box::new(ControlError::Health(reason)),
                failures,
            });
        }

        info!(service = %name, version = %old, "previous version restored");
        result.outcome = UpgradeOutcome::RolledBack {
            reason: format!("{reason}; rolled back to {old}"),
        };
        Ok(result)
    }

    fn interrupted(&self, name: &ServiceName, new: &str) -> ControlError {
        let applied = vec![
            format!("artifact {new}"),
            "stopped previous version".to_owned(),
            format!("linked {new}"),
        ];
        warn!(service = %name, ?applied, "upgrade cancelled");
        ControlError::Cancelled { applied }
    }

    // ------------------------------------------------------------------
    // Rollback
    // ------------------------------------------------------------------

    /// Swap a service back to its previous version.
    ///
    /// No health check runs; the previous version already proved itself.
    /// Rolling back twice returns to where it started.
    pub async fn rollback(&self, name: &str) -> ControlResult<RollbackResult> {
        let mut record = self.require(name).await?;
        let name = record.name.clone();
        let current = record.version.clone();
        let Some(previous) = record.previous_version.clone() else {
            return Err(ControlError::NoPreviousVersion(name.to_string()));
        };

        if !self.layout.has_version(&name, &previous).await {
            return Err(ControlError::artifact(format!(
                "previous version {previous} of {name} is no longer installed at {}",
                self.layout.version_path(&name, &previous).display()
            )));
        }

        info!(service = %name, from = %current, to = %previous, "starting rollback");

        self.ensure_live()?;
        self.supervisor.stop(&name).await?;

        if let Err(e) = self.layout.activate(&name, &previous).await {
            if let Err(restart) = self.supervisor.start(&name, &self.cancel).await {
                warn!(service = %name, error = %restart, "restarting current version failed");
            }
            return Err(e);
        }

        self.supervisor.start(&name, &self.cancel).await?;

        record.previous_version = Some(current.clone());
        record.version = previous.clone();
        record.updated_at = Utc::now();
        self.store.update(&record).await?;

        self.append_history(
            HistoryEntry::now(&name, HistoryAction::Rollback, Some(previous.as_str()))
                .with_detail("from", &current),
        )
        .await;

        info!(service = %name, version = %previous, "rollback complete");
        Ok(RollbackResult {
            name: name.to_string(),
            from: current,
            to: previous,
        })
    }

    // ------------------------------------------------------------------
    // Remove
    // ------------------------------------------------------------------

    /// Tear a service down.
    ///
    /// Everything except dropping the database is best-effort and reported
    /// as warnings. A failed database drop aborts the removal and keeps the
    /// record so it can be retried. Cancellation is checked before every
    /// step; a cancelled removal also keeps the record and reports the steps
    /// that already ran.
    pub async fn remove(&self, request: RemoveRequest) -> ControlResult<RemoveResult> {
        let record = self.require(&request.name).await?;
        let name = record.name.clone();

        info!(service = %name, drop_database = request.drop_database, "starting remove");

        let mut teardown = Teardown::new(&name, &self.cancel);
        teardown.step("stop", self.supervisor.stop(&name)).await?;
        teardown.step("disable", self.supervisor.disable(&name)).await?;
        teardown.step("remove unit", self.supervisor.remove_unit(&name)).await?;
        teardown.step("reload", self.supervisor.reload()).await?;
        teardown
            .step("remove account", self.supervisor.remove_account(&name))
            .await?;
        if record.route.is_some() {
            teardown
                .step("remove route", self.proxy.deactivate_route(&name))
                .await?;
        }
        teardown.step("remove secrets", self.secrets.remove(&name)).await?;
        teardown
            .step("remove artifacts", self.layout.remove_all(&name))
            .await?;

        let mut database_dropped = false;
        if request.drop_database && record.database.is_some() {
            teardown.ensure_live()?;
            self.database
                .drop_database(&name)
                .await
                .inspect_err(|e| {
                    error!(service = %name, error = %e, "dropping database failed; record kept");
                })?;
            database_dropped = true;
        }

        self.store.delete(&name).await?;
        self.append_history(HistoryEntry::now(
            &name,
            HistoryAction::Remove,
            Some(record.version.as_str()),
        ))
        .await;

        info!(service = %name, "remove complete");
        Ok(RemoveResult {
            record,
            database_dropped,
            warnings: teardown.warnings,
        })
    }

    // ------------------------------------------------------------------
    // Read accessors
    // ------------------------------------------------------------------

    /// Get a service record.
    pub async fn get(&self, name: &str) -> ControlResult<Option<ServiceRecord>> {
        let name = ServiceName::new(name)?;
        self.store.get(&name).await
    }

    /// List all services ordered by name.
    pub async fn list(&self) -> ControlResult<Vec<ServiceRecord>> {
        self.store.list().await
    }

    /// History of a service, newest first.
    pub async fn history(&self, name: &str) -> ControlResult<Vec<HistoryEntry>> {
        self.store.history(name).await
    }

    /// A service record plus whether its unit is active.
    pub async fn status(&self, name: &str) -> ControlResult<ServiceStatus> {
        let record = self.require(name).await?;
        let active = self.supervisor.is_active(&record.name).await?;
        Ok(ServiceStatus { record, active })
    }

    async fn require(&self, name: &str) -> ControlResult<ServiceRecord> {
        let name = ServiceName::new(name)?;
        self.store
            .get(&name)
            .await?
            .ok_or_else(|| ControlError::ServiceNotFound(name.to_string()))
    }

    fn ensure_live(&self) -> ControlResult<()> {
        if self.cancel.is_cancelled() {
            Err(ControlError::Cancelled {
                applied: Vec::new(),
            })
        } else {
            Ok(())
        }
    }

    async fn append_history(&self, entry: HistoryEntry) {
        if let Err(e) = self.store.append_history(&entry).await {
            warn!(
                service = %entry.service,
                action = %entry.action,
                error = %e,
                "failed to append history"
            );
        }
    }
}

/// Progress through the best-effort steps of a removal.
struct Teardown<'a> {
    name: &'a ServiceName,
    cancel: &'a CancellationToken,
    applied: Vec<String>,
    warnings: Vec<String>,
}

impl<'a> Teardown<'a> {
    fn new(name: &'a ServiceName, cancel: &'a CancellationToken) -> Self {
        Self {
            name,
            cancel,
            applied: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Run one step unless cancelled. Failures become warnings.
    async fn step(
        &mut self,
        what: &str,
        action: impl Future<Output = ControlResult<()>>,
    ) -> ControlResult<()> {
        self.ensure_live()?;
        match action.await {
            Ok(()) => self.applied.push(what.to_owned()),
            Err(e) if e.is_cancelled() => return Err(self.cancelled()),
            Err(e) => {
                warn!(service = %self.name, step = what, error = %e, "teardown step failed");
                self.warnings.push(format!("{what}: {e}"));
            }
        }
        Ok(())
    }

    fn ensure_live(&self) -> ControlResult<()> {
        if self.cancel.is_cancelled() {
            Err(self.cancelled())
        } else {
            Ok(())
        }
    }

    fn cancelled(&self) -> ControlError {
        warn!(service = %self.name, applied = ?self.applied, "remove cancelled; record kept");
        ControlError::Cancelled {
            applied: self.applied.clone(),
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("ports", &self.ports)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}
