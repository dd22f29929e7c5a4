//! systemd-backed supervisor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactLayout;
use crate::credentials::SecretsWriter;
use crate::error::{ControlError, ControlResult};
use crate::poll::{poll_until, PollError, RetryPolicy};
use crate::runner::{CommandOutput, CommandRunner};
use crate::types::{Isolation, ServiceName};

use super::ProcessSupervisor;

const JOURNAL_LINES: &str = "20";

/// Values substituted into a unit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitParams {
    /// Service name.
    pub name: String,
    /// Account the process runs as.
    pub account: String,
    /// Executable, normally the active-version symlink.
    pub exec_path: PathBuf,
    /// Secrets file loaded into the environment.
    pub environment_file: PathBuf,
    /// Working directory, the only writable path.
    pub working_dir: PathBuf,
}

impl UnitParams {
    /// Derive unit parameters from the on-disk layout.
    #[must_use]
    pub fn new(name: &ServiceName, layout: &ArtifactLayout, secrets: &SecretsWriter) -> Self {
        Self {
            name: name.to_string(),
            account: Isolation::for_service(name).account,
            exec_path: layout.link_path(name),
            environment_file: secrets.path(name),
            working_dir: layout.service_dir(name),
        }
    }
}

/// Render a hardened unit file.
#[must_use]
pub fn render_unit(params: &UnitParams) -> String {
    format!(
        "[Unit]\n\
         Description=deckhand: {name}\n\
         After=network.target mariadb.service\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={exec}\n\
         EnvironmentFile={env}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         User={account}\n\
         Group={account}\n\
         WorkingDirectory={work}\n\
         \n\
         NoNewPrivileges=true\n\
         ProtectSystem=strict\n\
         ProtectHome=true\n\
         PrivateTmp=true\n\
         ReadWritePaths={work}\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        name = params.name,
        exec = params.exec_path.display(),
        env = params.environment_file.display(),
        account = params.account,
        work = params.working_dir.display(),
    )
}

/// Supervises services as systemd units.
pub struct SystemdSupervisor {
    runner: Arc<dyn CommandRunner>,
    unit_dir: PathBuf,
    layout: ArtifactLayout,
    secrets: SecretsWriter,
    start_policy: RetryPolicy,
}

impl std::fmt::Debug for SystemdSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemdSupervisor")
            .field("unit_dir", &self.unit_dir)
            .field("start_policy", &self.start_policy)
            .finish_non_exhaustive()
    }
}

impl SystemdSupervisor {
    /// Create a supervisor writing units into `unit_dir`.
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        unit_dir: impl Into<PathBuf>,
        layout: ArtifactLayout,
        secrets: SecretsWriter,
        start_policy: RetryPolicy,
    ) -> Self {
        Self {
            runner,
            unit_dir: unit_dir.into(),
            layout,
            secrets,
            start_policy,
        }
    }

    /// Path of a service's unit file.
    #[must_use]
    pub fn unit_path(&self, name: &ServiceName) -> PathBuf {
        self.unit_dir.join(Isolation::for_service(name).unit)
    }

    async fn systemctl(&self, action: &str, unit: &str) -> ControlResult<()> {
        let output = self.runner.run("systemctl", &[action, unit]).await?;
        check(&output, &format!("{action} {unit}"))
    }

    async fn journal_tail(&self, unit: &str) -> String {
        match self
            .runner
            .run("journalctl", &["-u", unit, "-n", JOURNAL_LINES, "--no-pager"])
            .await
        {
            Ok(output) if output.success => output.stdout.trim_end().to_owned(),
            Ok(output) => format!("(journal unavailable: {})", output.stderr_trimmed()),
            Err(e) => format!("(journal unavailable: {e})"),
        }
    }
}

fn check(output: &CommandOutput, what: &str) -> ControlResult<()> {
    if output.success {
        Ok(())
    } else {
        Err(ControlError::supervisor(format!(
            "{what}: {}",
            output.stderr_trimmed()
        )))
    }
}

async fn remove_file_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl ProcessSupervisor for SystemdSupervisor {
    async fn create_account(&self, name: &ServiceName) -> ControlResult<()> {
        let account = Isolation::for_service(name).account;
        let output = self
            .runner
            .run(
                "useradd",
                &[
                    "--system",
                    "--no-create-home",
                    "--shell",
                    "/usr/sbin/nologin",
                    account.as_str(),
                ],
            )
            .await?;

        if !output.success && output.stderr.contains("already exists") {
            debug!(account = %account, "account already exists");
            return Ok(());
        }
        check(&output, &format!("creating account {account}"))
    }

    async fn remove_account(&self, name: &ServiceName) -> ControlResult<()> {
        let account = Isolation::for_service(name).account;
        let output = self.runner.run("userdel", &[account.as_str()]).await?;

        if !output.success && output.stderr.contains("does not exist") {
            return Ok(());
        }
        check(&output, &format!("removing account {account}"))
    }

    async fn write_unit(&self, name: &ServiceName) -> ControlResult<()> {
        let path = self.unit_path(name);
        let unit = render_unit(&UnitParams::new(name, &self.layout, &self.secrets));

        tokio::fs::create_dir_all(&self.unit_dir)
            .await
            .map_err(|e| {
                ControlError::supervisor(format!("creating {}: {e}", self.unit_dir.display()))
            })?;
        tokio::fs::write(&path, unit).await.map_err(|e| {
            ControlError::supervisor(format!("writing unit file {}: {e}", path.display()))
        })?;

        debug!(service = %name, path = %path.display(), "wrote unit file");
        Ok(())
    }

    async fn remove_unit(&self, name: &ServiceName) -> ControlResult<()> {
        let path = self.unit_path(name);
        remove_file_if_present(&path).await.map_err(|e| {
            ControlError::supervisor(format!("removing unit file {}: {e}", path.display()))
        })
    }

    async fn reload(&self) -> ControlResult<()> {
        let output = self.runner.run("systemctl", &["daemon-reload"]).await?;
        check(&output, "daemon-reload")
    }

    async fn enable(&self, name: &ServiceName) -> ControlResult<()> {
        self.systemctl("enable", &Isolation::for_service(name).unit)
            .await
    }

    async fn disable(&self, name: &ServiceName) -> ControlResult<()> {
        self.systemctl("disable", &Isolation::for_service(name).unit)
            .await
    }

    async fn start(&self, name: &ServiceName, cancel: &CancellationToken) -> ControlResult<()> {
        let unit = Isolation::for_service(name).unit;

        let output = self.runner.run("systemctl", &["start", unit.as_str()]).await?;
        if !output.success {
            let journal = self.journal_tail(&unit).await;
            return Err(ControlError::supervisor(format!(
                "starting {unit}: {}; journal:\n{journal}",
                output.stderr_trimmed()
            )));
        }

        let result = poll_until(self.start_policy, cancel, || async {
            self.is_active(name).await.unwrap_or(false)
        })
        .await;

        match result {
            Ok(attempts) => {
                info!(service = %name, attempts, "unit is active");
                Ok(())
            }
            Err(PollError::Cancelled) => Err(ControlError::Cancelled {
                applied: Vec::new(),
            }),
            Err(e @ PollError::TimedOut { .. }) => {
                warn!(service = %name, error = %e, "unit did not become active");
                let journal = self.journal_tail(&unit).await;
                Err(ControlError::supervisor(format!(
                    "{unit} failed to become active ({e}); journal:\n{journal}"
                )))
            }
        }
    }

    async fn stop(&self, name: &ServiceName) -> ControlResult<()> {
        self.systemctl("stop", &Isolation::for_service(name).unit)
            .await
    }

    async fn is_active(&self, name: &ServiceName) -> ControlResult<bool> {
        let unit = Isolation::for_service(name).unit;
        let output = self.runner.run("systemctl", &["is-active", unit.as_str()]).await?;
        Ok(output.stdout.trim() == "active")
    }
}
