//! nginx route management.
//!
//! Subdomain routes get a full `server {}` block in `sites_dir`, enabled by a
//! symlink in `enabled_dir`. Path routes get a `location {}` fragment in
//! `locations_dir`, which an operator-owned server block includes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::NginxConfig;
use crate::error::{ControlError, ControlResult};
use crate::runner::CommandRunner;
use crate::types::{Isolation, Route, RouteKind, ServiceName};

use super::ProxyManager;

const PROXY_HEADERS: &str = "proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;";

/// Render the nginx configuration for a route.
#[must_use]
pub fn render_route(route: &Route, port: u16) -> String {
    match route.kind {
        RouteKind::Subdomain => format!(
            "server {{
    listen 80;
    server_name {host};

    location / {{
        proxy_pass http://127.0.0.1:{port};
        {PROXY_HEADERS}
    }}
}}
",
            host = route.value,
        ),
        RouteKind::Path => format!(
            "location {prefix} {{
        proxy_pass http://127.0.0.1:{port};
        {PROXY_HEADERS}
}}
",
            prefix = route.value,
        ),
    }
}

/// Manages routes as nginx configuration files.
pub struct NginxProxy {
    runner: Arc<dyn CommandRunner>,
    dirs: NginxConfig,
}

impl std::fmt::Debug for NginxProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NginxProxy")
            .field("dirs", &self.dirs)
            .finish_non_exhaustive()
    }
}

impl NginxProxy {
    /// Create a proxy manager over the configured directories.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, dirs: NginxConfig) -> Self {
        Self { runner, dirs }
    }

    /// Files a route of `kind` occupies, primary file first.
    #[must_use]
    pub fn config_paths(&self, name: &ServiceName, kind: RouteKind) -> Vec<PathBuf> {
        let file = Isolation::for_service(name).proxy_config;
        match kind {
            RouteKind::Subdomain => vec![
                self.dirs.sites_dir.join(&file),
                self.dirs.enabled_dir.join(&file),
            ],
            RouteKind::Path => vec![self.dirs.locations_dir.join(&file)],
        }
    }

    async fn discard(&self, name: &ServiceName, kind: RouteKind) -> ControlResult<()> {
        let mut first_error = None;
        // enabled link before its target
        for path in self.config_paths(name, kind).iter().rev() {
            if let Err(e) = remove_if_present(path).await {
                warn!(path = %path.display(), error = %e, "failed to remove proxy config");
                first_error.get_or_insert_with(|| {
                    ControlError::proxy(format!("removing {}: {e}", path.display()))
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Discard a half-activated route; the caller keeps its own error.
    async fn discard_after_failure(&self, name: &ServiceName, kind: RouteKind) {
        if let Err(e) = self.discard(name, kind).await {
            warn!(service = %name, error = %e, "could not discard route after failed activation");
        }
    }

    async fn write(&self, name: &ServiceName, route: &Route, port: u16) -> ControlResult<()> {
        let paths = self.config_paths(name, route.kind);
        let Some(primary) = paths.first() else {
            return Err(ControlError::internal("route kind has no config path"));
        };

        if let Some(dir) = primary.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                ControlError::proxy(format!("creating {}: {e}", dir.display()))
            })?;
        }
        tokio::fs::write(primary, render_route(route, port))
            .await
            .map_err(|e| ControlError::proxy(format!("writing {}: {e}", primary.display())))?;

        if let Some(link) = paths.get(1) {
            remove_if_present(link)
                .await
                .map_err(|e| ControlError::proxy(format!("clearing {}: {e}", link.display())))?;
            symlink(primary, link).await.map_err(|e| {
                ControlError::proxy(format!("linking {}: {e}", link.display()))
            })?;
        }
        Ok(())
    }

    async fn reload(&self) -> ControlResult<()> {
        let output = self.runner.run("systemctl", &["reload", "nginx"]).await?;
        if output.success {
            Ok(())
        } else {
            Err(ControlError::proxy(format!(
                "reloading nginx: {}",
                output.stderr_trimmed()
            )))
        }
    }
}

#[async_trait]
impl ProxyManager for NginxProxy {
    async fn activate_route(
        &self,
        name: &ServiceName,
        route: &Route,
        port: u16,
    ) -> ControlResult<()> {
        if let Err(e) = self.write(name, route, port).await {
            self.discard_after_failure(name, route.kind).await;
            return Err(e);
        }

        let test = self.runner.run("nginx", &["-t"]).await;
        let failure = match test {
            Ok(output) if output.success => None,
            Ok(output) => Some(ControlError::proxy(format!(
                "nginx config test failed (config discarded): {}",
                output.stderr_trimmed()
            ))),
            Err(e) => Some(e),
        };
        if let Some(err) = failure {
            self.discard_after_failure(name, route.kind).await;
            return Err(err);
        }

        if let Err(e) = self.reload().await {
            self.discard_after_failure(name, route.kind).await;
            return Err(e);
        }

        info!(service = %name, route = %route, port, "route activated");
        Ok(())
    }

    async fn deactivate_route(&self, name: &ServiceName) -> ControlResult<()> {
        let subdomain = self.discard(name, RouteKind::Subdomain).await;
        let path = self.discard(name, RouteKind::Path).await;
        let reload = self.reload().await;
        subdomain.and(path).and(reload)?;
        debug!(service = %name, "route deactivated");
        Ok(())
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::copy(target, link).await.map(|_| ())
}
