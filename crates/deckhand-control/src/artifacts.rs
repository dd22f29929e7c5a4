//! Versioned artifact layout on disk.
//!
//! ```text
//! <bin_dir>/<name>/<name>-<version>   installed builds, mode 0755
//! <bin_dir>/<name>/<name>             symlink to the active build
//! ```
//!
//! The process unit always executes the symlink, so switching versions is a
//! single atomic rename of a freshly created link over the old one.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::types::ServiceName;

/// Filesystem layout for service artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    bin_dir: PathBuf,
}

impl ArtifactLayout {
    /// Create a layout rooted at `bin_dir`.
    #[must_use]
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
        }
    }

    /// Directory holding a service's builds.
    #[must_use]
    pub fn service_dir(&self, name: &ServiceName) -> PathBuf {
        self.bin_dir.join(name.as_str())
    }

    /// Path of the active-version symlink.
    #[must_use]
    pub fn link_path(&self, name: &ServiceName) -> PathBuf {
        self.service_dir(name).join(name.as_str())
    }

    /// Path of one installed build.
    #[must_use]
    pub fn version_path(&self, name: &ServiceName, version: &str) -> PathBuf {
        self.service_dir(name).join(file_name(name, version))
    }

    /// Write a build to its versioned path and mark it executable.
    ///
    /// The build is written under a temporary name first, so a partial
    /// download never appears as an installed version.
    pub async fn install(
        &self,
        name: &ServiceName,
        version: &str,
        contents: &[u8],
    ) -> ControlResult<PathBuf> {
        let dir = self.service_dir(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("creating", &dir, &e))?;

        let dest = self.version_path(name, version);
        let partial = dir.join(format!(".{}.partial", file_name(name, version)));

        tokio::fs::write(&partial, contents)
            .await
            .map_err(|e| io_error("writing", &partial, &e))?;
        make_executable(&partial)
            .await
            .map_err(|e| io_error("chmod", &partial, &e))?;
        tokio::fs::rename(&partial, &dest)
            .await
            .map_err(|e| io_error("renaming into", &dest, &e))?;

        debug!(service = %name, version, path = %dest.display(), "installed artifact");
        Ok(dest)
    }

    /// Point the symlink at `version`.
    pub async fn activate(&self, name: &ServiceName, version: &str) -> ControlResult<()> {
        if !self.has_version(name, version).await {
            return Err(ControlError::artifact(format!(
                "cannot activate {name} {version}: {} is not installed",
                self.version_path(name, version).display()
            )));
        }

        let link = self.link_path(name);
        let staged = self
            .service_dir(name)
            .join(format!(".{name}.link"));

        remove_if_present(&staged)
            .await
            .map_err(|e| io_error("clearing", &staged, &e))?;
        symlink(Path::new(&file_name(name, version)), &staged)
            .await
            .map_err(|e| io_error("linking", &staged, &e))?;
        tokio::fs::rename(&staged, &link)
            .await
            .map_err(|e| io_error("replacing", &link, &e))?;

        debug!(service = %name, version, "activated version");
        Ok(())
    }

    /// Version the symlink currently points at.
    pub async fn current(&self, name: &ServiceName) -> ControlResult<Option<String>> {
        let link = self.link_path(name);
        let target = match tokio::fs::read_link(&link).await {
            Ok(target) => target,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("reading", &link, &e)),
        };

        let prefix = format!("{name}-");
        Ok(target
            .file_name()
            .and_then(|f| f.to_str())
            .and_then(|f| f.strip_prefix(&prefix))
            .map(ToOwned::to_owned))
    }

    /// Whether a build for `version` is installed.
    pub async fn has_version(&self, name: &ServiceName, version: &str) -> bool {
        tokio::fs::metadata(self.version_path(name, version))
            .await
            .is_ok_and(|m| m.is_file())
    }

    /// Installed versions, sorted by file name.
    pub async fn versions(&self, name: &ServiceName) -> ControlResult<Vec<String>> {
        let dir = self.service_dir(name);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("listing", &dir, &e)),
        };

        let prefix = format!("{name}-");
        let mut versions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("listing", &dir, &e))?
        {
            let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
            if let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|f| f.strip_prefix(&prefix))
            {
                if is_file {
                    versions.push(version.to_owned());
                }
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Remove one build, and the symlink if it pointed there.
    pub async fn remove_version(&self, name: &ServiceName, version: &str) -> ControlResult<()> {
        if self.current(name).await?.as_deref() == Some(version) {
            let link = self.link_path(name);
            remove_if_present(&link)
                .await
                .map_err(|e| io_error("removing", &link, &e))?;
        }

        let path = self.version_path(name, version);
        remove_if_present(&path)
            .await
            .map_err(|e| io_error("removing", &path, &e))
    }

    /// Remove every build and the symlink.
    pub async fn remove_all(&self, name: &ServiceName) -> ControlResult<()> {
        let dir = self.service_dir(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("removing", &dir, &e)),
        }
    }

    /// Remove every build not listed in `keep`. Returns the removed versions.
    pub async fn prune(&self, name: &ServiceName, keep: &[&str]) -> ControlResult<Vec<String>> {
        let mut removed = Vec::new();
        for version in self.versions(name).await? {
            if keep.contains(&version.as_str()) {
                continue;
            }
            let path = self.version_path(name, &version);
            remove_if_present(&path)
                .await
                .map_err(|e| io_error("pruning", &path, &e))?;
            removed.push(version);
        }
        if !removed.is_empty() {
            debug!(service = %name, ?removed, "pruned old versions");
        }
        Ok(removed)
    }
}

fn file_name(name: &ServiceName, version: &str) -> String {
    format!("{name}-{version}")
}

fn io_error(action: &str, path: &Path, err: &std::io::Error) -> ControlError {
    ControlError::artifact(format!("{action} {}: {err}", path.display()))
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    let dir = link.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::copy(dir.join(target), link).await.map(|_| ())
}
