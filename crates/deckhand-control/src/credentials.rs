//! Secrets files and generated credentials.
//!
//! Each service gets one owner-only file at `<config_dir>/<name>/env`. The
//! process unit loads it through `EnvironmentFile=`, or the service parses it
//! itself when written in TOML.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::database::DatabaseCredentials;
use crate::error::{ControlError, ControlResult};
use crate::types::{SecretsFormat, ServiceName};

/// Length of generated passwords.
pub const PASSWORD_LEN: usize = 32;

const SECRETS_FILE: &str = "env";
const REDACTED: &str = "****";

/// Generate a random alphanumeric password.
#[must_use]
pub fn generate_password() -> SecretString {
    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect();
    SecretString::from(password)
}

/// Check operator-supplied environment entries.
///
/// Keys must be valid shell identifiers and values must fit on one line,
/// otherwise the env file could smuggle in extra assignments.
pub fn validate_extra_env(extra: &BTreeMap<String, String>) -> ControlResult<()> {
    for (key, value) in extra {
        let mut chars = key.chars();
        let valid_key = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_key {
            return Err(ControlError::invalid(format!(
                "environment key {key:?} must match [A-Za-z_][A-Za-z0-9_]*"
            )));
        }
        if value.contains('\n') || value.contains('\r') {
            return Err(ControlError::invalid(format!(
                "environment value for {key} must not contain line breaks"
            )));
        }
    }
    Ok(())
}

/// Whether a key names something that should never be displayed.
#[must_use]
pub fn is_credential_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    ["PASSWORD", "SECRET", "TOKEN", "KEY"]
        .iter()
        .any(|marker| upper.contains(marker))
}

/// Mask credential values in rendered secrets file contents.
///
/// Understands both `KEY=VALUE` and `KEY = "VALUE"` lines.
#[must_use]
pub fn redact(contents: &str) -> String {
    contents
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once('=') {
            Some((key, _)) if is_credential_key(key.trim()) => {
                if key.ends_with(' ') {
                    format!("{key}= \"{REDACTED}\"")
                } else {
                    format!("{key}={REDACTED}")
                }
            }
            _ => line.to_owned(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Entries destined for a service's secrets file.
#[derive(Debug, Default)]
pub struct SecretEntries {
    entries: BTreeMap<String, SecretString>,
}

impl SecretEntries {
    /// Entries for a service listening on `port`.
    #[must_use]
    pub fn for_port(port: u16) -> Self {
        let mut entries = Self::default();
        entries.insert("PORT", port.to_string());
        entries
    }

    /// Add the connection settings of a provisioned database.
    #[must_use]
    pub fn with_database(mut self, host: &str, port: u16, creds: &DatabaseCredentials) -> Self {
        self.insert("DB_HOST", host);
        self.insert("DB_PORT", port.to_string());
        self.insert("DB_NAME", creds.name.as_str());
        self.insert("DB_USER", creds.user.as_str());
        self.entries.insert(
            "DB_PASSWORD".to_owned(),
            SecretString::from(creds.password.expose_secret().to_owned()),
        );
        self
    }

    /// Add operator entries, overriding generated ones.
    #[must_use]
    pub fn with_extra(mut self, extra: &BTreeMap<String, String>) -> Self {
        for (key, value) in extra {
            self.insert(key.as_str(), value.as_str());
        }
        self
    }

    fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.entries
            .insert(key.to_owned(), SecretString::from(value.into()));
    }

    /// Keys in file order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Render the file contents.
    pub fn render(&self, format: SecretsFormat) -> ControlResult<String> {
        match format {
            SecretsFormat::Env => {
                let mut out = String::new();
                for (key, value) in &self.entries {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(value.expose_secret());
                    out.push('\n');
                }
                Ok(out)
            }
            SecretsFormat::Toml => {
                let table: toml::Table = self
                    .entries
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.clone(),
                            toml::Value::String(v.expose_secret().to_owned()),
                        )
                    })
                    .collect();
                toml::to_string(&table).map_err(|e| {
                    ControlError::Serialisation(format!("failed to render secrets as TOML: {e}"))
                })
            }
        }
    }
}

/// Writes and removes per-service secrets files.
#[derive(Debug, Clone)]
pub struct SecretsWriter {
    config_dir: PathBuf,
}

impl SecretsWriter {
    /// Create a writer rooted at `config_dir`.
    #[must_use]
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Directory holding a service's secrets.
    #[must_use]
    pub fn dir(&self, name: &ServiceName) -> PathBuf {
        self.config_dir.join(name.as_str())
    }

    /// Path of a service's secrets file.
    #[must_use]
    pub fn path(&self, name: &ServiceName) -> PathBuf {
        self.dir(name).join(SECRETS_FILE)
    }

    /// Write the secrets file with mode 0600, replacing any existing one.
    pub async fn write(
        &self,
        name: &ServiceName,
        entries: &SecretEntries,
        format: SecretsFormat,
    ) -> ControlResult<PathBuf> {
        let dir = self.dir(name);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            ControlError::secrets(format!("creating {}: {e}", dir.display()))
        })?;

        let path = self.path(name);
        let contents = entries.render(format)?;
        write_private(&path, contents.as_bytes())
            .await
            .map_err(|e| ControlError::secrets(format!("writing {}: {e}", path.display())))?;

        debug!(service = %name, path = %path.display(), ?format, "wrote secrets file");
        Ok(path)
    }

    /// Read a service's secrets file.
    pub async fn read(&self, name: &ServiceName) -> ControlResult<String> {
        let path = self.path(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ControlError::secrets(format!("reading {}: {e}", path.display())))
    }

    /// Remove a service's secrets directory. Missing directories are fine.
    pub async fn remove(&self, name: &ServiceName) -> ControlResult<()> {
        let dir = self.dir(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ControlError::secrets(format!(
                "removing {}: {e}",
                dir.display()
            ))),
        }
    }
}

#[cfg(unix)]
async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await?;
    // mode() only applies on creation
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    file.write_all(contents).await?;
    file.flush().await
}

#[cfg(not(unix))]
async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(contents).await?;
    file.flush().await
}
