//! Configuration for deckhand.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};
use crate::poll::RetryPolicy;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/deckhand/deckhand.toml";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "DECKHAND_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DeckhandConfig {
    /// Release source configuration.
    #[serde(default)]
    pub github: GithubConfig,

    /// Port allocation range.
    #[serde(default)]
    pub ports: PortsConfig,

    /// Database server used for per-service databases.
    #[serde(default)]
    pub mariadb: MariaDbConfig,

    /// Reverse-proxy configuration directories.
    #[serde(default)]
    pub nginx: NginxConfig,

    /// Release asset matching.
    #[serde(default)]
    pub releases: ReleasesConfig,

    /// Filesystem layout.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Bounded wait budgets.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl DeckhandConfig {
    /// Path of the configuration file, honouring `DECKHAND_CONFIG`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
    }

    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. The TOML file at [`DeckhandConfig::default_path`] (if present)
    /// 3. Environment variables with `DECKHAND_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_file(Self::default_path())
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DECKHAND_").ignore(&["CONFIG"]).split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }

    /// Check the settings a deploy relies on.
    pub fn validate(&self) -> ControlResult<()> {
        if self.github.token.is_empty() {
            return Err(ControlError::Config("github.token is required".to_owned()));
        }
        if self.github.owner.is_empty() {
            return Err(ControlError::Config("github.owner is required".to_owned()));
        }
        if self.ports.range_start >= self.ports.range_end {
            return Err(ControlError::Config(format!(
                "ports.range_start ({}) must be below ports.range_end ({})",
                self.ports.range_start, self.ports.range_end
            )));
        }
        if self.mariadb.admin_password_file.as_os_str().is_empty() {
            return Err(ControlError::Config(
                "mariadb.admin_password_file is required".to_owned(),
            ));
        }
        if !self.releases.asset_pattern.contains("{name}")
            && !self.releases.asset_pattern.contains("{version}")
        {
            return Err(ControlError::Config(format!(
                "releases.asset_pattern {:?} must reference {{name}} or {{version}}",
                self.releases.asset_pattern
            )));
        }
        Ok(())
    }

    /// Starter configuration written by `deckhand init`.
    #[must_use]
    pub fn template() -> &'static str {
        r#"# deckhand configuration

[github]
token = "ghp_YOUR_TOKEN_HERE"
owner = "your-github-username"

[ports]
range_start = 3000
range_end   = 4000

[mariadb]
host = "127.0.0.1"
port = 3306
admin_user = "root"
admin_password_file = "/root/.mariadb_password"

[nginx]
sites_dir     = "/etc/nginx/sites-available"
enabled_dir   = "/etc/nginx/sites-enabled"
# path-prefix routes land here; include it from a server block
locations_dir = "/etc/nginx/deckhand.d"

[releases]
asset_pattern = "{name}-linux-amd64"
"#
    }
}

/// Release source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    /// API token.
    #[serde(default)]
    pub token: String,

    /// Owner used when a repository reference has none.
    #[serde(default)]
    pub owner: String,

    /// API base URL.
    #[serde(default = "default_github_api_url")]
    pub api_url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_github_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_owned()
}

const fn default_github_timeout_secs() -> u64 {
    60
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            owner: String::new(),
            api_url: default_github_api_url(),
            timeout_secs: default_github_timeout_secs(),
        }
    }
}

/// Port allocation range, `[range_start, range_end)`.
#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    /// First port handed out.
    #[serde(default = "default_range_start")]
    pub range_start: u16,

    /// One past the last port handed out.
    #[serde(default = "default_range_end")]
    pub range_end: u16,
}

const fn default_range_start() -> u16 {
    3000
}

const fn default_range_end() -> u16 {
    4000
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: default_range_start(),
            range_end: default_range_end(),
        }
    }
}

/// Database server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MariaDbConfig {
    /// Server host, also handed to services as `DB_HOST`.
    #[serde(default = "default_mariadb_host")]
    pub host: String,

    /// Server port.
    #[serde(default = "default_mariadb_port")]
    pub port: u16,

    /// Administrative user.
    #[serde(default = "default_mariadb_admin_user")]
    pub admin_user: String,

    /// File holding the administrative password.
    #[serde(default)]
    pub admin_password_file: PathBuf,
}

fn default_mariadb_host() -> String {
    "127.0.0.1".to_owned()
}

const fn default_mariadb_port() -> u16 {
    3306
}

fn default_mariadb_admin_user() -> String {
    "root".to_owned()
}

impl Default for MariaDbConfig {
    fn default() -> Self {
        Self {
            host: default_mariadb_host(),
            port: default_mariadb_port(),
            admin_user: default_mariadb_admin_user(),
            admin_password_file: PathBuf::new(),
        }
    }
}

/// Reverse-proxy configuration directories.
#[derive(Debug, Clone, Deserialize)]
pub struct NginxConfig {
    /// Where subdomain server blocks are written.
    #[serde(default = "default_sites_dir")]
    pub sites_dir: PathBuf,

    /// Where enabled server blocks are symlinked.
    #[serde(default = "default_enabled_dir")]
    pub enabled_dir: PathBuf,

    /// Where path-prefix location fragments are written.
    #[serde(default = "default_locations_dir")]
    pub locations_dir: PathBuf,
}

fn default_sites_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-available")
}

fn default_enabled_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-enabled")
}

fn default_locations_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/deckhand.d")
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            sites_dir: default_sites_dir(),
            enabled_dir: default_enabled_dir(),
            locations_dir: default_locations_dir(),
        }
    }
}

/// Release asset matching.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleasesConfig {
    /// Asset name pattern with `{name}` and `{version}` placeholders.
    #[serde(default = "default_asset_pattern")]
    pub asset_pattern: String,
}

fn default_asset_pattern() -> String {
    "{name}-linux-amd64".to_owned()
}

impl Default for ReleasesConfig {
    fn default() -> Self {
        Self {
            asset_pattern: default_asset_pattern(),
        }
    }
}

/// Filesystem layout.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Root of versioned service binaries.
    #[serde(default = "default_bin_dir")]
    pub bin_dir: PathBuf,

    /// Root of per-service secrets directories.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Directory for process unit files.
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,

    /// State database file.
    #[serde(default = "default_state_db")]
    pub state_db: PathBuf,
}

fn default_bin_dir() -> PathBuf {
    PathBuf::from("/opt/deckhand/bin")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/deckhand")
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

fn default_state_db() -> PathBuf {
    PathBuf::from("/var/lib/deckhand/state.db")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            bin_dir: default_bin_dir(),
            config_dir: default_config_dir(),
            unit_dir: default_unit_dir(),
            state_db: default_state_db(),
        }
    }
}

/// Bounded wait budgets.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// How long a started unit has to report active.
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,

    /// Interval between active-state polls, in milliseconds.
    #[serde(default = "default_start_poll_ms")]
    pub start_poll_ms: u64,

    /// How long an upgraded service has to accept connections.
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,

    /// Interval between connection attempts, in milliseconds.
    #[serde(default = "default_health_poll_ms")]
    pub health_poll_ms: u64,
}

const fn default_start_timeout_secs() -> u64 {
    10
}

const fn default_start_poll_ms() -> u64 {
    500
}

const fn default_health_timeout_secs() -> u64 {
    10
}

const fn default_health_poll_ms() -> u64 {
    1000
}

impl TimeoutConfig {
    /// Policy for waiting on a unit to become active.
    #[must_use]
    pub const fn start_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.start_poll_ms),
            Duration::from_secs(self.start_timeout_secs),
        )
    }

    /// Policy for waiting on a port to accept connections.
    #[must_use]
    pub const fn health_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.health_poll_ms),
            Duration::from_secs(self.health_timeout_secs),
        )
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            start_timeout_secs: default_start_timeout_secs(),
            start_poll_ms: default_start_poll_ms(),
            health_timeout_secs: default_health_timeout_secs(),
            health_poll_ms: default_health_poll_ms(),
        }
    }
}
