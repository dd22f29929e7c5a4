//! Core types for deckhand-control.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

// `dh-` plus the name must fit the 32-character account name limit.
const MAX_NAME_LEN: usize = 29;

/// Validated service name.
///
/// The name is the seed for every derived identifier (account, unit, database,
/// directories), so it is restricted to `[a-zA-Z0-9][a-zA-Z0-9_-]*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    /// Validate and wrap a service name.
    pub fn new(name: impl Into<String>) -> ControlResult<Self> {
        let name = name.into();
        let reject = |reason: &str| ControlError::InvalidName {
            name: name.clone(),
            reason: reason.to_owned(),
        };

        let mut chars = name.chars();
        match chars.next() {
            None => return Err(reject("must not be empty")),
            Some(c) if !c.is_ascii_alphanumeric() => {
                return Err(reject("must start with a letter or digit"))
            }
            Some(_) => {}
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(reject("must match [a-zA-Z0-9][a-zA-Z0-9_-]*"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(reject("must be at most 29 characters"));
        }
        Ok(Self(name))
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServiceName {
    type Error = ControlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceName> for String {
    fn from(name: ServiceName) -> Self {
        name.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Reference to a source repository, `owner/repo` or bare `repo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoRef(String);

impl RepoRef {
    /// Create a repository reference.
    pub fn new(reference: impl Into<String>) -> ControlResult<Self> {
        let reference = reference.into();
        let trimmed = reference.trim_matches('/');
        if trimmed.is_empty() || trimmed.split('/').any(str::is_empty) {
            return Err(ControlError::invalid(format!(
                "repository reference {reference:?} must look like owner/repo"
            )));
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Explicit owner, if the reference carries one.
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.0.split_once('/').map(|(owner, _)| owner)
    }

    /// Repository part of the reference.
    #[must_use]
    pub fn repo(&self) -> &str {
        self.0.split_once('/').map_or(&self.0, |(_, repo)| repo)
    }

    /// Last path segment, used as the default service name.
    #[must_use]
    pub fn last_segment(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Get the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shape of a reverse-proxy route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    /// Dedicated virtual host.
    Subdomain,
    /// Location fragment under a shared host.
    Path,
}

impl RouteKind {
    /// Get the route kind as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Subdomain => "subdomain",
            Self::Path => "path",
        }
    }

    /// Infer the kind from a route value: a leading `/` is a path prefix.
    #[must_use]
    pub fn infer(value: &str) -> Self {
        if value.starts_with('/') {
            Self::Path
        } else {
            Self::Subdomain
        }
    }
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RouteKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subdomain" => Ok(Self::Subdomain),
            "path" => Ok(Self::Path),
            _ => Err(format!("unknown route type {s:?}; must be 'subdomain' or 'path'")),
        }
    }
}

/// Reverse-proxy binding for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Route shape.
    pub kind: RouteKind,
    /// Host name or path prefix.
    pub value: String,
}

impl Route {
    /// Build a route, inferring the kind when not given.
    ///
    /// The value ends up inside proxy configuration, so anything that could
    /// break out of a directive is rejected.
    pub fn new(value: impl Into<String>, kind: Option<RouteKind>) -> ControlResult<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(ControlError::invalid("route must not be empty"));
        }
        if value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '"' | '\''))
        {
            return Err(ControlError::invalid(format!(
                "route {value:?} contains characters not allowed in proxy config"
            )));
        }
        let kind = kind.unwrap_or_else(|| RouteKind::infer(&value));
        if kind == RouteKind::Path && !value.starts_with('/') {
            return Err(ControlError::invalid(format!(
                "path route {value:?} must start with '/'"
            )));
        }
        Ok(Self { kind, value })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.value, self.kind)
    }
}

/// Database schema and principal provisioned for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseBinding {
    /// Schema name.
    pub name: String,
    /// Principal name.
    pub user: String,
}

/// Isolation boundary of a service, derived from its name.
///
/// Every per-service resource name comes from here so that creation and
/// teardown always agree on what to touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Isolation {
    /// Dedicated system account.
    pub account: String,
    /// Process unit name.
    pub unit: String,
    /// Proxy config file name.
    pub proxy_config: String,
    /// Database schema name.
    pub database: String,
    /// Database principal name.
    pub database_user: String,
}

impl Isolation {
    /// Derive the isolation boundary for a service.
    #[must_use]
    pub fn for_service(name: &ServiceName) -> Self {
        Self {
            account: format!("dh-{name}"),
            unit: format!("dh-{name}.service"),
            proxy_config: format!("dh-{name}.conf"),
            database: format!("dh_{name}"),
            database_user: format!("dh_{name}"),
        }
    }
}

/// Format of the secrets file handed to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretsFormat {
    /// `KEY=VALUE` lines, suitable for `EnvironmentFile=`.
    #[default]
    Env,
    /// TOML table of string values.
    Toml,
}

/// A deployed service as recorded in the state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Unique service name.
    pub name: ServiceName,
    /// Source repository.
    pub repo: RepoRef,
    /// Currently installed version.
    pub version: String,
    /// Version a rollback returns to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    /// Assigned port, unique among services.
    pub port: u16,
    /// Active reverse-proxy route.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    /// Provisioned database.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseBinding>,
    /// Extra environment entries written to the secrets file.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_env: BTreeMap<String, String>,
    /// When the service was first deployed.
    pub deployed_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl ServiceRecord {
    /// Isolation boundary for this service.
    #[must_use]
    pub fn isolation(&self) -> Isolation {
        Isolation::for_service(&self.name)
    }
}

/// Workflow that produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    /// Service deployed.
    Deploy,
    /// Service upgraded.
    Upgrade,
    /// Service rolled back.
    Rollback,
    /// Service removed.
    Remove,
}

impl HistoryAction {
    /// Get the action name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Upgrade => "upgrade",
            Self::Rollback => "rollback",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HistoryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploy" => Ok(Self::Deploy),
            "upgrade" => Ok(Self::Upgrade),
            "rollback" => Ok(Self::Rollback),
            "remove" => Ok(Self::Remove),
            _ => Err(format!("unknown history action: {s}")),
        }
    }
}

/// Append-only audit fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Store-assigned sequence number, `None` before insertion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Service the action applied to.
    pub service: String,
    /// Workflow that ran.
    pub action: HistoryAction,
    /// Version after the action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// When the action completed.
    pub timestamp: DateTime<Utc>,
    /// Free-form detail.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detail: BTreeMap<String, String>,
}

impl HistoryEntry {
    /// Create an entry stamped with the current time.
    #[must_use]
    pub fn now(service: &ServiceName, action: HistoryAction, version: Option<&str>) -> Self {
        Self {
            id: None,
            service: service.to_string(),
            action,
            version: version.map(ToOwned::to_owned),
            timestamp: Utc::now(),
            detail: BTreeMap::new(),
        }
    }

    /// Add a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }
}
