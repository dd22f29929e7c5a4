//! Error types for deckhand-control.

use std::fmt;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur while provisioning or managing a service.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Service name failed identifier validation.
    #[error("invalid service name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Request failed validation before any side effect.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A service with this name is already deployed.
    #[error("service {0:?} already exists; use a different name or remove it first")]
    ServiceExists(String),

    /// No service with this name is recorded.
    #[error("service {0:?} not found; run 'deckhand list' to see deployed services")]
    ServiceNotFound(String),

    /// Rollback requested but no previous version is recorded.
    #[error("service {0:?} has no previous version to roll back to")]
    NoPreviousVersion(String),

    /// Port is owned by another service.
    #[error("port {port} is already in use by service {owner:?}")]
    PortInUse {
        /// Requested port.
        port: u16,
        /// Service currently holding the port.
        owner: String,
    },

    /// Port lies outside the configured range.
    #[error("port {port} is outside configured range {start}-{end}")]
    PortOutOfRange {
        /// Requested port.
        port: u16,
        /// Inclusive lower bound.
        start: u16,
        /// Exclusive upper bound.
        end: u16,
    },

    /// Every port in the range is assigned.
    #[error(
        "port range {start}-{end} exhausted; remove unused services or widen the range in the config"
    )]
    PortRangeExhausted {
        /// Inclusive lower bound.
        start: u16,
        /// Exclusive upper bound.
        end: u16,
    },

    /// Artifact resolution or download failed.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Local artifact layout operation failed.
    #[error("artifact error: {0}")]
    Artifact(String),

    /// Process supervisor operation failed.
    #[error("supervisor error: {0}")]
    Supervisor(String),

    /// Reverse-proxy operation failed.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Service database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Secrets file operation failed.
    #[error("secrets error: {0}")]
    Secrets(String),

    /// Health check did not succeed within its budget.
    #[error("health check failed: {0}")]
    Health(String),

    /// External command could not be executed.
    #[error("command error: {0}")]
    Command(String),

    /// A workflow step failed and some compensations failed as well.
    #[error("{cause}; rollback incomplete, manual cleanup required: {}", CleanupList(.failures))]
    RollbackIncomplete {
        /// The error that triggered the rollback.
        cause: Box<ControlError>,
        /// Compensations that did not succeed.
        failures: Vec<CompensationFailure>,
    },

    /// Workflow interrupted; completed steps were left in place.
    #[error("operation cancelled; steps left applied: {}", .applied.join(", "))]
    Cancelled {
        /// Completed steps that were not undone.
        applied: Vec<String>,
    },

    /// State store error.
    #[error("state store error: {0}")]
    Store(#[from] sqlx::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a fetch error.
    #[must_use]
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    /// Create an artifact layout error.
    #[must_use]
    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }

    /// Create a supervisor error.
    #[must_use]
    pub fn supervisor(msg: impl Into<String>) -> Self {
        Self::Supervisor(msg.into())
    }

    /// Create a proxy error.
    #[must_use]
    pub fn proxy(msg: impl Into<String>) -> Self {
        Self::Proxy(msg.into())
    }

    /// Create a database error.
    #[must_use]
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a secrets error.
    #[must_use]
    pub fn secrets(msg: impl Into<String>) -> Self {
        Self::Secrets(msg.into())
    }

    /// Create an invalid request error.
    #[must_use]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error reports a missing service.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::ServiceNotFound(_))
    }

    /// Whether this error is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// A compensation that could not be completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationFailure {
    /// Step whose effect could not be undone.
    pub step: String,
    /// Error returned by the compensation.
    pub error: String,
    /// What the operator has to clean up by hand.
    pub manual_cleanup: String,
}

impl fmt::Display for CompensationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.step, self.error, self.manual_cleanup
        )
    }
}

struct CleanupList<'a>(&'a [CompensationFailure]);

impl fmt::Display for CleanupList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}
