//! Service state storage backends.
//!
//! The store is the single source of truth for which services are deployed.
//! The primary implementation uses SQLite, but an in-memory implementation is
//! provided for testing.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::types::{HistoryEntry, ServiceName, ServiceRecord};

/// Backend for storing service records and their history.
///
/// Implementations serialise their own writes. Uniqueness of names and ports
/// is enforced here regardless of what callers checked beforehand.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    /// Insert a new service record.
    ///
    /// Fails with [`ControlError::ServiceExists`](crate::ControlError::ServiceExists)
    /// if the name is taken and
    /// [`ControlError::PortInUse`](crate::ControlError::PortInUse) if the port is.
    async fn insert(&self, record: &ServiceRecord) -> ControlResult<()>;

    /// Get a service by name.
    ///
    /// Returns `None` if the service does not exist.
    async fn get(&self, name: &ServiceName) -> ControlResult<Option<ServiceRecord>>;

    /// List all services ordered by name.
    async fn list(&self) -> ControlResult<Vec<ServiceRecord>>;

    /// Replace a service record.
    ///
    /// Fails with [`ControlError::ServiceNotFound`](crate::ControlError::ServiceNotFound)
    /// if no record has this name.
    async fn update(&self, record: &ServiceRecord) -> ControlResult<()>;

    /// Delete a service record.
    ///
    /// Fails with [`ControlError::ServiceNotFound`](crate::ControlError::ServiceNotFound)
    /// if no record has this name.
    async fn delete(&self, name: &ServiceName) -> ControlResult<()>;

    /// Ports currently assigned, ascending.
    async fn used_ports(&self) -> ControlResult<Vec<u16>>;

    /// Name of the service holding `port`, if any.
    async fn port_owner(&self, port: u16) -> ControlResult<Option<String>>;

    /// Append an entry to the history ledger.
    async fn append_history(&self, entry: &HistoryEntry) -> ControlResult<()>;

    /// History for a service, newest first.
    async fn history(&self, service: &str) -> ControlResult<Vec<HistoryEntry>>;
}
