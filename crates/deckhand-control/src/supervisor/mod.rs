//! Process supervision.
//!
//! Each service runs as a systemd unit under its own system account. The
//! [`ProcessSupervisor`] trait is the seam the orchestrator drives; the
//! systemd implementation shells out through a
//! [`CommandRunner`](crate::runner::CommandRunner).

mod systemd;

pub use systemd::{render_unit, SystemdSupervisor, UnitParams};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ControlResult;
use crate::types::ServiceName;

/// Manages service accounts, unit files and process lifecycle.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Create the service's system account. An existing account is fine.
    async fn create_account(&self, name: &ServiceName) -> ControlResult<()>;

    /// Remove the service's system account. A missing account is fine.
    async fn remove_account(&self, name: &ServiceName) -> ControlResult<()>;

    /// Write the unit file.
    async fn write_unit(&self, name: &ServiceName) -> ControlResult<()>;

    /// Remove the unit file. A missing file is fine.
    async fn remove_unit(&self, name: &ServiceName) -> ControlResult<()>;

    /// Make the supervisor pick up unit file changes.
    async fn reload(&self) -> ControlResult<()>;

    /// Start the unit at boot.
    async fn enable(&self, name: &ServiceName) -> ControlResult<()>;

    /// Stop starting the unit at boot.
    async fn disable(&self, name: &ServiceName) -> ControlResult<()>;

    /// Start the unit and wait, bounded, until it reports active.
    ///
    /// On failure the error carries the tail of the unit's log.
    async fn start(&self, name: &ServiceName, cancel: &CancellationToken) -> ControlResult<()>;

    /// Stop the unit.
    async fn stop(&self, name: &ServiceName) -> ControlResult<()>;

    /// Whether the unit is currently active.
    async fn is_active(&self, name: &ServiceName) -> ControlResult<bool>;
}
