//! Reverse-proxy routing.

mod nginx;

pub use nginx::{render_route, NginxProxy};

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::types::{Route, ServiceName};

/// Makes services reachable through the reverse proxy.
#[async_trait]
pub trait ProxyManager: Send + Sync {
    /// Write and enable the route for `name`, forwarding to `port`.
    ///
    /// The configuration is validated before it goes live. When validation
    /// or activation fails, everything written is discarded again and the
    /// error carries the proxy's complaint.
    async fn activate_route(&self, name: &ServiceName, route: &Route, port: u16)
        -> ControlResult<()>;

    /// Remove whatever route `name` has and reload the proxy.
    async fn deactivate_route(&self, name: &ServiceName) -> ControlResult<()>;
}
