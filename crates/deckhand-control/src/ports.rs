//! Port allocation.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::config::PortsConfig;
use crate::error::{ControlError, ControlResult};
use crate::store::ServiceStore;

/// Hands out ports from `[start, end)` based on the store's live view.
///
/// Allocation is deterministic: the lowest free port always wins.
#[derive(Clone)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    store: Arc<dyn ServiceStore>,
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("start", &self.start)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

impl PortAllocator {
    /// Create an allocator over `config`'s range.
    #[must_use]
    pub fn new(config: &PortsConfig, store: Arc<dyn ServiceStore>) -> Self {
        Self {
            start: config.range_start,
            end: config.range_end,
            store,
        }
    }

    /// Lowest port in range that no service holds.
    pub async fn next(&self) -> ControlResult<u16> {
        let used: BTreeSet<u16> = self.store.used_ports().await?.into_iter().collect();

        let port = (self.start..self.end)
            .find(|p| !used.contains(p))
            .ok_or(ControlError::PortRangeExhausted {
                start: self.start,
                end: self.end,
            })?;

        debug!(port, "allocated port");
        Ok(port)
    }

    /// Validate an explicitly requested port.
    pub async fn request(&self, port: u16) -> ControlResult<u16> {
        if !(self.start..self.end).contains(&port) {
            return Err(ControlError::PortOutOfRange {
                port,
                start: self.start,
                end: self.end,
            });
        }

        if let Some(owner) = self.store.port_owner(port).await? {
            return Err(ControlError::PortInUse { port, owner });
        }

        Ok(port)
    }

    /// Validate `requested` if given, otherwise allocate.
    pub async fn assign(&self, requested: Option<u16>) -> ControlResult<u16> {
        match requested {
            Some(port) => self.request(port).await,
            None => self.next().await,
        }
    }
}
