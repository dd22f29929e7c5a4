//! Port reachability checks.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ControlError, ControlResult};
use crate::poll::{poll_until, PollError, RetryPolicy};

/// Waits for a service to accept connections on its port.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Return once `port` accepts a TCP connection.
    ///
    /// Fails with [`ControlError::Health`] when the budget runs out and with
    /// [`ControlError::Cancelled`] when `cancel` fires.
    async fn wait_for_port(&self, port: u16, cancel: &CancellationToken) -> ControlResult<()>;
}

/// Connects to the loopback interface until the port accepts.
///
/// Only socket acceptance is checked. Whatever protocol the service speaks is
/// never exercised.
#[derive(Debug, Clone)]
pub struct TcpHealthChecker {
    host: IpAddr,
    policy: RetryPolicy,
}

impl TcpHealthChecker {
    /// Create a checker probing `127.0.0.1` under `policy`.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            policy,
        }
    }
}

#[async_trait]
impl HealthCheck for TcpHealthChecker {
    async fn wait_for_port(&self, port: u16, cancel: &CancellationToken) -> ControlResult<()> {
        let addr = SocketAddr::new(self.host, port);
        debug!(%addr, timeout = ?self.policy.timeout, "waiting for port");

        let result = poll_until(self.policy, cancel, || async move {
            TcpStream::connect(addr).await.is_ok()
        })
        .await;

        match result {
            Ok(attempts) => {
                debug!(%addr, attempts, "port is accepting connections");
                Ok(())
            }
            Err(PollError::Cancelled) => Err(ControlError::Cancelled {
                applied: Vec::new(),
            }),
            Err(e @ PollError::TimedOut { .. }) => {
                warn!(%addr, error = %e, "port never accepted a connection");
                Err(ControlError::Health(format!(
                    "port {port} did not accept connections: {e}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    fn quick() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn listening_port_is_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        TcpHealthChecker::new(quick())
            .wait_for_port(port, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn closed_port_times_out() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = TcpHealthChecker::new(quick())
            .wait_for_port(port, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Health(ref msg) if msg.contains(&port.to_string())));
    }

    #[tokio::test]
    async fn cancellation_is_reported() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = TcpHealthChecker::new(quick())
            .wait_for_port(1, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
