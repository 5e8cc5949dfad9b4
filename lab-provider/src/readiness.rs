//! TCP readiness probing for freshly provisioned VMs.

use std::time::Duration;

use futures_util::future::join_all;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use crate::{ProviderError, Result};

#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Delay between probe rounds.
    pub interval: Duration,
    /// Overall deadline for every target to accept a connection.
    pub timeout: Duration,
    /// Deadline for a single connection attempt.
    pub probe_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// A VM's terminal endpoint. A target without a port can never become ready.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
}

/// Whether `host:port` accepts a TCP connection within `probe_timeout`.
pub async fn probe(host: &str, port: u16, probe_timeout: Duration) -> bool {
    matches!(
        timeout(probe_timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

async fn pending_targets<'a>(targets: &'a [ProbeTarget], probe_timeout: Duration) -> Vec<&'a str> {
    let results = join_all(targets.iter().map(|target| async move {
        let ready = match target.port {
            Some(port) => probe(&target.host, port, probe_timeout).await,
            None => false,
        };
        (target.name.as_str(), ready)
    }))
    .await;

    results
        .into_iter()
        .filter(|(_, ready)| !ready)
        .map(|(name, _)| name)
        .collect()
}

/// Poll every target until all accept connections, or fail once `config.timeout` has elapsed.
///
/// An empty target list is ready immediately.
pub async fn wait_until_reachable(targets: &[ProbeTarget], config: &ReadinessConfig) -> Result<()> {
    let started = Instant::now();

    loop {
        let pending = pending_targets(targets, config.probe_timeout).await;
        if pending.is_empty() {
            return Ok(());
        }

        let elapsed = started.elapsed();
        if elapsed >= config.timeout {
            return Err(ProviderError::ReadinessTimeout {
                waited_secs: elapsed.as_secs(),
                pending: pending.join(", "),
            });
        }

        debug!(pending = ?pending, "Waiting for VMs to accept connections");
        sleep(config.interval.min(config.timeout - elapsed)).await;
    }
}
