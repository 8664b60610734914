//! Channel C: cheap, stateless liveness checks used by the Hybrid Router to
//! decide which backend to route through without ever holding a connection
//! open itself.
//!
//! Neither probe performs any protocol handshake: the SSH probe is a bare
//! TCP connect (no key exchange), the cloud probe is a DNS resolution of the
//! cloud hostname with no outbound connection at all. Both return as soon as
//! they have an answer so repeated probing never leaks file descriptors or
//! blocks on a slow peer.

use crate::model::ConnectivityStatus;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_CLOUD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProberConfig {
    pub device_host: String,
    pub device_port: u16,
    pub cloud_host: String,
    pub ssh_timeout: Duration,
    pub cloud_timeout: Duration,
}

impl ProberConfig {
    pub fn new(device_host: impl Into<String>, device_port: u16, cloud_host: impl Into<String>) -> Self {
        Self {
            device_host: device_host.into(),
            device_port,
            cloud_host: cloud_host.into(),
            ssh_timeout: DEFAULT_SSH_TIMEOUT,
            cloud_timeout: DEFAULT_CLOUD_TIMEOUT,
        }
    }
}

pub struct ReachabilityProber {
    config: ProberConfig,
}

impl ReachabilityProber {
    pub fn new(config: ProberConfig) -> Self {
        Self { config }
    }

    /// Bare TCP connect to the device's SSH port, nothing more.
    pub async fn probe_ssh(&self) -> bool {
        let host = self.config.device_host.clone();
        let port = self.config.device_port;
        let timeout = self.config.ssh_timeout;
        let reachable = tokio::task::spawn_blocking(move || {
            let addr = match (host.as_str(), port).to_socket_addrs() {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => addr,
                    None => return false,
                },
                Err(_) => return false,
            };
            TcpStream::connect_timeout(&addr, timeout).is_ok()
        })
        .await
        .unwrap_or(false);

        debug!(reachable, "probed ssh reachability");
        reachable
    }

    /// Resolves the cloud hostname via DNS; true on any A/AAAA answer.
    /// Opens no socket of its own.
    pub async fn probe_cloud(&self) -> bool {
        let host = self.config.cloud_host.clone();
        let timeout = self.config.cloud_timeout;
        let resolved = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || (host.as_str(), 0u16).to_socket_addrs().is_ok()),
        )
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or(false);

        debug!(reachable = resolved, "probed cloud reachability");
        resolved
    }

    /// Probes SSH first, then cloud, producing the single status the Hybrid
    /// Router caches.
    pub async fn detect_mode(&self) -> ConnectivityStatus {
        if self.probe_ssh().await {
            ConnectivityStatus::Ssh
        } else if self.probe_cloud().await {
            ConnectivityStatus::Cloud
        } else {
            ConnectivityStatus::Offline
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_applies_default_timeouts() {
        let config = ProberConfig::new("tablet.local", 22, "cloud.example");
        assert_eq!(config.ssh_timeout, DEFAULT_SSH_TIMEOUT);
        assert_eq!(config.cloud_timeout, DEFAULT_CLOUD_TIMEOUT);
    }

    #[tokio::test]
    async fn probe_ssh_fails_fast_against_unroutable_host() {
        let config = ProberConfig::new("192.0.2.1", 22, "cloud.example");
        let mut config = config;
        config.ssh_timeout = Duration::from_millis(200);
        let prober = ReachabilityProber::new(config);
        assert!(!prober.probe_ssh().await);
    }

    #[tokio::test]
    async fn probe_cloud_resolves_a_routable_hostname() {
        let config = ProberConfig::new("192.0.2.1", 22, "localhost");
        let prober = ReachabilityProber::new(config);
        assert!(prober.probe_cloud().await);
    }
}
