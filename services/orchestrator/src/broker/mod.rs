//! Connection broker: turns a node into a usable container-runtime handle.
//!
//! Local nodes are reached through an ordered chain of runtime endpoints;
//! remote nodes through an authenticated tunnel that forwards an ephemeral
//! loopback port to the node's runtime port. Every handle is wrapped in a
//! [`RuntimeLease`] that owns the tunnel, if any.

mod mock;
mod tunnel;

pub use mock::{MockConnector, MockTunnelClient};
pub use tunnel::{PortForward, SshTunnelClient, Tunnel, TunnelClient, TunnelTarget};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::BrokerSettings;
use crate::error::OrchestratorError;
use crate::model::Node;
use crate::runtime::{ContainerRuntime, DockerRuntime, RuntimeError};

/// Address of a container runtime API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEndpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

#[derive(Debug, Error)]
#[error("invalid runtime endpoint '{0}': expected unix://<path> or tcp://<host>:<port>")]
pub struct InvalidEndpoint(String);

impl RuntimeEndpoint {
    /// Default local chain: the runtime socket, then the TCP listener on
    /// loopback, then the host alias used from inside a container.
    pub fn local_defaults(runtime_port: u16) -> Vec<Self> {
        vec![
            RuntimeEndpoint::Unix(PathBuf::from("/var/run/docker.sock")),
            RuntimeEndpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: runtime_port,
            },
            RuntimeEndpoint::Tcp {
                host: "host.docker.internal".to_string(),
                port: runtime_port,
            },
        ]
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidEndpoint> {
        let raw = raw.trim();
        if let Some(path) = raw.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(InvalidEndpoint(raw.to_string()));
            }
            return Ok(RuntimeEndpoint::Unix(PathBuf::from(path)));
        }
        let rest = raw
            .strip_prefix("tcp://")
            .ok_or_else(|| InvalidEndpoint(raw.to_string()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| InvalidEndpoint(raw.to_string()))?;
        let port = port.parse().map_err(|_| InvalidEndpoint(raw.to_string()))?;
        if host.is_empty() {
            return Err(InvalidEndpoint(raw.to_string()));
        }
        Ok(RuntimeEndpoint::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// Comma-separated list, order preserved.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, InvalidEndpoint> {
        raw.split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn loopback(port: u16) -> Self {
        RuntimeEndpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        }
    }
}

impl fmt::Display for RuntimeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            RuntimeEndpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

/// Connects to a runtime endpoint and verifies it answers.
#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &RuntimeEndpoint,
    ) -> Result<Arc<dyn ContainerRuntime>, RuntimeError>;
}

/// Production connector: a bollard client plus a ping.
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerConnector;

#[async_trait]
impl RuntimeConnector for DockerConnector {
    async fn connect(
        &self,
        endpoint: &RuntimeEndpoint,
    ) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        let runtime = DockerRuntime::connect(endpoint)?;
        runtime.ping().await?;
        Ok(Arc::new(runtime))
    }
}

/// A runtime handle scoped to one unit of work.
///
/// Call [`release`](Self::release) when done. Dropping an unreleased lease
/// drops its tunnel, which kills the tunnel process.
pub struct RuntimeLease {
    runtime: Arc<dyn ContainerRuntime>,
    tunnel: Option<Box<dyn Tunnel>>,
    endpoint: String,
}

impl RuntimeLease {
    fn direct(runtime: Arc<dyn ContainerRuntime>, endpoint: String) -> Self {
        Self {
            runtime,
            tunnel: None,
            endpoint,
        }
    }

    fn tunneled(
        runtime: Arc<dyn ContainerRuntime>,
        tunnel: Box<dyn Tunnel>,
        endpoint: String,
    ) -> Self {
        Self {
            runtime,
            tunnel: Some(tunnel),
            endpoint,
        }
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_tunneled(&self) -> bool {
        self.tunnel.is_some()
    }

    /// Disconnect the tunnel, if any. Safe to call more than once.
    pub async fn release(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.disconnect().await;
            debug!(endpoint = %self.endpoint, "runtime lease released");
        }
    }
}

/// Hands out runtime leases for nodes.
#[derive(Clone)]
pub struct ConnectionBroker {
    connector: Arc<dyn RuntimeConnector>,
    tunnels: Arc<dyn TunnelClient>,
    settings: BrokerSettings,
}

impl ConnectionBroker {
    pub fn new(
        connector: Arc<dyn RuntimeConnector>,
        tunnels: Arc<dyn TunnelClient>,
        settings: BrokerSettings,
    ) -> Self {
        Self {
            connector,
            tunnels,
            settings,
        }
    }

    #[instrument(skip(self, node), fields(node_id = %node.id, is_local = node.is_local))]
    pub async fn acquire(&self, node: &Node) -> Result<RuntimeLease, OrchestratorError> {
        if node.is_local {
            self.acquire_local().await
        } else {
            self.acquire_remote(node).await
        }
    }

    async fn acquire_local(&self) -> Result<RuntimeLease, OrchestratorError> {
        for endpoint in &self.settings.local_endpoints {
            match self.connector.connect(endpoint).await {
                Ok(runtime) => {
                    debug!(endpoint = %endpoint, "connected to local runtime");
                    return Ok(RuntimeLease::direct(runtime, endpoint.to_string()));
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "local runtime endpoint unavailable");
                }
            }
        }

        let tried = self
            .settings
            .local_endpoints
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Err(OrchestratorError::Connectivity(format!(
            "no local runtime endpoint reachable (tried {tried})"
        )))
    }

    async fn acquire_remote(&self, node: &Node) -> Result<RuntimeLease, OrchestratorError> {
        let local_port = allocate_local_port().await?;
        let target = TunnelTarget {
            host: node.address.clone(),
            user: self.settings.ssh_user.clone(),
            private_key: node.ssh_private_key.clone(),
        };
        let forward = PortForward {
            local_port,
            remote_host: "127.0.0.1".to_string(),
            remote_port: self.settings.remote_runtime_port,
        };

        let mut tunnel = self.tunnels.open(&target, &forward).await?;
        let endpoint = RuntimeEndpoint::loopback(tunnel.local_port());

        match self.connector.connect(&endpoint).await {
            Ok(runtime) => {
                debug!(endpoint = %endpoint, host = %node.address, "connected to remote runtime");
                Ok(RuntimeLease::tunneled(runtime, tunnel, endpoint.to_string()))
            }
            Err(e) => {
                tunnel.disconnect().await;
                Err(OrchestratorError::Connectivity(format!(
                    "runtime on {} not reachable through tunnel: {e}",
                    node.address
                )))
            }
        }
    }
}

/// Ask the OS for a free loopback port.
async fn allocate_local_port() -> Result<u16, OrchestratorError> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| OrchestratorError::Connectivity(format!("no free local port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| OrchestratorError::Connectivity(format!("no free local port: {e}")))?
        .port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("unix:///var/run/docker.sock", RuntimeEndpoint::Unix(PathBuf::from("/var/run/docker.sock")))]
    #[case("tcp://127.0.0.1:5763", RuntimeEndpoint::loopback(5763))]
    #[case(" tcp://host.docker.internal:5763 ", RuntimeEndpoint::Tcp { host: "host.docker.internal".into(), port: 5763 })]
    fn test_parse_endpoint(#[case] raw: &str, #[case] expected: RuntimeEndpoint) {
        assert_eq!(RuntimeEndpoint::parse(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("http://127.0.0.1:5763")]
    #[case("tcp://127.0.0.1")]
    #[case("tcp://:5763")]
    #[case("tcp://host:notaport")]
    #[case("unix://")]
    fn test_parse_endpoint_rejects(#[case] raw: &str) {
        assert!(RuntimeEndpoint::parse(raw).is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for endpoint in RuntimeEndpoint::local_defaults(5763) {
            assert_eq!(RuntimeEndpoint::parse(&endpoint.to_string()).unwrap(), endpoint);
        }
    }

    #[tokio::test]
    async fn test_allocate_local_port_is_nonzero() {
        assert_ne!(allocate_local_port().await.unwrap(), 0);
    }
}
