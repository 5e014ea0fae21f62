//! Scriptable connector and tunnel client for tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{PortForward, RuntimeConnector, RuntimeEndpoint, Tunnel, TunnelClient, TunnelTarget};
use crate::error::OrchestratorError;
use crate::runtime::{ContainerRuntime, RuntimeError};

/// Connector that hands out a shared runtime, with per-endpoint outages.
pub struct MockConnector {
    runtime: Arc<dyn ContainerRuntime>,
    unreachable: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            unreachable: Mutex::new(HashSet::new()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_unreachable(&self, endpoint: &RuntimeEndpoint) {
        self.unreachable.lock().insert(endpoint.to_string());
    }

    /// Every endpoint tried so far, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl RuntimeConnector for MockConnector {
    async fn connect(
        &self,
        endpoint: &RuntimeEndpoint,
    ) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        let label = endpoint.to_string();
        self.attempts.lock().push(label.clone());
        if self.unreachable.lock().contains(&label) {
            return Err(RuntimeError::Connect {
                endpoint: label,
                message: "connection refused".to_string(),
            });
        }
        self.runtime.ping().await?;
        Ok(self.runtime.clone())
    }
}

/// Tunnel client that tracks how many tunnels are open.
#[derive(Default)]
pub struct MockTunnelClient {
    open: Arc<AtomicUsize>,
    opened: AtomicUsize,
    fail_open: AtomicBool,
    targets: Mutex<Vec<(String, String)>>,
}

impl MockTunnelClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Tunnels currently open.
    pub fn open_tunnels(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Tunnels opened over the client's lifetime.
    pub fn opened_total(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// `(user, host)` of every tunnel opened.
    pub fn targets(&self) -> Vec<(String, String)> {
        self.targets.lock().clone()
    }
}

#[async_trait]
impl TunnelClient for MockTunnelClient {
    async fn open(
        &self,
        target: &TunnelTarget,
        forward: &PortForward,
    ) -> Result<Box<dyn Tunnel>, OrchestratorError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Connectivity(format!(
                "authentication to {} failed",
                target.host
            )));
        }
        self.targets
            .lock()
            .push((target.user.clone(), target.host.clone()));
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTunnel {
            local_port: forward.local_port,
            open: self.open.clone(),
            connected: true,
        }))
    }
}

struct MockTunnel {
    local_port: u16,
    open: Arc<AtomicUsize>,
    connected: bool,
}

impl MockTunnel {
    fn close(&mut self) {
        if self.connected {
            self.connected = false;
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Tunnel for MockTunnel {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    async fn disconnect(&mut self) {
        self.close();
    }
}

impl Drop for MockTunnel {
    fn drop(&mut self) {
        self.close();
    }
}
