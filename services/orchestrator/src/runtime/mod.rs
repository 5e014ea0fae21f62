//! Container runtime abstraction.
//!
//! The runtime is authoritative: persisted container records are only a
//! cache and are reconciled against what this trait reports.

mod docker;
mod mock;

pub use docker::DockerRuntime;
pub use mock::{MockOp, MockRuntime};

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Label carrying the session container id.
pub const LABEL_SESSION_CONTAINER: &str = "sparkling.session_container_id";
/// Label carrying the owning node id.
pub const LABEL_NODE: &str = "sparkling.node_id";
/// Label carrying the container role.
pub const LABEL_ROLE: &str = "sparkling.role";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to connect to runtime at {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("container {0} not found")]
    NotFound(String),

    #[error("{operation} failed for {target}: {message}")]
    Operation {
        operation: &'static str,
        target: String,
        message: String,
    },
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// A host port published for a container port (TCP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
}

impl PortBinding {
    /// Same port inside and outside the container.
    pub fn same(port: u16) -> Self {
        Self {
            container_port: port,
            host_port: port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSpec {
    /// A named runtime volume.
    Volume { name: String, target: String },
    /// A host directory.
    Bind { source: String, target: String },
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    /// Runtime container name, also the identity marker used for lookups.
    pub name: String,
    /// `image:tag`.
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<MountSpec>,
    pub restart_always: bool,
    pub interactive: bool,
    /// Request every available GPU.
    pub gpu: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// Exact container name.
    pub name: Option<String>,
    /// `key=value` label pairs, all of which must match.
    pub labels: Vec<(String, String)>,
}

impl ContainerFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            labels: Vec::new(),
        }
    }

    pub fn by_label(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: None,
            labels: vec![(key.into(), value.into())],
        }
    }

    pub fn matches(&self, name: &str, labels: &HashMap<String, String>) -> bool {
        self.name.as_deref().is_none_or(|n| n == name)
            && self
                .labels
                .iter()
                .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub running: bool,
    /// Published host ports keyed by `"<port>/tcp"`.
    pub host_ports: HashMap<String, Vec<u16>>,
}

impl ContainerDetails {
    /// First host port bound to `container_port/tcp`, if published yet.
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.host_ports
            .get(&format!("{container_port}/tcp"))
            .and_then(|ports| ports.first().copied())
    }
}

/// Control handle for one node's container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// All containers (running or not) matching `filter`.
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Returns the runtime id of the new container.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError>;

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;

    async fn pull_image(&self, image: &str, tag: &str) -> Result<(), RuntimeError>;

    /// Find a container by exact name.
    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerSummary>, RuntimeError> {
        Ok(self
            .list_containers(&ContainerFilter::by_name(name))
            .await?
            .into_iter()
            .find(|c| c.name == name))
    }
}

/// Force-remove a container, logging instead of failing.
pub async fn remove_quietly(runtime: &dyn ContainerRuntime, id: &str) {
    match runtime.remove_container(id, true).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(container = %id, error = %e, "failed to remove container"),
    }
}

/// Remove a named volume, logging instead of failing.
pub async fn remove_volume_quietly(runtime: &dyn ContainerRuntime, name: &str) {
    match runtime.remove_volume(name).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(volume = %name, error = %e, "failed to remove volume"),
    }
}

/// Make sure a bind-mount source exists and return its absolute path.
pub async fn prepare_bind_source(path: &Path) -> Result<String, RuntimeError> {
    let io_error = |e: std::io::Error| RuntimeError::Operation {
        operation: "prepare_bind_source",
        target: path.display().to_string(),
        message: e.to_string(),
    };
    tokio::fs::create_dir_all(path).await.map_err(io_error)?;
    let absolute = std::path::absolute(path).map_err(io_error)?;
    Ok(absolute.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches_name_and_labels() {
        let labels = HashMap::from([
            (LABEL_NODE.to_string(), "node_1".to_string()),
            (LABEL_ROLE.to_string(), "worker".to_string()),
        ]);

        assert!(ContainerFilter::by_label(LABEL_NODE, "node_1").matches("c", &labels));
        assert!(!ContainerFilter::by_label(LABEL_NODE, "node_2").matches("c", &labels));
        assert!(ContainerFilter::by_name("c").matches("c", &labels));
        assert!(!ContainerFilter::by_name("c").matches("cc", &labels));
        assert!(ContainerFilter::default().matches("anything", &HashMap::new()));
    }

    #[tokio::test]
    async fn test_prepare_bind_source_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("shared");
        let source = prepare_bind_source(&target).await.unwrap();
        assert!(target.is_dir());
        assert!(Path::new(&source).is_absolute());
    }

    #[test]
    fn test_host_port_lookup() {
        let details = ContainerDetails {
            host_ports: HashMap::from([("8888/tcp".to_string(), vec![8888])]),
            ..Default::default()
        };
        assert_eq!(details.host_port(8888), Some(8888));
        assert_eq!(details.host_port(7077), None);
    }
}
