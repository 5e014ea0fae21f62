//! In-memory runtime for tests and development.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use super::{
    ContainerDetails, ContainerFilter, ContainerRuntime, ContainerSpec, ContainerSummary,
    RuntimeError,
};

/// Runtime operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Ping,
    List,
    Create,
    Start,
    Restart,
    Remove,
    Inspect,
    CreateVolume,
    RemoveVolume,
    PullImage,
}

impl MockOp {
    fn name(&self) -> &'static str {
        match self {
            MockOp::Ping => "ping",
            MockOp::List => "list_containers",
            MockOp::Create => "create_container",
            MockOp::Start => "start_container",
            MockOp::Restart => "restart_container",
            MockOp::Remove => "remove_container",
            MockOp::Inspect => "inspect_container",
            MockOp::CreateVolume => "create_volume",
            MockOp::RemoveVolume => "remove_volume",
            MockOp::PullImage => "pull_image",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Times(u32),
    Always,
}

struct MockContainer {
    id: String,
    spec: ContainerSpec,
    running: bool,
    inspections: u32,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, MockContainer>,
    failures: HashMap<MockOp, Failure>,
    calls: HashMap<MockOp, u32>,
    volumes: Vec<String>,
    images: Vec<String>,
    publish_after: u32,
    never_publish: bool,
    hide_created: bool,
    pull_latency: Duration,
}

impl State {
    fn find_mut(&mut self, id_or_name: &str) -> Option<&mut MockContainer> {
        if self.containers.contains_key(id_or_name) {
            return self.containers.get_mut(id_or_name);
        }
        self.containers.values_mut().find(|c| c.id == id_or_name)
    }

    fn name_of(&self, id_or_name: &str) -> Option<String> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.containers
            .iter()
            .find(|(_, c)| c.id == id_or_name)
            .map(|(name, _)| name.clone())
    }

    /// Count the call and consume a scheduled failure, if any.
    fn check(&mut self, op: MockOp, target: &str) -> Result<(), RuntimeError> {
        *self.calls.entry(op).or_insert(0) += 1;

        let fail = match self.failures.get_mut(&op) {
            Some(Failure::Always) => true,
            Some(Failure::Times(n)) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        };

        if !fail {
            return Ok(());
        }
        if op == MockOp::Ping {
            return Err(RuntimeError::Connect {
                endpoint: "mock".to_string(),
                message: "mock runtime unreachable".to_string(),
            });
        }
        Err(RuntimeError::Operation {
            operation: op.name(),
            target: target.to_string(),
            message: "mock runtime configured to fail".to_string(),
        })
    }
}

/// Mock runtime keeping containers in memory, with per-operation failure
/// injection and call counting.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<State>,
    id_counter: AtomicU64,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock runtime that is never reachable.
    pub fn failing() -> Self {
        let runtime = Self::new();
        runtime.fail_always(MockOp::Ping);
        runtime
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail(&self, op: MockOp, times: u32) {
        self.state.lock().failures.insert(op, Failure::Times(times));
    }

    pub fn fail_always(&self, op: MockOp) {
        self.state.lock().failures.insert(op, Failure::Always);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn calls(&self, op: MockOp) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Host ports only show up after `inspections` inspect calls.
    pub fn publish_ports_after(&self, inspections: u32) {
        self.state.lock().publish_after = inspections;
    }

    pub fn never_publish_ports(&self) {
        self.state.lock().never_publish = true;
    }

    /// Created containers are accepted but never listed.
    /// Make every image pull take `latency`.
    pub fn slow_pulls(&self, latency: Duration) {
        self.state.lock().pull_latency = latency;
    }

    pub fn hide_created_containers(&self) {
        self.state.lock().hide_created = true;
    }

    /// Seed a running container, as if left over by someone else.
    pub fn insert_running(&self, spec: ContainerSpec) -> String {
        let id = self.next_id();
        self.state.lock().containers.insert(
            spec.name.clone(),
            MockContainer {
                id: id.clone(),
                spec,
                running: true,
                inspections: 0,
            },
        );
        id
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().containers.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().containers.contains_key(name)
    }

    pub fn spec(&self, name: &str) -> Option<ContainerSpec> {
        self.state
            .lock()
            .containers
            .get(name)
            .map(|c| c.spec.clone())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state
            .lock()
            .containers
            .get(name)
            .is_some_and(|c| c.running)
    }

    pub fn volumes(&self) -> Vec<String> {
        self.state.lock().volumes.clone()
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.state.lock().images.clone()
    }

    fn next_id(&self) -> String {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("mock_{counter:016x}")
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.state.lock().check(MockOp::Ping, "mock")
    }

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut state = self.state.lock();
        state.check(MockOp::List, "*")?;
        let hide = state.hide_created;
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| !hide || c.running)
            .filter(|(name, c)| filter.matches(name, &c.spec.labels))
            .map(|(name, c)| ContainerSummary {
                id: c.id.clone(),
                name: name.clone(),
                labels: c.spec.labels.clone(),
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let id = self.next_id();
        let mut state = self.state.lock();
        state.check(MockOp::Create, &spec.name)?;
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Operation {
                operation: "create_container",
                target: spec.name.clone(),
                message: "name already in use".to_string(),
            });
        }
        info!(container = %spec.name, image = %spec.image, "[MOCK] Creating container");
        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                inspections: 0,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.check(MockOp::Start, id)?;
        let container = state
            .find_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.check(MockOp::Restart, id)?;
        let container = state
            .find_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.check(MockOp::Remove, id)?;
        let name = state
            .name_of(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if !force && state.containers.get(&name).is_some_and(|c| c.running) {
            return Err(RuntimeError::Operation {
                operation: "remove_container",
                target: id.to_string(),
                message: "container is running".to_string(),
            });
        }
        state.containers.remove(&name);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let mut state = self.state.lock();
        state.check(MockOp::Inspect, id)?;
        let publish_after = state.publish_after;
        let never_publish = state.never_publish;
        let name = state
            .name_of(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let container = state
            .find_mut(&name)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.inspections += 1;

        let published =
            container.running && !never_publish && container.inspections > publish_after;
        let host_ports = if published {
            container
                .spec
                .ports
                .iter()
                .map(|p| (format!("{}/tcp", p.container_port), vec![p.host_port]))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(ContainerDetails {
            id: container.id.clone(),
            name,
            running: container.running,
            host_ports,
        })
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.check(MockOp::CreateVolume, name)?;
        state.volumes.push(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.check(MockOp::RemoveVolume, name)?;
        let before = state.volumes.len();
        state.volumes.retain(|v| v != name);
        if state.volumes.len() == before {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn pull_image(&self, image: &str, tag: &str) -> Result<(), RuntimeError> {
        let latency = self.state.lock().pull_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        state.check(MockOp::PullImage, image)?;
        state.images.push(format!("{image}:{tag}"));
        Ok(())
    }
}
