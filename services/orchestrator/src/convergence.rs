//! Container convergence and node activation.
//!
//! A node converges when exactly one container of its desired role is
//! running on it. An existing container is restarted; if it is gone or will
//! not restart it is replaced by a freshly created one. The runtime is the
//! source of truth and container records are corrected to match it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use sparkling_events::{ProgressBroadcaster, ProgressEvent, ProgressStep};
use sparkling_id::{ContainerId, NodeId};
use sparkling_reconcile::{ConvergenceOutcome, RetryPolicy, SingleFlight};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::broker::ConnectionBroker;
use crate::clock::Clock;
use crate::config::ClusterSettings;
use crate::error::OrchestratorError;
use crate::model::{ContainerRecord, ContainerRole, Node};
use crate::runtime::{
    prepare_bind_source, remove_quietly, remove_volume_quietly, ContainerRuntime, ContainerSpec,
    MountSpec, PortBinding, LABEL_NODE, LABEL_ROLE,
};
use crate::store::Store;

pub const COORDINATOR_PORT: u16 = 7077;
pub const COORDINATOR_UI_PORT: u16 = 8080;
pub const WORKER_UI_PORT: u16 = 8081;

const DATA_MOUNT: &str = "/opt/spark";
const SHARED_MOUNT: &str = "/shared-volume";

/// What a node's container should look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolePlan {
    pub role: ContainerRole,
    pub cmd: Vec<String>,
    pub ports: Vec<u16>,
}

impl RolePlan {
    pub fn coordinator() -> Self {
        Self {
            role: ContainerRole::Coordinator,
            cmd: shell(format!(
                "/opt/spark/sbin/start-master.sh -p {COORDINATOR_PORT} ; /bin/sh"
            )),
            ports: vec![COORDINATOR_PORT, COORDINATOR_UI_PORT],
        }
    }

    /// Worker joining the coordinator at `coordinator_address`, which must
    /// already be sanitized.
    pub fn worker(coordinator_address: &str) -> Self {
        Self {
            role: ContainerRole::Worker,
            cmd: shell(format!(
                "/opt/spark/sbin/start-worker.sh {coordinator_address}:{COORDINATOR_PORT} ; /bin/sh"
            )),
            ports: vec![WORKER_UI_PORT],
        }
    }
}

fn shell(script: String) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script]
}

/// Accept an IP address or a plain hostname; anything else could smuggle
/// shell syntax into the worker command.
pub fn sanitize_address(raw: &str) -> Result<String, OrchestratorError> {
    let address = raw.trim();
    if address.parse::<IpAddr>().is_ok() {
        return Ok(address.to_string());
    }

    let valid_hostname = !address.is_empty()
        && address.len() <= 253
        && !address.starts_with(['-', '.'])
        && address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if valid_hostname {
        Ok(address.to_string())
    } else {
        Err(OrchestratorError::conflict(format!(
            "coordinator address {raw:?} is not a valid host"
        )))
    }
}

/// Brings one node's container to its desired state.
pub struct ConvergenceEngine {
    store: Arc<dyn Store>,
    broker: ConnectionBroker,
    settings: ClusterSettings,
    retry: RetryPolicy,
    progress: ProgressBroadcaster,
    clock: Arc<dyn Clock>,
}

impl ConvergenceEngine {
    pub fn new(
        store: Arc<dyn Store>,
        broker: ConnectionBroker,
        settings: ClusterSettings,
        retry: RetryPolicy,
        progress: ProgressBroadcaster,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            broker,
            settings,
            retry,
            progress,
            clock,
        }
    }

    /// Work out the container plan for `node`.
    pub async fn plan(&self, node: &Node) -> Result<RolePlan, OrchestratorError> {
        match node.desired_role() {
            ContainerRole::Coordinator => Ok(RolePlan::coordinator()),
            _ => {
                let coordinator = self.store.active_local_node().await?.ok_or_else(|| {
                    OrchestratorError::conflict(
                        "no active coordinator node; create a coordinator first",
                    )
                })?;
                let address = sanitize_address(&coordinator.address)?;
                Ok(RolePlan::worker(&address))
            }
        }
    }

    /// Converge `node`, retrying transient failures.
    #[instrument(skip(self, node, cancel), fields(node_id = %node.id))]
    pub async fn converge(
        &self,
        node: &Node,
        cancel: &CancellationToken,
    ) -> Result<ConvergenceOutcome, OrchestratorError> {
        let plan = self.plan(node).await?;
        let plan = &plan;
        self.retry
            .run("converge", cancel, move |_| self.attempt(node, plan))
            .await
    }

    async fn attempt(
        &self,
        node: &Node,
        plan: &RolePlan,
    ) -> Result<ConvergenceOutcome, OrchestratorError> {
        let mut lease = self.broker.acquire(node).await?;
        let result = self.converge_with(lease.runtime(), node, plan).await;
        lease.release().await;
        result
    }

    async fn converge_with(
        &self,
        runtime: &dyn ContainerRuntime,
        node: &Node,
        plan: &RolePlan,
    ) -> Result<ConvergenceOutcome, OrchestratorError> {
        if self.reconcile_existing(runtime, node, plan.role).await? {
            return Ok(ConvergenceOutcome::Restarted);
        }
        self.create_fresh(runtime, node, plan).await?;
        Ok(ConvergenceOutcome::Created)
    }

    /// Returns true if the recorded container was restarted. Stale or
    /// broken records are cleared so a fresh container can take over.
    async fn reconcile_existing(
        &self,
        runtime: &dyn ContainerRuntime,
        node: &Node,
        role: ContainerRole,
    ) -> Result<bool, OrchestratorError> {
        let Some(record) = self.store.container_for_node(node.id, role).await? else {
            return Ok(false);
        };

        let name = record.id.to_string();
        match runtime.find_by_name(&name).await? {
            Some(found) => {
                self.report(node, ProgressStep::RestartingContainer, "Restarting container");
                match runtime.restart_container(&found.id).await {
                    Ok(()) => {
                        info!(container = %name, "restarted existing container");
                        return Ok(true);
                    }
                    Err(e) => {
                        warn!(container = %name, error = %e, "restart failed, replacing container");
                        remove_quietly(runtime, &found.id).await;
                    }
                }
            }
            None => info!(container = %name, "recorded container missing from runtime"),
        }

        self.store.delete_container(record.id).await?;
        Ok(false)
    }

    async fn create_fresh(
        &self,
        runtime: &dyn ContainerRuntime,
        node: &Node,
        plan: &RolePlan,
    ) -> Result<(), OrchestratorError> {
        let settings = &self.settings;

        self.report(node, ProgressStep::PullingImage, "Pulling image");
        runtime
            .pull_image(&settings.image, &settings.image_tag)
            .await?;
        let shared = prepare_bind_source(&settings.shared_volume).await?;

        let container_id = ContainerId::new();
        let name = container_id.to_string();
        let volume = format!("{name}-data");
        runtime.create_volume(&volume).await?;

        self.report(node, ProgressStep::CreatingContainer, "Creating container");
        let spec = ContainerSpec {
            name: name.clone(),
            image: format!("{}:{}", settings.image, settings.image_tag),
            cmd: Some(plan.cmd.clone()),
            env: Vec::new(),
            labels: HashMap::from([
                (LABEL_NODE.to_string(), node.id.to_string()),
                (LABEL_ROLE.to_string(), plan.role.as_str().to_string()),
            ]),
            ports: plan.ports.iter().copied().map(PortBinding::same).collect(),
            mounts: vec![
                MountSpec::Volume {
                    name: volume.clone(),
                    target: DATA_MOUNT.to_string(),
                },
                MountSpec::Bind {
                    source: shared.clone(),
                    target: SHARED_MOUNT.to_string(),
                },
            ],
            restart_always: true,
            interactive: true,
            gpu: settings.gpu,
        };
        let runtime_id = match runtime.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                remove_volume_quietly(runtime, &volume).await;
                return Err(e.into());
            }
        };

        let record = ContainerRecord {
            id: container_id,
            role: plan.role,
            image: settings.image.clone(),
            image_tag: settings.image_tag.clone(),
            ports: plan.ports.clone(),
            volumes: vec![volume.clone(), shared],
            node_id: node.id,
            created_at: self.clock.now(),
            access_token: None,
            access_port: None,
        };
        if let Err(e) = self.start_and_record(runtime, &name, &record).await {
            remove_quietly(runtime, &runtime_id).await;
            remove_volume_quietly(runtime, &volume).await;
            return Err(e);
        }

        info!(container = %name, role = %plan.role, "created container");
        Ok(())
    }

    /// Locate the new container by name, start it and persist its record.
    async fn start_and_record(
        &self,
        runtime: &dyn ContainerRuntime,
        name: &str,
        record: &ContainerRecord,
    ) -> Result<(), OrchestratorError> {
        let created = runtime.find_by_name(name).await?.ok_or_else(|| {
            OrchestratorError::runtime(format!("container {name} not found after creation"))
        })?;
        runtime.start_container(&created.id).await?;
        self.store.insert_container(record).await?;
        Ok(())
    }

    fn report(&self, node: &Node, step: ProgressStep, message: &str) {
        self.progress
            .broadcast(ProgressEvent::for_node(node.id, step, message));
    }
}

/// Activates nodes, collapsing concurrent requests for the same node into
/// one convergence.
pub struct NodeActivator {
    store: Arc<dyn Store>,
    engine: ConvergenceEngine,
    progress: ProgressBroadcaster,
    flights: SingleFlight<NodeId, Result<ConvergenceOutcome, OrchestratorError>>,
}

impl NodeActivator {
    pub fn new(store: Arc<dyn Store>, engine: ConvergenceEngine, progress: ProgressBroadcaster) -> Self {
        Self {
            store,
            engine,
            progress,
            flights: SingleFlight::new(),
        }
    }

    /// Converge the node and record whether it is active. Callers arriving
    /// while an activation of the same node is running share its result.
    pub async fn activate(
        self: &Arc<Self>,
        node_id: NodeId,
        cancel: CancellationToken,
    ) -> Result<ConvergenceOutcome, OrchestratorError> {
        let this = Arc::clone(self);
        self.flights
            .run(node_id, move || async move { this.run(node_id, cancel).await })
            .await
    }

    pub fn is_activating(&self, node_id: NodeId) -> bool {
        self.flights.is_inflight(&node_id)
    }

    #[instrument(skip(self, cancel))]
    async fn run(
        &self,
        node_id: NodeId,
        cancel: CancellationToken,
    ) -> Result<ConvergenceOutcome, OrchestratorError> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("node {node_id}")))?;

        self.progress.broadcast(ProgressEvent::for_node(
            node_id,
            ProgressStep::Starting,
            format!("Activating node {}", node.name),
        ));

        match self.engine.converge(&node, &cancel).await {
            Ok(outcome) => {
                self.store.set_node_active(node_id, true).await?;
                info!(%outcome, "node activated");
                self.progress.broadcast(ProgressEvent::for_node(
                    node_id,
                    ProgressStep::Activated,
                    format!("Node {} is active ({outcome})", node.name),
                ));
                Ok(outcome)
            }
            Err(e) => {
                if let Err(store_err) = self.store.set_node_active(node_id, false).await {
                    warn!(error = %store_err, "failed to mark node inactive");
                }
                // Workers cannot serve sessions without a coordinator.
                if node.is_local {
                    match self.store.deactivate_remote_nodes().await {
                        Ok(0) => {}
                        Ok(n) => info!(workers = n, "remote nodes marked inactive"),
                        Err(store_err) => {
                            warn!(error = %store_err, "failed to mark remote nodes inactive")
                        }
                    }
                }
                self.progress.broadcast(ProgressEvent::for_node(
                    node_id,
                    ProgressStep::Error,
                    format!("Activation failed: {e}"),
                ));
                Err(e)
            }
        }
    }
}
