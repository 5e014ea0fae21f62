//! Session container provisioning.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use rand::Rng;
use sparkling_events::{ProgressBroadcaster, ProgressEvent, ProgressStep};
use sparkling_id::{ContainerId, SessionId};
use sparkling_reconcile::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::broker::ConnectionBroker;
use crate::clock::Clock;
use crate::config::SessionSettings;
use crate::error::OrchestratorError;
use crate::model::{ContainerRecord, ContainerRole, Node, SessionStatus};
use crate::runtime::{
    prepare_bind_source, remove_quietly, ContainerFilter, ContainerRuntime, ContainerSpec,
    MountSpec, PortBinding, LABEL_NODE, LABEL_ROLE, LABEL_SESSION_CONTAINER,
};
use crate::store::Store;

/// Host ports handed out to session containers.
pub const SESSION_PORT_RANGE: Range<u16> = 20000..30000;

const SHARED_MOUNT: &str = "/shared-volume";

/// Identity and credentials of a session container, fixed before the first
/// attempt so every retry reuses them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub container_id: ContainerId,
    pub access_token: String,
    pub access_port: u16,
}

impl SessionCredentials {
    pub fn generate() -> Self {
        let token: [u8; 16] = rand::random();
        Self {
            container_id: ContainerId::new(),
            access_token: hex::encode(token),
            access_port: rand::rng().random_range(SESSION_PORT_RANGE),
        }
    }
}

pub struct SessionProvisioner {
    store: Arc<dyn Store>,
    broker: ConnectionBroker,
    settings: SessionSettings,
    retry: RetryPolicy,
    progress: ProgressBroadcaster,
    clock: Arc<dyn Clock>,
}

impl SessionProvisioner {
    pub fn new(
        store: Arc<dyn Store>,
        broker: ConnectionBroker,
        settings: SessionSettings,
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

    /// Start a container for a `Starting` session and mark it `Running`.
    ///
    /// If provisioning fails for good the session is marked `Failed`.
    #[instrument(skip(self, cancel))]
    pub async fn provision(
        &self,
        session_id: SessionId,
        cancel: &CancellationToken,
    ) -> Result<SessionCredentials, OrchestratorError> {
        let result = self.provision_inner(session_id, cancel).await;
        if let Err(e) = &result {
            self.mark_failed(session_id, e).await;
        }
        result
    }

    async fn provision_inner(
        &self,
        session_id: SessionId,
        cancel: &CancellationToken,
    ) -> Result<SessionCredentials, OrchestratorError> {
        let node = self
            .store
            .active_local_node()
            .await?
            .ok_or_else(|| OrchestratorError::not_found("no active local node"))?;
        let creds = SessionCredentials::generate();

        self.report(session_id, &node, ProgressStep::Provisioning, "Provisioning session container");

        let (node, creds_ref) = (&node, &creds);
        self.retry
            .run("provision_session", cancel, move |_| {
                self.attempt(session_id, node, creds_ref)
            })
            .await?;

        self.report(session_id, node, ProgressStep::Running, "Session is running");
        Ok(creds)
    }

    async fn attempt(
        &self,
        session_id: SessionId,
        node: &Node,
        creds: &SessionCredentials,
    ) -> Result<(), OrchestratorError> {
        let mut lease = self.broker.acquire(node).await?;
        let result = self
            .provision_with(lease.runtime(), session_id, node, creds)
            .await;
        lease.release().await;
        result
    }

    async fn provision_with(
        &self,
        runtime: &dyn ContainerRuntime,
        session_id: SessionId,
        node: &Node,
        creds: &SessionCredentials,
    ) -> Result<(), OrchestratorError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("session {session_id}")))?;
        if !session.status.is_live() {
            return Err(OrchestratorError::conflict(format!(
                "session {session_id} is {}",
                session.status
            )));
        }

        let name = creds.container_id.to_string();
        self.clear_leftovers(runtime, creds).await?;

        let shared = prepare_bind_source(&self.settings.shared_volume).await?;
        let spec = self.container_spec(node, creds, shared.clone());
        let runtime_id = runtime.create_container(&spec).await?;

        if let Err(e) = runtime.start_container(&runtime_id).await {
            remove_quietly(runtime, &runtime_id).await;
            return Err(e.into());
        }
        if let Err(e) = self.wait_for_port(runtime, &runtime_id, creds.access_port).await {
            remove_quietly(runtime, &runtime_id).await;
            return Err(e);
        }

        let record = ContainerRecord {
            id: creds.container_id,
            role: ContainerRole::Session,
            image: self.settings.image.clone(),
            image_tag: self.settings.image_tag.clone(),
            ports: vec![creds.access_port],
            volumes: vec![shared],
            node_id: node.id,
            created_at: self.clock.now(),
            access_token: Some(creds.access_token.clone()),
            access_port: Some(creds.access_port),
        };
        if let Err(e) = self.store.insert_container(&record).await {
            remove_quietly(runtime, &runtime_id).await;
            return Err(e.into());
        }

        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("session {session_id}")))?;
        session.status = SessionStatus::Running;
        session.start_time = self.clock.now();
        session.end_time = None;
        session.container_id = Some(creds.container_id);
        session.access_token = Some(creds.access_token.clone());
        session.access_port = Some(creds.access_port);

        // A stop that landed while the container came up wins.
        if !self.store.save_live_session(&session).await? {
            remove_quietly(runtime, &runtime_id).await;
            self.store.delete_container(creds.container_id).await?;
            return Err(OrchestratorError::conflict(format!(
                "session {session_id} ended during provisioning"
            )));
        }

        info!(container = %name, port = creds.access_port, "session container running");
        Ok(())
    }

    /// Remove whatever a previous attempt left behind under this identity.
    async fn clear_leftovers(
        &self,
        runtime: &dyn ContainerRuntime,
        creds: &SessionCredentials,
    ) -> Result<(), OrchestratorError> {
        let filter = ContainerFilter::by_label(
            LABEL_SESSION_CONTAINER,
            creds.container_id.to_string(),
        );
        for leftover in runtime.list_containers(&filter).await? {
            info!(container = %leftover.name, "removing container left by previous attempt");
            remove_quietly(runtime, &leftover.id).await;
        }
        self.store.delete_container(creds.container_id).await?;
        Ok(())
    }

    fn container_spec(&self, node: &Node, creds: &SessionCredentials, shared: String) -> ContainerSpec {
        let settings = &self.settings;
        ContainerSpec {
            name: creds.container_id.to_string(),
            image: format!("{}:{}", settings.image, settings.image_tag),
            cmd: None,
            env: vec![
                (settings.token_env.clone(), creds.access_token.clone()),
                (settings.port_env.clone(), creds.access_port.to_string()),
            ],
            labels: HashMap::from([
                (
                    LABEL_SESSION_CONTAINER.to_string(),
                    creds.container_id.to_string(),
                ),
                (LABEL_NODE.to_string(), node.id.to_string()),
                (
                    LABEL_ROLE.to_string(),
                    ContainerRole::Session.as_str().to_string(),
                ),
            ]),
            ports: vec![PortBinding::same(creds.access_port)],
            mounts: vec![MountSpec::Bind {
                source: shared,
                target: SHARED_MOUNT.to_string(),
            }],
            restart_always: true,
            interactive: false,
            gpu: false,
        }
    }

    async fn wait_for_port(
        &self,
        runtime: &dyn ContainerRuntime,
        runtime_id: &str,
        port: u16,
    ) -> Result<(), OrchestratorError> {
        for attempt in 1..=self.settings.poll_attempts {
            let details = runtime.inspect_container(runtime_id).await?;
            if details.host_port(port).is_some() {
                return Ok(());
            }
            if attempt < self.settings.poll_attempts {
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        }
        Err(OrchestratorError::runtime(format!(
            "port {port}/tcp was never published by {runtime_id}"
        )))
    }

    async fn mark_failed(&self, session_id: SessionId, error: &OrchestratorError) {
        warn!(%session_id, error = %error, "session provisioning failed");
        match self.store.get_session(session_id).await {
            Ok(Some(mut session)) if session.status.is_live() => {
                session.status = SessionStatus::Failed;
                session.end_time = Some(self.clock.now());
                if let Err(e) = self.store.save_session(&session).await {
                    warn!(%session_id, error = %e, "failed to mark session failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(%session_id, error = %e, "failed to load session"),
        }
        self.progress.broadcast(ProgressEvent::new(
            session_id,
            ProgressStep::Error,
            format!("Session provisioning failed: {error}"),
        ));
    }

    fn report(&self, session_id: SessionId, node: &Node, step: ProgressStep, message: &str) {
        self.progress
            .broadcast(ProgressEvent::new(session_id, step, message).with_node(node.id));
    }
}
