//! Session container teardown.

use std::sync::Arc;

use sparkling_events::{ProgressBroadcaster, ProgressEvent, ProgressStep};
use sparkling_id::SessionId;
use sparkling_reconcile::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::broker::ConnectionBroker;
use crate::error::OrchestratorError;
use crate::model::{Node, Session};
use crate::runtime::{ContainerFilter, ContainerRuntime, LABEL_SESSION_CONTAINER};
use crate::store::Store;

pub struct SessionTeardown {
    store: Arc<dyn Store>,
    broker: ConnectionBroker,
    retry: RetryPolicy,
    progress: ProgressBroadcaster,
}

impl SessionTeardown {
    pub fn new(
        store: Arc<dyn Store>,
        broker: ConnectionBroker,
        retry: RetryPolicy,
        progress: ProgressBroadcaster,
    ) -> Self {
        Self {
            store,
            broker,
            retry,
            progress,
        }
    }

    /// Remove the session's container and unlink it from the session.
    ///
    /// A session with no linked container, or whose container is already
    /// gone from the runtime, yields `NotFound` after the persisted side has
    /// been cleaned up.
    #[instrument(skip(self, cancel))]
    pub async fn teardown(
        &self,
        session_id: SessionId,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let node = self
            .store
            .active_local_node()
            .await?
            .ok_or_else(|| OrchestratorError::not_found("no active local node"))?;
        let node = &node;

        self.retry
            .run("teardown_session", cancel, move |_| self.attempt(session_id, node))
            .await
    }

    async fn attempt(&self, session_id: SessionId, node: &Node) -> Result<(), OrchestratorError> {
        let mut lease = self.broker.acquire(node).await?;
        let result = self.teardown_with(lease.runtime(), session_id).await;
        lease.release().await;
        result
    }

    async fn teardown_with(
        &self,
        runtime: &dyn ContainerRuntime,
        session_id: SessionId,
    ) -> Result<(), OrchestratorError> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("session {session_id}")))?;
        let Some(container_id) = session.container_id else {
            return Err(OrchestratorError::not_found(format!(
                "session {session_id} has no container"
            )));
        };

        let filter = ContainerFilter::by_label(LABEL_SESSION_CONTAINER, container_id.to_string());
        let found = runtime.list_containers(&filter).await?;
        if found.is_empty() {
            self.unlink(&mut session).await?;
            return Err(OrchestratorError::not_found(format!(
                "container {container_id} of session {session_id} is not in the runtime"
            )));
        }

        for container in &found {
            match runtime.remove_container(&container.id, true).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.unlink(&mut session).await?;

        info!(container = %container_id, "session container removed");
        self.progress.broadcast(ProgressEvent::new(
            session_id,
            ProgressStep::Removed,
            "Session container removed",
        ));
        Ok(())
    }

    /// Drop the container link and row; the token/port snapshot stays.
    async fn unlink(&self, session: &mut Session) -> Result<(), OrchestratorError> {
        let Some(container_id) = session.container_id.take() else {
            return Ok(());
        };
        self.store.save_session(session).await?;
        self.store.delete_container(container_id).await?;
        Ok(())
    }
}
