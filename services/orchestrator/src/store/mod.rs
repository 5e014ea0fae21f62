//! Persistence boundary.
//!
//! Every save is its own commit; there are no multi-entity transactions.
//! Two implementations: [`MemoryStore`] for tests and development, and the
//! SQLite-backed store in [`crate::db`].

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use sparkling_id::{ContainerId, NodeId, SessionId, UserId};
use thiserror::Error;

use crate::model::{ContainerRecord, ContainerRole, Node, Session, SessionStatus, User};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    /// A uniqueness invariant would be violated.
    #[error("{0}")]
    Conflict(String),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> Result<(), StoreError>;

    // Nodes

    /// Fails with `Conflict` if `node` is local and a local node exists.
    async fn insert_node(&self, node: &Node) -> Result<(), StoreError>;
    async fn get_node(&self, id: NodeId) -> Result<Option<Node>, StoreError>;
    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;
    async fn set_node_active(&self, id: NodeId, active: bool) -> Result<(), StoreError>;
    async fn delete_node(&self, id: NodeId) -> Result<(), StoreError>;
    async fn local_node(&self) -> Result<Option<Node>, StoreError>;
    /// Mark every active remote node inactive; returns how many changed.
    async fn deactivate_remote_nodes(&self) -> Result<u64, StoreError>;

    async fn active_local_node(&self) -> Result<Option<Node>, StoreError> {
        Ok(self.local_node().await?.filter(|n| n.is_active))
    }

    // Containers

    async fn insert_container(&self, container: &ContainerRecord) -> Result<(), StoreError>;
    async fn get_container(&self, id: ContainerId) -> Result<Option<ContainerRecord>, StoreError>;
    async fn container_for_node(
        &self,
        node_id: NodeId,
        role: ContainerRole,
    ) -> Result<Option<ContainerRecord>, StoreError>;
    async fn containers_for_node(&self, node_id: NodeId)
        -> Result<Vec<ContainerRecord>, StoreError>;
    /// Returns whether a row was deleted.
    async fn delete_container(&self, id: ContainerId) -> Result<bool, StoreError>;
    async fn delete_containers_for_node(&self, node_id: NodeId) -> Result<u64, StoreError>;

    // Sessions

    /// Fails with `Conflict` if the user already has a live session.
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StoreError>;
    /// Newest first.
    async fn list_sessions(&self, user_id: Option<UserId>) -> Result<Vec<Session>, StoreError>;
    async fn sessions_with_status(&self, status: SessionStatus)
        -> Result<Vec<Session>, StoreError>;
    async fn save_session(&self, session: &Session) -> Result<(), StoreError>;
    /// Like `save_session`, but only while the stored row is still
    /// `Starting` or `Running`. Returns false, writing nothing, otherwise.
    async fn save_live_session(&self, session: &Session) -> Result<bool, StoreError>;

    // Users

    async fn insert_user(&self, user: &User) -> Result<(), StoreError>;
    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError>;
    async fn save_user(&self, user: &User) -> Result<(), StoreError>;
}

pub(crate) const LIVE_SESSION_CONFLICT: &str = "user already has a live session";
pub(crate) const LOCAL_NODE_CONFLICT: &str = "a local node already exists";
