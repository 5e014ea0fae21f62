//! In-memory store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use sparkling_id::{ContainerId, NodeId, SessionId, UserId};

use super::{Store, StoreError, LIVE_SESSION_CONFLICT, LOCAL_NODE_CONFLICT};
use crate::model::{ContainerRecord, ContainerRole, Node, Session, SessionStatus, User};

#[derive(Default)]
struct Tables {
    nodes: HashMap<NodeId, Node>,
    containers: HashMap<ContainerId, ContainerRecord>,
    sessions: HashMap<SessionId, Session>,
    users: HashMap<UserId, User>,
}

/// Store keeping every table in a single mutex-guarded map set.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn has_other_live_session(tables: &Tables, session: &Session) -> bool {
    session.status.is_live()
        && tables.sessions.values().any(|s| {
            s.id != session.id && s.user_id == session.user_id && s.status.is_live()
        })
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_node(&self, node: &Node) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if node.is_local && tables.nodes.values().any(|n| n.is_local) {
            return Err(StoreError::Conflict(LOCAL_NODE_CONFLICT.to_string()));
        }
        tables.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<Node>, StoreError> {
        Ok(self.tables.lock().nodes.get(&id).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let mut nodes: Vec<_> = self.tables.lock().nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.created_at);
        Ok(nodes)
    }

    async fn set_node_active(&self, id: NodeId, active: bool) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let node = tables
            .nodes
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("node {id}")))?;
        node.is_active = active;
        Ok(())
    }

    async fn delete_node(&self, id: NodeId) -> Result<(), StoreError> {
        self.tables.lock().nodes.remove(&id);
        Ok(())
    }

    async fn deactivate_remote_nodes(&self) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock();
        let mut changed = 0;
        for node in tables.nodes.values_mut() {
            if !node.is_local && node.is_active {
                node.is_active = false;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn local_node(&self) -> Result<Option<Node>, StoreError> {
        Ok(self
            .tables
            .lock()
            .nodes
            .values()
            .find(|n| n.is_local)
            .cloned())
    }

    async fn insert_container(&self, container: &ContainerRecord) -> Result<(), StoreError> {
        self.tables
            .lock()
            .containers
            .insert(container.id, container.clone());
        Ok(())
    }

    async fn get_container(&self, id: ContainerId) -> Result<Option<ContainerRecord>, StoreError> {
        Ok(self.tables.lock().containers.get(&id).cloned())
    }

    async fn container_for_node(
        &self,
        node_id: NodeId,
        role: ContainerRole,
    ) -> Result<Option<ContainerRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .containers
            .values()
            .filter(|c| c.node_id == node_id && c.role == role)
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn containers_for_node(
        &self,
        node_id: NodeId,
    ) -> Result<Vec<ContainerRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .containers
            .values()
            .filter(|c| c.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn delete_container(&self, id: ContainerId) -> Result<bool, StoreError> {
        Ok(self.tables.lock().containers.remove(&id).is_some())
    }

    async fn delete_containers_for_node(&self, node_id: NodeId) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock();
        let before = tables.containers.len();
        tables.containers.retain(|_, c| c.node_id != node_id);
        Ok((before - tables.containers.len()) as u64)
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if has_other_live_session(&tables, session) {
            return Err(StoreError::Conflict(LIVE_SESSION_CONFLICT.to_string()));
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.tables.lock().sessions.get(&id).cloned())
    }

    async fn list_sessions(&self, user_id: Option<UserId>) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<_> = self
            .tables
            .lock()
            .sessions
            .values()
            .filter(|s| user_id.is_none_or(|u| s.user_id == u))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(sessions)
    }

    async fn sessions_with_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .tables
            .lock()
            .sessions
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if !tables.sessions.contains_key(&session.id) {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        if has_other_live_session(&tables, session) {
            return Err(StoreError::Conflict(LIVE_SESSION_CONFLICT.to_string()));
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn save_live_session(&self, session: &Session) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        let current = tables
            .sessions
            .get(&session.id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session.id)))?;
        if !current.status.is_live() {
            return Ok(false);
        }
        if has_other_live_session(&tables, session) {
            return Err(StoreError::Conflict(LIVE_SESSION_CONFLICT.to_string()));
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(true)
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        self.tables.lock().users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.tables.lock().users.get(&id).cloned())
    }

    async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        match tables.users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("user {}", user.id))),
        }
    }
}
