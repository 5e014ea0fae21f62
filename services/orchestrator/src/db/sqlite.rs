//! SQLite-backed store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sparkling_id::{ContainerId, NodeId, SessionId, UserId};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use super::error::query_error;
use crate::model::{ContainerRecord, ContainerRole, Node, Session, SessionStatus, User};
use crate::store::{Store, StoreError, LIVE_SESSION_CONFLICT, LOCAL_NODE_CONFLICT};

struct NodeRow {
    id: String,
    name: String,
    description: String,
    address: String,
    is_local: bool,
    is_active: bool,
    ssh_public_key: String,
    ssh_private_key: String,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for NodeRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            address: row.try_get("address")?,
            is_local: row.try_get("is_local")?,
            is_active: row.try_get("is_active")?,
            ssh_public_key: row.try_get("ssh_public_key")?,
            ssh_private_key: row.try_get("ssh_private_key")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<NodeRow> for Node {
    type Error = StoreError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        Ok(Node {
            id: parse_id(&row.id)?,
            name: row.name,
            description: row.description,
            address: row.address,
            is_local: row.is_local,
            is_active: row.is_active,
            ssh_public_key: row.ssh_public_key,
            ssh_private_key: row.ssh_private_key,
            created_at: row.created_at,
        })
    }
}

struct ContainerRow {
    id: String,
    role: String,
    image: String,
    image_tag: String,
    ports: String,
    volumes: String,
    node_id: String,
    created_at: DateTime<Utc>,
    access_token: Option<String>,
    access_port: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for ContainerRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            role: row.try_get("role")?,
            image: row.try_get("image")?,
            image_tag: row.try_get("image_tag")?,
            ports: row.try_get("ports")?,
            volumes: row.try_get("volumes")?,
            node_id: row.try_get("node_id")?,
            created_at: row.try_get("created_at")?,
            access_token: row.try_get("access_token")?,
            access_port: row.try_get("access_port")?,
        })
    }
}

impl TryFrom<ContainerRow> for ContainerRecord {
    type Error = StoreError;

    fn try_from(row: ContainerRow) -> Result<Self, Self::Error> {
        let role = ContainerRole::parse(&row.role)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown container role '{}'", row.role)))?;
        let ports = split_list(&row.ports)
            .map(|p| {
                p.parse::<u16>()
                    .map_err(|_| StoreError::Corrupt(format!("invalid port '{p}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ContainerRecord {
            id: parse_id(&row.id)?,
            role,
            image: row.image,
            image_tag: row.image_tag,
            ports,
            volumes: split_list(&row.volumes).map(str::to_string).collect(),
            node_id: parse_id(&row.node_id)?,
            created_at: row.created_at,
            access_token: row.access_token,
            access_port: row.access_port.map(to_port).transpose()?,
        })
    }
}

struct SessionRow {
    id: String,
    user_id: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    status: String,
    container_id: Option<String>,
    access_token: Option<String>,
    access_port: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for SessionRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            status: row.try_get("status")?,
            container_id: row.try_get("container_id")?,
            access_token: row.try_get("access_token")?,
            access_port: row.try_get("access_port")?,
        })
    }
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let status = SessionStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown session status '{}'", row.status)))?;

        Ok(Session {
            id: parse_id(&row.id)?,
            user_id: parse_id(&row.user_id)?,
            start_time: row.start_time,
            end_time: row.end_time,
            status,
            container_id: row.container_id.as_deref().map(parse_id).transpose()?,
            access_token: row.access_token,
            access_port: row.access_port.map(to_port).transpose()?,
        })
    }
}

struct UserRow {
    id: String,
    name: String,
    balance_hours: f64,
    unlimited: bool,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for UserRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            balance_hours: row.try_get("balance_hours")?,
            unlimited: row.try_get("unlimited")?,
        })
    }
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: parse_id(&row.id)?,
            name: row.name,
            balance_hours: row.balance_hours,
            unlimited: row.unlimited,
        })
    }
}

fn parse_id<T>(raw: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = sparkling_id::IdError>,
{
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("invalid id '{raw}': {e}")))
}

fn to_port(raw: i64) -> Result<u16, StoreError> {
    u16::try_from(raw).map_err(|_| StoreError::Corrupt(format!("invalid port {raw}")))
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

const NODE_COLUMNS: &str = "id, name, description, address, is_local, is_active, \
     ssh_public_key, ssh_private_key, created_at";
const CONTAINER_COLUMNS: &str = "id, role, image, image_tag, ports, volumes, node_id, \
     created_at, access_token, access_port";
const SESSION_COLUMNS: &str = "id, user_id, start_time, end_time, status, container_id, \
     access_token, access_port";

/// [`Store`] over a SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_nodes(&self, filter: &str) -> Result<Vec<Node>, StoreError> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes {filter} ORDER BY created_at");
        let rows: Vec<NodeRow> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(Node::try_from).collect()
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn insert_node(&self, node: &Node) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO nodes (id, name, description, address, is_local, is_active, \
             ssh_public_key, ssh_private_key, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(node.id.to_string())
        .bind(&node.name)
        .bind(&node.description)
        .bind(&node.address)
        .bind(node.is_local)
        .bind(node.is_active)
        .bind(&node.ssh_public_key)
        .bind(&node.ssh_private_key)
        .bind(node.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error(e, LOCAL_NODE_CONFLICT))?;
        Ok(())
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<Node>, StoreError> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?");
        let row: Option<NodeRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(Node::try_from).transpose()
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        self.fetch_nodes("").await
    }

    async fn set_node_active(&self, id: NodeId, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE nodes SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("node {id}")));
        }
        Ok(())
    }

    async fn delete_node(&self, id: NodeId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn deactivate_remote_nodes(&self) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE nodes SET is_active = 0 WHERE is_local = 0 AND is_active = 1")
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn local_node(&self) -> Result<Option<Node>, StoreError> {
        Ok(self.fetch_nodes("WHERE is_local = 1").await?.into_iter().next())
    }

    async fn insert_container(&self, container: &ContainerRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO containers (id, role, image, image_tag, ports, volumes, node_id, \
             created_at, access_token, access_port) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(container.id.to_string())
        .bind(container.role.as_str())
        .bind(&container.image)
        .bind(&container.image_tag)
        .bind(join_ports(&container.ports))
        .bind(container.volumes.join(","))
        .bind(container.node_id.to_string())
        .bind(container.created_at)
        .bind(container.access_token.as_deref())
        .bind(container.access_port.map(i64::from))
        .execute(&self.pool)
        .await
        .map_err(|e| query_error(e, "container already recorded"))?;
        Ok(())
    }

    async fn get_container(&self, id: ContainerId) -> Result<Option<ContainerRecord>, StoreError> {
        let sql = format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE id = ?");
        let row: Option<ContainerRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(ContainerRecord::try_from).transpose()
    }

    async fn container_for_node(
        &self,
        node_id: NodeId,
        role: ContainerRole,
    ) -> Result<Option<ContainerRecord>, StoreError> {
        let sql = format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers WHERE node_id = ? AND role = ? \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row: Option<ContainerRow> = sqlx::query_as(&sql)
            .bind(node_id.to_string())
            .bind(role.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(ContainerRecord::try_from).transpose()
    }

    async fn containers_for_node(
        &self,
        node_id: NodeId,
    ) -> Result<Vec<ContainerRecord>, StoreError> {
        let sql = format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE node_id = ?");
        let rows: Vec<ContainerRow> = sqlx::query_as(&sql)
            .bind(node_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(ContainerRecord::try_from).collect()
    }

    async fn delete_container(&self, id: ContainerId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM containers WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_containers_for_node(&self, node_id: NodeId) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM containers WHERE node_id = ?")
            .bind(node_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, start_time, end_time, status, container_id, \
             access_token, access_port) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(session.user_id.to_string())
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(session.status.as_str())
        .bind(session.container_id.map(|c| c.to_string()))
        .bind(session.access_token.as_deref())
        .bind(session.access_port.map(i64::from))
        .execute(&self.pool)
        .await
        .map_err(|e| query_error(e, LIVE_SESSION_CONFLICT))?;
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?");
        let row: Option<SessionRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(Session::try_from).transpose()
    }

    async fn list_sessions(&self, user_id: Option<UserId>) -> Result<Vec<Session>, StoreError> {
        let rows: Vec<SessionRow> = match user_id {
            Some(user_id) => {
                let sql = format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ? \
                     ORDER BY start_time DESC"
                );
                sqlx::query_as(&sql)
                    .bind(user_id.to_string())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql =
                    format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY start_time DESC");
                sqlx::query_as(&sql).fetch_all(&self.pool).await
            }
        }
        .map_err(backend)?;
        rows.into_iter().map(Session::try_from).collect()
    }

    async fn sessions_with_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<Session>, StoreError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ?");
        let rows: Vec<SessionRow> = sqlx::query_as(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(Session::try_from).collect()
    }

    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET user_id = ?, start_time = ?, end_time = ?, status = ?, \
             container_id = ?, access_token = ?, access_port = ? WHERE id = ?",
        )
        .bind(session.user_id.to_string())
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(session.status.as_str())
        .bind(session.container_id.map(|c| c.to_string()))
        .bind(session.access_token.as_deref())
        .bind(session.access_port.map(i64::from))
        .bind(session.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error(e, LIVE_SESSION_CONFLICT))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        Ok(())
    }

    async fn save_live_session(&self, session: &Session) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET user_id = ?, start_time = ?, end_time = ?, status = ?, \
             container_id = ?, access_token = ?, access_port = ? \
             WHERE id = ? AND status IN ('Starting', 'Running')",
        )
        .bind(session.user_id.to_string())
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(session.status.as_str())
        .bind(session.container_id.map(|c| c.to_string()))
        .bind(session.access_token.as_deref())
        .bind(session.access_port.map(i64::from))
        .bind(session.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error(e, LIVE_SESSION_CONFLICT))?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get_session(session.id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("session {}", session.id))),
        }
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO users (id, name, balance_hours, unlimited) VALUES (?, ?, ?, ?)")
            .bind(user.id.to_string())
            .bind(&user.name)
            .bind(user.balance_hours)
            .bind(user.unlimited)
            .execute(&self.pool)
            .await
            .map_err(|e| query_error(e, "user already exists"))?;
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, name, balance_hours, unlimited FROM users WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        row.map(User::try_from).transpose()
    }

    async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE users SET name = ?, balance_hours = ?, unlimited = ? WHERE id = ?")
                .bind(&user.name)
                .bind(user.balance_hours)
                .bind(user.unlimited)
                .bind(user.id.to_string())
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {}", user.id)));
        }
        Ok(())
    }
}
