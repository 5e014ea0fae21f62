//! Node endpoints: registration, activation, removal, bootstrap script and
//! the progress stream.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sparkling_events::ProgressEvent;
use sparkling_id::NodeId;
use tokio_stream::{Stream, StreamExt};

use super::parse_id;
use crate::api::error::ApiError;
use crate::model::Node;
use crate::nodes::{CleanupReport, NewNode};
use crate::state::AppState;

/// Events buffered per progress subscriber before it is dropped.
const PROGRESS_BUFFER: usize = 256;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_nodes).post(register_node))
        .route("/progress", get(progress_stream))
        .route("/{node_id}", get(get_node).delete(delete_node))
        .route("/{node_id}/activate", post(activate_node))
        .route("/{node_id}/script", get(init_script))
}

#[derive(Debug, Deserialize)]
pub struct RegisterNodeRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub address: String,
    #[serde(default)]
    pub is_local: bool,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct NodeResponse {
    pub id: String,
    pub name: String,
    pub description: String,
    pub address: String,
    pub is_local: bool,
    pub is_active: bool,
    pub ssh_public_key: String,
    pub created_at: DateTime<Utc>,
}

impl From<Node> for NodeResponse {
    fn from(node: Node) -> Self {
        Self {
            id: node.id.to_string(),
            name: node.name,
            description: node.description,
            address: node.address,
            is_local: node.is_local,
            is_active: node.is_active,
            ssh_public_key: node.ssh_public_key,
            created_at: node.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListNodesResponse {
    pub items: Vec<NodeResponse>,
}

#[derive(Debug, Serialize)]
pub struct ActivationAccepted {
    pub node_id: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DeleteNodeResponse {
    pub node_id: String,
    pub containers_removed: usize,
    pub cleanup_failures: usize,
}

/// GET /v1/nodes
async fn list_nodes(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let items = state
        .nodes()
        .list()
        .await?
        .into_iter()
        .map(NodeResponse::from)
        .collect();
    Ok(Json(ListNodesResponse { items }))
}

/// POST /v1/nodes
async fn register_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterNodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("invalid_name", "Node name is required"));
    }
    if !req.is_local && req.address.trim().is_empty() {
        return Err(ApiError::bad_request(
            "invalid_address",
            "Remote nodes need an address",
        ));
    }

    let node = state
        .nodes()
        .register(NewNode {
            name: req.name.trim().to_string(),
            description: req.description,
            address: req.address.trim().to_string(),
            is_local: req.is_local,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(NodeResponse::from(node))))
}

/// GET /v1/nodes/{node_id}
async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = parse_id(&node_id, "node")?;
    let node = state.nodes().get(node_id).await?;
    Ok(Json(NodeResponse::from(node)))
}

/// DELETE /v1/nodes/{node_id}
async fn delete_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = parse_id(&node_id, "node")?;
    let CleanupReport { removed, failed } = state.nodes().delete(node_id).await?;
    Ok(Json(DeleteNodeResponse {
        node_id: node_id.to_string(),
        containers_removed: removed,
        cleanup_failures: failed,
    }))
}

/// POST /v1/nodes/{node_id}/activate
///
/// Accepts the request and converges the node in the background; follow
/// `/v1/nodes/progress` for the outcome.
async fn activate_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = parse_id(&node_id, "node")?;
    // Fail fast on unknown nodes instead of accepting a doomed job.
    state.nodes().get(node_id).await?;

    let activator = state.activator().clone();
    let cancel = state.jobs().token();
    state.jobs().spawn("activate_node", async move {
        activator.activate(node_id, cancel).await.map(|_| ())
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(ActivationAccepted {
            node_id: node_id.to_string(),
            status: "activating",
        }),
    ))
}

/// GET /v1/nodes/{node_id}/script
async fn init_script(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = parse_id(&node_id, "node")?;
    let script = state.nodes().init_script(node_id).await?;
    Ok(([(header::CONTENT_TYPE, "text/x-shellscript; charset=utf-8")], script))
}

/// GET /v1/nodes/progress
async fn progress_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = state
        .progress()
        .subscribe(PROGRESS_BUFFER)
        .map(|event| Ok(sse_event(&event)));

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn sse_event(event: &ProgressEvent) -> Event {
    let data = event.to_json().unwrap_or_else(|_| event.message.clone());
    Event::default().event(event.step.as_str()).data(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_defaults() {
        let req: RegisterNodeRequest =
            serde_json::from_str(r#"{"name":"n1","address":"10.0.0.2"}"#).unwrap();
        assert!(!req.is_local);
        assert!(req.description.is_empty());
    }

    #[test]
    fn test_node_response_omits_private_key() {
        let node = Node {
            id: NodeId::new(),
            name: "n1".into(),
            description: String::new(),
            address: "10.0.0.2".into(),
            is_local: true,
            is_active: false,
            ssh_public_key: "ssh-ed25519 AAAA".into(),
            ssh_private_key: "PRIVATE".into(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&NodeResponse::from(node)).unwrap();
        assert!(!json.contains("PRIVATE"));
        assert!(json.contains("ssh-ed25519 AAAA"));
    }
}
