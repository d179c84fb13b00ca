use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::ReplikvError;
use crate::kv::KvStore;
use crate::raft::{Command, RaftNode, RaftRole};

/// Shared handles for the client-facing HTTP surface.
#[derive(Clone)]
pub struct ApiState {
    pub raft_node: Arc<RaftNode>,
    pub kv: Arc<RwLock<KvStore>>,
}

#[derive(Serialize)]
pub struct NodeStatusResponse {
    node_id: u64,
    role: String,
    current_term: u64,
    leader_id: Option<u64>,
    commit_index: u64,
    last_applied: u64,
    log_length: usize,
    keys: usize,
}

#[derive(Serialize)]
pub struct WriteResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// Where to retry when this node is not the leader.
    #[serde(skip_serializing_if = "Option::is_none")]
    leader_id: Option<u64>,
}

/// Build the router; exposed separately so tests can drive the handlers
/// without binding a socket.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(status_handler))
        .route("/store", get(dump_handler))
        .route(
            "/store/{key}",
            get(get_handler)
                .put(put_handler)
                .post(put_handler)
                .delete(delete_handler),
        )
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting HTTP API");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP API");
            return;
        }
    };

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown.cancelled_owned());
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "HTTP API server failed");
    }
}

pub async fn status_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let raft_state = state.raft_node.state.read().await;
    let keys = state.kv.read().await.len();

    Json(NodeStatusResponse {
        node_id: state.raft_node.id,
        role: raft_state.role.to_string(),
        current_term: raft_state.current_term,
        leader_id: if raft_state.role == RaftRole::Leader {
            Some(state.raft_node.id)
        } else {
            raft_state.leader_id
        },
        commit_index: raft_state.commit_index,
        last_applied: raft_state.last_applied,
        log_length: raft_state.log.len(),
        keys,
    })
}

pub async fn dump_handler(State(state): State<ApiState>) -> Json<HashMap<String, String>> {
    Json(state.kv.read().await.dump())
}

/// Reads are served from the local applied map on any node; they are not
/// routed through the log.
pub async fn get_handler(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.kv.read().await.get(&key) {
        Some(value) => (StatusCode::OK, value.clone()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

pub async fn put_handler(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let value = String::from_utf8_lossy(&body).into_owned();
    submit(&state, Command::Put { key, value }).await
}

pub async fn delete_handler(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    submit(&state, Command::Delete { key }).await
}

/// Propose a write and translate the quorum outcome into a response.
async fn submit(state: &ApiState, command: Command) -> (StatusCode, Json<WriteResponse>) {
    match state.raft_node.propose(command).await {
        Ok(index) => (
            StatusCode::OK,
            Json(WriteResponse {
                ok: true,
                index: Some(index),
                error: None,
                leader_id: None,
            }),
        ),
        Err(ReplikvError::NotLeader(leader_id)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(WriteResponse {
                ok: false,
                index: None,
                error: Some("not the leader".to_string()),
                leader_id,
            }),
        ),
        Err(ReplikvError::ProposalTimeout) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(WriteResponse {
                ok: false,
                index: None,
                error: Some("write not committed before deadline".to_string()),
                leader_id: None,
            }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(WriteResponse {
                ok: false,
                index: None,
                error: Some(e.to_string()),
                leader_id: None,
            }),
        ),
    }
}
