use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::capacity::CapacityManager;
use crate::scheduler::manager::ShardFsmManager;

#[derive(Clone)]
pub struct DashboardState {
    pub node_id: String,
    pub capacity: Arc<CapacityManager>,
    pub shards: Arc<ShardFsmManager>,
}

#[derive(Serialize)]
struct NodeStatusResponse {
    node_id: String,
    total: UsageResponse,
    reserved: UsageResponse,
    free: UsageResponse,
    enqueued: usize,
    active: usize,
}

#[derive(Serialize)]
struct UsageResponse {
    cpu: f64,
    memory: u64,
    disk: u64,
    gpu: u64,
}

impl From<crate::capacity::ResourceUsage> for UsageResponse {
    fn from(usage: crate::capacity::ResourceUsage) -> Self {
        Self {
            cpu: usage.cpu,
            memory: usage.memory,
            disk: usage.disk,
            gpu: usage.gpu,
        }
    }
}

#[derive(Serialize)]
struct ShardResponse {
    shard_id: String,
    state: String,
    requirements: UsageResponse,
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/api/node", get(node_status_handler))
        .route("/api/shards", get(list_shards_handler))
        .layer(cors)
        .with_state(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><title>gridnode</title></head><body>\
         <h1>gridnode</h1>\
         <p><a href=\"/api/node\">node status</a> &middot; \
         <a href=\"/api/shards\">shards</a></p>\
         </body></html>",
    )
}

async fn node_status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(NodeStatusResponse {
        node_id: state.node_id.clone(),
        total: state.capacity.total().into(),
        reserved: state.capacity.reserved_total().into(),
        free: state.capacity.free().into(),
        enqueued: state.shards.enqueued().len(),
        active: state.shards.active().len(),
    })
}

async fn list_shards_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let shards: Vec<ShardResponse> = state
        .shards
        .all()
        .into_iter()
        .map(|handle| ShardResponse {
            shard_id: handle.shard_id().to_string(),
            state: handle.state().to_string(),
            requirements: handle.requirements().into(),
        })
        .collect();

    Json(shards)
}
