use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::config::DispatchMode;
use crate::dispatcher::InternalDispatcher;
use crate::error::StoreError;
use crate::store::ExecutionStore;

/// Read-only view of this node and the execution records it can see.
#[derive(Clone)]
pub struct DashboardState {
    pub server_id: String,
    pub rest_url: String,
    pub mode: DispatchMode,
    pub store: Arc<dyn ExecutionStore>,
    pub internal: Arc<InternalDispatcher>,
}

#[derive(Serialize)]
struct NodeStatusResponse {
    server_id: String,
    rest_url: String,
    dispatch_mode: String,
    running_executions: Vec<u64>,
    running_partitions: Vec<RunningPartitionResponse>,
}

#[derive(Serialize)]
struct RunningPartitionResponse {
    execution_id: u64,
    partition: u32,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/node", get(node_status_handler))
        .route("/api/instances", get(list_instances_handler))
        .route("/api/executions/:id", get(execution_handler))
        .route("/api/executions/:id/steps", get(step_threads_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

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

fn store_error_response(e: StoreError) -> Response {
    let status = match e {
        StoreError::NoSuchInstance(_)
        | StoreError::NoSuchExecution(_)
        | StoreError::NoSuchStepExecution(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

async fn node_status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let running_partitions = state
        .internal
        .running_partitions()
        .await
        .into_iter()
        .map(|(execution_id, partition)| RunningPartitionResponse {
            execution_id,
            partition,
        })
        .collect();

    Json(NodeStatusResponse {
        server_id: state.server_id.clone(),
        rest_url: state.rest_url.clone(),
        dispatch_mode: state.mode.to_string(),
        running_executions: state.internal.running_executions().await,
        running_partitions,
    })
}

async fn list_instances_handler(State(state): State<DashboardState>) -> Response {
    match state.store.list_job_instances().await {
        Ok(instances) => Json(instances).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn execution_handler(State(state): State<DashboardState>, Path(id): Path<u64>) -> Response {
    match state.store.get_job_execution(id).await {
        Ok(execution) => Json(execution).into_response(),
        Err(e) => store_error_response(e),
    }
}

async fn step_threads_handler(
    State(state): State<DashboardState>,
    Path(id): Path<u64>,
) -> Response {
    match state.store.step_thread_executions(id).await {
        Ok(steps) => Json(steps).into_response(),
        Err(e) => store_error_response(e),
    }
}
