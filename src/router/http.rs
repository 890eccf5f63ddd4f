//! HTTP admin surface
//!
//! Serves health and metrics plus the JSON endpoints backing the
//! operator CLI.

use crate::common::{Config, Error, METRICS};
use crate::ops;
use crate::router::health::HealthManager;
use crate::store::PlacementStore;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Shared state for the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub config: Arc<Config>,
    pub store: Arc<PlacementStore>,
    pub health: Arc<HealthManager>,
}

type HandlerError = (StatusCode, String);

fn error_response(e: Error) -> HandlerError {
    (e.to_http_status(), e.to_string())
}

/// Creates the admin router with all endpoints.
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/admin/status", get(admin_status))
        .route("/admin/dataloss", get(admin_dataloss))
        .route("/admin/metadata", get(admin_metadata))
        .route("/admin/track-repository", post(admin_track_repository))
        .route("/admin/remove-repository", post(admin_remove_repository))
        .route("/admin/accept-dataloss", post(admin_accept_dataloss))
        .with_state(state)
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "router": state.config.router_name,
        "version": crate::VERSION,
    }))
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
    // Refresh queue depth gauges at scrape time
    for vs in &state.config.virtual_storages {
        for node in &vs.nodes {
            METRICS.observe_queue_depth(&node.storage, state.store.queue_depth(&node.storage));
        }
    }
    (StatusCode::OK, METRICS.render())
}

/// Minimal cluster status for dashboards.
async fn admin_status(State(state): State<AdminState>) -> Result<impl IntoResponse, HandlerError> {
    let mut virtual_storages = Vec::new();
    for vs in &state.config.virtual_storages {
        let healthy = state
            .health
            .healthy_storages(&vs.name)
            .map_err(error_response)?;
        let storages: Vec<_> = vs
            .nodes
            .iter()
            .map(|n| {
                json!({
                    "storage": n.storage,
                    "healthy": healthy.contains(&n.storage),
                    "queue_depth": state.store.queue_depth(&n.storage),
                })
            })
            .collect();
        let repositories = state
            .store
            .list_repositories(&vs.name)
            .map_err(error_response)?
            .len();
        virtual_storages.push(json!({
            "name": vs.name,
            "repositories": repositories,
            "storages": storages,
        }));
    }

    Ok(Json(json!({
        "router": state.config.router_name,
        "virtual_storages": virtual_storages,
    })))
}

#[derive(Deserialize)]
struct DatalossQuery {
    virtual_storage: Option<String>,
    #[serde(default)]
    partially_unavailable: bool,
}

async fn admin_dataloss(
    State(state): State<AdminState>,
    Query(query): Query<DatalossQuery>,
) -> Result<Json<Vec<ops::DatalossReport>>, HandlerError> {
    let names = match &query.virtual_storage {
        Some(name) => vec![name.clone()],
        None => state.store.virtual_storages(),
    };

    let mut reports = Vec::new();
    for name in names {
        let healthy = state.health.healthy_storages(&name).map_err(error_response)?;
        reports.push(
            ops::dataloss::gather(
                &state.store,
                &name,
                &healthy,
                query.partially_unavailable,
            )
            .map_err(error_response)?,
        );
    }
    Ok(Json(reports))
}

#[derive(Deserialize)]
struct MetadataQuery {
    repository_id: Option<u64>,
    virtual_storage: Option<String>,
    relative_path: Option<String>,
}

async fn admin_metadata(
    State(state): State<AdminState>,
    Query(query): Query<MetadataQuery>,
) -> Result<Json<ops::MetadataReport>, HandlerError> {
    let repository_id = match (query.repository_id, query.virtual_storage, query.relative_path) {
        (Some(id), None, None) => id,
        (None, Some(vs), Some(path)) => state
            .store
            .get_repository_by_path(&vs, &path)
            .map_err(error_response)?
            .repository_id,
        _ => {
            return Err(error_response(Error::InvalidArgument(
                "repository id or virtual storage and relative path required".into(),
            )))
        }
    };

    let record = state.store.get_repository(repository_id).map_err(error_response)?;
    let healthy = state
        .health
        .healthy_storages(&record.virtual_storage)
        .map_err(error_response)?;
    let report = ops::metadata::gather(&state.store, repository_id, &healthy)
        .map_err(error_response)?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct TrackRequest {
    virtual_storage: String,
    relative_path: String,
    authoritative_storage: String,
}

async fn admin_track_repository(
    State(state): State<AdminState>,
    Json(req): Json<TrackRequest>,
) -> Result<Json<ops::track::TrackResult>, HandlerError> {
    ops::track_repository(
        &state.store,
        &req.virtual_storage,
        &req.relative_path,
        &req.authoritative_storage,
    )
    .map(Json)
    .map_err(error_response)
}

#[derive(Deserialize)]
struct RemoveRequest {
    virtual_storage: String,
    relative_path: String,
}

async fn admin_remove_repository(
    State(state): State<AdminState>,
    Json(req): Json<RemoveRequest>,
) -> Result<Json<ops::track::RemoveResult>, HandlerError> {
    ops::remove_repository(&state.store, &req.virtual_storage, &req.relative_path)
        .map(Json)
        .map_err(error_response)
}

#[derive(Deserialize)]
struct AcceptRequest {
    virtual_storage: String,
    relative_path: String,
    authoritative_storage: String,
}

async fn admin_accept_dataloss(
    State(state): State<AdminState>,
    Json(req): Json<AcceptRequest>,
) -> Result<Json<ops::track::AcceptResult>, HandlerError> {
    ops::accept_dataloss(
        &state.store,
        &req.virtual_storage,
        &req.relative_path,
        &req.authoritative_storage,
    )
    .map(Json)
    .map_err(error_response)
}
