pub mod schedules;

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use dealscout_common::DealScoutError;
use dealscout_ingest::GroupSpec;

use crate::AppState;

// --- Request/query structs ---

#[derive(Deserialize)]
pub struct StartScrapeRequest {
    pub start_urls: Vec<String>,
    pub worker_count: Option<usize>,
    pub concurrency: Option<usize>,
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub newest_first: bool,
}

#[derive(Deserialize)]
pub struct GroupsQuery {
    limit: Option<usize>,
}

// --- Handlers ---

pub async fn start_group(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartScrapeRequest>,
) -> impl IntoResponse {
    let spec = GroupSpec::builder()
        .start_urls(body.start_urls)
        .worker_count(body.worker_count.unwrap_or(state.config.default_worker_count))
        .concurrency(body.concurrency.unwrap_or(state.config.default_concurrency))
        .max_pages(body.max_pages)
        .newest_first(body.newest_first)
        .build();

    match state.pool.start(spec) {
        Ok(group_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "group_id": group_id })),
        )
            .into_response(),
        Err(DealScoutError::Validation(msg)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": msg })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to start scrape group");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn list_groups(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GroupsQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(20).min(100);
    let groups = state.tracker.list(limit);
    Json(serde_json::json!({ "groups": groups })).into_response()
}

pub async fn get_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let uuid = match Uuid::parse_str(&id) {
        Ok(u) => u,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    match state.tracker.get(uuid) {
        Some(snapshot) => Json(serde_json::json!({ "group": snapshot })).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn stop_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let uuid = match Uuid::parse_str(&id) {
        Ok(u) => u,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    match state.tracker.stop(uuid) {
        Ok(()) => Json(serde_json::json!({ "stopped": true })).into_response(),
        Err(DealScoutError::GroupNotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to stop group");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
