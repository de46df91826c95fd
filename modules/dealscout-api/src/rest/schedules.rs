use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use dealscout_common::{DealScoutError, ScheduleDraft};

use crate::AppState;

#[derive(Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

pub async fn list_schedules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.schedules.list().await {
        Ok(schedules) => Json(serde_json::json!({ "schedules": schedules })).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to list schedules");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<ScheduleDraft>,
) -> impl IntoResponse {
    match state.schedules.create(draft, Utc::now()).await {
        Ok(schedule) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "schedule": schedule })),
        )
            .into_response(),
        Err(DealScoutError::Validation(msg)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": msg })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to create schedule");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let uuid = match Uuid::parse_str(&id) {
        Ok(u) => u,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    match state.schedules.get(uuid).await {
        Ok(schedule) => Json(serde_json::json!({ "schedule": schedule })).into_response(),
        Err(DealScoutError::ScheduleNotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to load schedule");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let uuid = match Uuid::parse_str(&id) {
        Ok(u) => u,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    match state.schedules.delete(uuid).await {
        Ok(true) => Json(serde_json::json!({ "deleted": true })).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to delete schedule");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn toggle_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ToggleRequest>,
) -> impl IntoResponse {
    let uuid = match Uuid::parse_str(&id) {
        Ok(u) => u,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    match state.schedules.set_enabled(uuid, body.enabled).await {
        Ok(schedule) => Json(serde_json::json!({ "schedule": schedule })).into_response(),
        Err(DealScoutError::ScheduleNotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to toggle schedule");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn run_schedule_now(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let uuid = match Uuid::parse_str(&id) {
        Ok(u) => u,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    match state.schedules.run_now(uuid, Utc::now()).await {
        Ok(group_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "group_id": group_id })),
        )
            .into_response(),
        Err(DealScoutError::ScheduleBusy) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "Scrape already in progress for this schedule" })),
        )
            .into_response(),
        Err(DealScoutError::ScheduleNotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to run schedule");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
