//! Control Surface HTTP handlers (spec §4.6).

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{AgentError, Result};
use crate::registry::UpdateState;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub monitored_count: usize,
    pub last_check_at: Option<chrono::DateTime<Utc>>,
    pub update_history_count: usize,
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.registry.snapshot();
    let last_check_at = snapshot.iter().map(|r| r.update_state_changed_at).max();

    Json(StatusResponse {
        status: "running",
        monitored_count: state.registry.len(),
        last_check_at,
        update_history_count: state.updater.history(usize::MAX).len(),
    })
}

pub async fn list_containers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "containers": state.registry.snapshot() }))
}

pub async fn get_container(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let record = state.registry.get(&id).ok_or_else(|| AgentError::NotFound(id.clone()))?;
    Ok(Json(json!(record)))
}

fn reject_if_updating(state: &AppState, id: &str) -> Result<()> {
    match state.registry.get(id) {
        Some(r) if r.update_state == UpdateState::Updating => {
            Err(AgentError::Conflict(format!("update in flight for {id}")))
        }
        Some(_) => Ok(()),
        None => Err(AgentError::NotFound(id.to_string())),
    }
}

pub async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>)> {
    reject_if_updating(&state, &id)?;
    state.runtime.start(&id).await.map_err(AgentError::from)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": true }))))
}

pub async fn stop_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>)> {
    reject_if_updating(&state, &id)?;
    state.runtime.stop(&id, Duration::from_secs(10)).await.map_err(AgentError::from)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": true }))))
}

pub async fn restart_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>)> {
    reject_if_updating(&state, &id)?;
    state.runtime.stop(&id, Duration::from_secs(10)).await.map_err(AgentError::from)?;
    state.runtime.start(&id).await.map_err(AgentError::from)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": true }))))
}

pub async fn remove_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>)> {
    reject_if_updating(&state, &id)?;
    state.runtime.remove(&id, true).await.map_err(AgentError::from)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": true }))))
}

pub async fn update_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>)> {
    state.updater.request_update(&id).await.map_err(AgentError::from)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": true }))))
}

#[derive(Debug, Deserialize)]
pub struct UpdatesQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn update_history(State(state): State<AppState>, Query(query): Query<UpdatesQuery>) -> Json<Value> {
    Json(json!({ "updates": state.updater.history(query.limit) }))
}

pub async fn check_updates(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let updater = state.updater.clone();
    tokio::spawn(async move { updater.force_check_sweep().await });
    (StatusCode::ACCEPTED, Json(json!({ "accepted": true })))
}

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot();
    let mut by_status = std::collections::HashMap::new();
    let mut by_update_state = std::collections::HashMap::new();
    for record in &snapshot {
        *by_status.entry(record.status.to_string()).or_insert(0usize) += 1;
        *by_update_state.entry(format!("{:?}", record.update_state)).or_insert(0usize) += 1;
    }

    Json(json!({
        "total_containers": snapshot.len(),
        "by_status": by_status,
        "by_update_state": by_update_state,
        "event_subscribers": state.events.subscriber_count(),
        "event_sequence": state.events.current_sequence(),
    }))
}

pub async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!(*state.config.read()))
}

pub async fn put_config(State(state): State<AppState>, Json(next): Json<crate::config::AgentConfiguration>) -> Result<Json<Value>> {
    next.validate()?;
    *state.config.write() = next.clone();
    Ok(Json(json!(next)))
}

pub async fn list_images(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot();
    let mut images: Vec<Value> = snapshot
        .iter()
        .map(|r| json!({ "image_ref": r.image_ref, "image_digest": r.image_digest }))
        .collect();
    images.sort_by(|a, b| a["image_ref"].as_str().cmp(&b["image_ref"].as_str()));
    images.dedup();
    Json(json!({ "images": images }))
}

pub async fn pull_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<Value>)> {
    let digest = state.runtime.pull(&name).await.map_err(AgentError::from)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": true, "image_ref": name, "digest": digest }))))
}
