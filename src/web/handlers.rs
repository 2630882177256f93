//! HTTP request handlers.

use super::AppState;
use crate::config::MonitorSettings;
use crate::db::{DbError, MonitoredEndpoint};
use crate::monitor::EntityMonitorState;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;

// ============================================================================
// Health & status
// ============================================================================

pub async fn handle_health() -> impl IntoResponse {
    "ok"
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub tracked: usize,
    pub tick_interval_secs: Option<u64>,
    pub ticks_started: u64,
    pub ticks_skipped: u64,
    pub entities: Vec<EntityMonitorState>,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.scheduler.stats();
    let entities = state.monitor.states();

    Json(StatusResponse {
        tracked: state.monitor.len(),
        tick_interval_secs: state.scheduler.current_interval().await.map(|d| d.as_secs()),
        ticks_started: stats.ticks_started.load(Ordering::Relaxed),
        ticks_skipped: stats.ticks_skipped.load(Ordering::Relaxed),
        entities,
    })
}

pub async fn handle_entity_status(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> impl IntoResponse {
    match state.monitor.get(&entity_id) {
        Some(entity) => Json(entity).into_response(),
        None => (StatusCode::NOT_FOUND, "No state for entity").into_response(),
    }
}

// ============================================================================
// API: Endpoints
// ============================================================================

pub async fn handle_get_endpoints(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_endpoints() {
        Ok(endpoints) => Json(endpoints).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_get_endpoint(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_endpoint(&entity_id) {
        Ok(endpoint) => Json(endpoint).into_response(),
        Err(DbError::NotFound) => (StatusCode::NOT_FOUND, "Endpoint not found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct EndpointRequest {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

pub async fn handle_put_endpoint(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    Json(req): Json<EndpointRequest>,
) -> impl IntoResponse {
    if entity_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Empty entity id").into_response();
    }
    if req.port == Some(0) {
        return (StatusCode::BAD_REQUEST, "Invalid port").into_response();
    }

    let endpoint = MonitoredEndpoint {
        entity_id,
        host: req.host.trim().to_string(),
        port: req.port.unwrap_or(80),
        enabled: req.enabled.unwrap_or(true),
    };

    if let Err(e) = state.store.upsert_endpoint(&endpoint) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    // Monitoring switched off: the entity's state goes with it
    if endpoint.is_probeable() {
        state.monitor.resume(&endpoint.entity_id);
    } else if let Err(e) = state.monitor.forget(&endpoint.entity_id).await {
        tracing::error!("Failed to drop state for {}: {}", endpoint.entity_id, e);
    }

    Json(endpoint).into_response()
}

pub async fn handle_delete_endpoint(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_endpoint(&entity_id) {
        Ok(()) => {}
        Err(DbError::NotFound) => return (StatusCode::NOT_FOUND, "Endpoint not found").into_response(),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }

    if let Err(e) = state.monitor.forget(&entity_id).await {
        tracing::error!("Failed to drop state for {}: {}", entity_id, e);
    }

    StatusCode::NO_CONTENT.into_response()
}

// ============================================================================
// API: Settings
// ============================================================================

pub async fn handle_get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.settings.snapshot())
}

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    #[serde(flatten)]
    pub settings: MonitorSettings,
    pub tick_interval_secs: u64,
}

pub async fn handle_put_settings(
    State(state): State<AppState>,
    Json(settings): Json<MonitorSettings>,
) -> impl IntoResponse {
    if let Err(e) = state.store.save_settings(&settings) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    state.settings.replace(settings);
    tracing::info!("Settings updated: {:?}", settings);

    // The interval is only chosen at scheduler start
    match state.scheduler.restart().await {
        Ok(interval) => Json(SettingsResponse {
            settings,
            tick_interval_secs: interval.as_secs(),
        })
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
