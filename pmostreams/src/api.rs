//! Endpoints API REST des flux
//!
//! Handlers HTTP exposant l'orchestrateur : création et cycle de vie des
//! flux, opérations groupées, ordre d'affichage, journal des workers et
//! instantané de capacité du serveur Icecast.

use crate::capacity::CapacitySnapshot;
use crate::diagnostics::DiagnosisResult;
use crate::error::StreamError;
use crate::model::{StreamConfig, StreamPatch, StreamRecord, StreamStatus};
use crate::orchestrator::{BulkItem, BulkReport, StreamOrchestrator, StreamStats};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use utoipa::ToSchema;

/// État partagé des handlers
#[derive(Clone)]
pub struct StreamsState {
    pub orchestrator: Arc<StreamOrchestrator>,
    /// URL de base annoncée par le serveur HTTP
    pub base_url: String,
}

// ============ Gestion des erreurs ============

/// Statut HTTP associé à une erreur de l'orchestrateur
pub fn status_for(err: &StreamError) -> StatusCode {
    match err {
        StreamError::Validation(_) => StatusCode::BAD_REQUEST,
        StreamError::NotFound(_) => StatusCode::NOT_FOUND,
        StreamError::DuplicateStreamId { .. }
        | StreamError::Busy { .. }
        | StreamError::CapacityExceeded { .. }
        | StreamError::Cancelled { .. } => StatusCode::CONFLICT,
        StreamError::VerificationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        StreamError::Icecast(e) => pmoicecast::api::status_for(e),
        StreamError::ProcessSpawnFailure { .. }
        | StreamError::ProcessCrashed { .. }
        | StreamError::Persistence(_)
        | StreamError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Corps JSON d'une erreur, détails compris
pub fn error_body(err: &StreamError) -> serde_json::Value {
    if let StreamError::Icecast(e) = err {
        return pmoicecast::api::error_body(e);
    }

    let mut body = json!({
        "success": false,
        "error": err.to_string(),
        "code": err.code(),
    });
    match err {
        StreamError::CapacityExceeded { limit, active } => {
            body["capacity"] = json!({ "limit": limit, "active": active });
        }
        StreamError::DuplicateStreamId { id, status } | StreamError::Busy { id, status } => {
            body["streamId"] = json!(id);
            body["status"] = json!(status);
        }
        StreamError::ProcessCrashed {
            id,
            exit_code,
            stderr,
            diagnosis,
        } => {
            body["streamId"] = json!(id);
            body["exitCode"] = json!(exit_code);
            body["stderr"] = json!(stderr);
            body["diagnosis"] = json!(diagnosis);
        }
        StreamError::ProcessSpawnFailure { id, diagnosis, .. } => {
            body["streamId"] = json!(id);
            body["diagnosis"] = json!(diagnosis);
        }
        StreamError::VerificationTimeout { id, timeout } => {
            body["streamId"] = json!(id);
            body["timeoutMs"] = json!(timeout.as_millis() as u64);
        }
        StreamError::NotFound(id) => body["streamId"] = json!(id),
        _ => {}
    }
    body
}

pub struct AppError(pub StreamError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (status_for(&self.0), Json(error_body(&self.0))).into_response()
    }
}

impl From<StreamError> for AppError {
    fn from(err: StreamError) -> Self {
        Self(err)
    }
}

// ============ Requêtes ============

#[derive(Debug, Deserialize, ToSchema)]
pub struct StreamIdRequest {
    pub id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStreamRequest {
    pub stream_id: String,
    pub name: Option<String>,
    pub device_id: Option<String>,
    pub bitrate: Option<u32>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReorderRequest {
    pub stream_ids: Vec<String>,
}

// ============ Réponses ============

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamResponse {
    pub success: bool,
    pub stream_id: String,
    pub stream: StreamRecord,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamResponse {
    pub success: bool,
    pub message: String,
    pub stream: StreamRecord,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStreamResponse {
    pub success: bool,
    pub old_id: String,
    pub stream_id: String,
    pub id_changed: bool,
    pub stream: StreamRecord,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StopAllResponse {
    pub success: bool,
    pub stopped: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<BulkItem>,
}

impl From<BulkReport> for StopAllResponse {
    fn from(report: BulkReport) -> Self {
        Self {
            success: report.success(),
            stopped: report.succeeded,
            failed: report.failed,
            skipped: report.skipped,
            results: report.results,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartAllResponse {
    pub success: bool,
    pub started: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<BulkItem>,
}

impl From<BulkReport> for StartAllResponse {
    fn from(report: BulkReport) -> Self {
        Self {
            success: report.success(),
            started: report.succeeded,
            failed: report.failed,
            skipped: report.skipped,
            results: report.results,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReorderResponse {
    pub success: bool,
    pub streams: Vec<StreamRecord>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamLogResponse {
    pub stream_id: String,
    pub status: StreamStatus,
    pub lines: Vec<String>,
    pub diagnosis: Option<DiagnosisResult>,
}

/// Capacité et adresse du serveur Icecast
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IcecastCapacity {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub source_limit: Option<u32>,
    pub active_streams: u32,
    pub remaining: u32,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneInfo {
    pub base_url: String,
    pub os: String,
    /// Adresses IPv4 de l'hôte joignables depuis le LAN
    pub lan_addresses: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfigResponse {
    pub icecast: IcecastCapacity,
    pub server: ControlPlaneInfo,
}

/// Crée le router de l'API des flux
pub fn create_router(state: StreamsState) -> Router {
    Router::new()
        .route("/streams/start", post(start_stream))
        .route("/streams/stop", post(stop_stream))
        .route("/streams/restart", post(restart_stream))
        .route("/streams/update", post(update_stream))
        .route("/streams/delete", post(delete_stream))
        .route("/streams/stop-all", post(stop_all_streams))
        .route("/streams/start-all", post(start_all_streams))
        .route("/streams/status", get(get_streams_status))
        .route("/streams/reorder", post(reorder_streams))
        .route("/streams/{id}", get(get_stream))
        .route("/streams/{id}/log", get(get_stream_log))
        .route("/system/config", get(get_system_config))
        .with_state(state)
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Crée un flux et démarre son worker
#[utoipa::path(
    post,
    path = "/streams/start",
    request_body = StreamConfig,
    responses(
        (status = 200, description = "Stream running", body = StartStreamResponse),
        (status = 400, description = "Invalid name, device or bitrate", body = ErrorResponse),
        (status = 409, description = "Capacity exceeded or duplicate id", body = ErrorResponse),
        (status = 500, description = "Worker failed, with diagnosis", body = ErrorResponse),
        (status = 503, description = "Icecast not installed", body = ErrorResponse)
    ),
    tag = "streams"
)]
pub async fn start_stream(
    State(state): State<StreamsState>,
    Json(config): Json<StreamConfig>,
) -> Result<Json<StartStreamResponse>, AppError> {
    let stream = state.orchestrator.start_stream(config).await?;
    Ok(Json(StartStreamResponse {
        success: true,
        stream_id: stream.id.clone(),
        stream,
    }))
}

/// Arrête un flux (sans erreur s'il est déjà arrêté)
#[utoipa::path(
    post,
    path = "/streams/stop",
    request_body = StreamIdRequest,
    responses(
        (status = 200, description = "Stream stopped", body = StreamResponse),
        (status = 404, description = "Unknown stream", body = ErrorResponse),
        (status = 504, description = "Worker did not exit", body = ErrorResponse)
    ),
    tag = "streams"
)]
pub async fn stop_stream(
    State(state): State<StreamsState>,
    Json(req): Json<StreamIdRequest>,
) -> Result<Json<StreamResponse>, AppError> {
    let stream = state.orchestrator.stop_stream(&req.id).await?;
    Ok(Json(StreamResponse {
        success: true,
        message: "Stream stopped".to_string(),
        stream,
    }))
}

/// Arrête puis redémarre un flux avec sa configuration enregistrée
#[utoipa::path(
    post,
    path = "/streams/restart",
    request_body = StreamIdRequest,
    responses(
        (status = 200, description = "Stream running", body = StreamResponse),
        (status = 404, description = "Unknown stream", body = ErrorResponse),
        (status = 409, description = "Capacity exceeded", body = ErrorResponse),
        (status = 500, description = "Worker failed, with diagnosis", body = ErrorResponse)
    ),
    tag = "streams"
)]
pub async fn restart_stream(
    State(state): State<StreamsState>,
    Json(req): Json<StreamIdRequest>,
) -> Result<Json<StreamResponse>, AppError> {
    let stream = state.orchestrator.restart_stream(&req.id).await?;
    Ok(Json(StreamResponse {
        success: true,
        message: "Stream restarted".to_string(),
        stream,
    }))
}

/// Modifie un flux arrêté ou en erreur
///
/// Un changement de nom ou de périphérique produit un nouvel identifiant.
#[utoipa::path(
    post,
    path = "/streams/update",
    request_body = UpdateStreamRequest,
    responses(
        (status = 200, description = "Stream updated", body = UpdateStreamResponse),
        (status = 400, description = "Invalid values", body = ErrorResponse),
        (status = 404, description = "Unknown stream", body = ErrorResponse),
        (status = 409, description = "Stream is running", body = ErrorResponse)
    ),
    tag = "streams"
)]
pub async fn update_stream(
    State(state): State<StreamsState>,
    Json(req): Json<UpdateStreamRequest>,
) -> Result<Json<UpdateStreamResponse>, AppError> {
    let patch = StreamPatch {
        name: req.name,
        device_id: req.device_id,
        bitrate: req.bitrate,
    };
    let outcome = state.orchestrator.update_stream(&req.stream_id, patch).await?;
    Ok(Json(UpdateStreamResponse {
        success: true,
        id_changed: outcome.id_changed(),
        old_id: outcome.old_id,
        stream_id: outcome.stream.id.clone(),
        stream: outcome.stream,
    }))
}

/// Supprime définitivement un flux (arrêté au préalable)
#[utoipa::path(
    post,
    path = "/streams/delete",
    request_body = StreamIdRequest,
    responses(
        (status = 200, description = "Stream deleted", body = StreamResponse),
        (status = 404, description = "Unknown stream", body = ErrorResponse)
    ),
    tag = "streams"
)]
pub async fn delete_stream(
    State(state): State<StreamsState>,
    Json(req): Json<StreamIdRequest>,
) -> Result<Json<StreamResponse>, AppError> {
    let stream = state.orchestrator.delete_stream(&req.id).await?;
    Ok(Json(StreamResponse {
        success: true,
        message: "Stream deleted".to_string(),
        stream,
    }))
}

/// Arrête tous les flux actifs
#[utoipa::path(
    post,
    path = "/streams/stop-all",
    responses((status = 200, description = "Per-stream results", body = StopAllResponse)),
    tag = "streams"
)]
pub async fn stop_all_streams(State(state): State<StreamsState>) -> Json<StopAllResponse> {
    Json(state.orchestrator.stop_all_streams().await.into())
}

/// Démarre tous les flux arrêtés ou en erreur
#[utoipa::path(
    post,
    path = "/streams/start-all",
    responses((status = 200, description = "Per-stream results", body = StartAllResponse)),
    tag = "streams"
)]
pub async fn start_all_streams(State(state): State<StreamsState>) -> Json<StartAllResponse> {
    Json(state.orchestrator.start_all_stopped_streams().await.into())
}

/// Registre complet et compteurs
#[utoipa::path(
    get,
    path = "/streams/status",
    responses((status = 200, description = "All streams", body = StreamStats)),
    tag = "streams"
)]
pub async fn get_streams_status(State(state): State<StreamsState>) -> Json<StreamStats> {
    Json(state.orchestrator.get_stats().await)
}

/// Enregistre l'ordre d'affichage
#[utoipa::path(
    post,
    path = "/streams/reorder",
    request_body = ReorderRequest,
    responses((status = 200, description = "Streams in their new order", body = ReorderResponse)),
    tag = "streams"
)]
pub async fn reorder_streams(
    State(state): State<StreamsState>,
    Json(req): Json<ReorderRequest>,
) -> Result<Json<ReorderResponse>, AppError> {
    let streams = state.orchestrator.reorder(&req.stream_ids).await?;
    Ok(Json(ReorderResponse {
        success: true,
        streams,
    }))
}

/// Détail d'un flux
#[utoipa::path(
    get,
    path = "/streams/{id}",
    params(("id" = String, Path, description = "Stream id")),
    responses(
        (status = 200, description = "Stream record", body = StreamRecord),
        (status = 404, description = "Unknown stream", body = ErrorResponse)
    ),
    tag = "streams"
)]
pub async fn get_stream(
    State(state): State<StreamsState>,
    Path(id): Path<String>,
) -> Result<Json<StreamRecord>, AppError> {
    Ok(Json(state.orchestrator.get(&id).await?))
}

/// Dernières lignes stderr du worker
#[utoipa::path(
    get,
    path = "/streams/{id}/log",
    params(("id" = String, Path, description = "Stream id")),
    responses(
        (status = 200, description = "Worker stderr tail", body = StreamLogResponse),
        (status = 404, description = "Unknown stream", body = ErrorResponse)
    ),
    tag = "streams"
)]
pub async fn get_stream_log(
    State(state): State<StreamsState>,
    Path(id): Path<String>,
) -> Result<Json<StreamLogResponse>, AppError> {
    let record = state.orchestrator.get(&id).await?;
    let lines = state.orchestrator.worker_log(&id).await?;
    Ok(Json(StreamLogResponse {
        stream_id: record.id,
        status: record.status,
        lines,
        diagnosis: record.diagnosis,
    }))
}

/// Instantané hôte/port/capacité du serveur Icecast
#[utoipa::path(
    get,
    path = "/system/config",
    responses((status = 200, description = "Capacity snapshot", body = SystemConfigResponse)),
    tag = "streams"
)]
pub async fn get_system_config(State(state): State<StreamsState>) -> Json<SystemConfigResponse> {
    let config = state.orchestrator.controller().load_config().await.ok();
    let CapacitySnapshot {
        limit,
        active,
        remaining,
    } = state.orchestrator.capacity_snapshot().await;

    Json(SystemConfigResponse {
        icecast: IcecastCapacity {
            port: config.as_ref().and_then(|c| c.port()),
            host: config.as_ref().map(|c| c.local_host()),
            source_limit: limit,
            active_streams: active,
            remaining,
        },
        server: ControlPlaneInfo {
            base_url: state.base_url.clone(),
            os: pmoutils::get_os_string(),
            lan_addresses: pmoutils::lan_addresses()
                .into_iter()
                .map(|ip| ip.to_string())
                .collect(),
        },
    })
}
