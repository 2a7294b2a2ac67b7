//! Endpoints API REST du serveur Icecast
//!
//! Handlers HTTP exposant le contrôleur : état, santé, cycle de vie,
//! validation de la configuration et audit de sécurité.

use crate::controller::IcecastController;
use crate::error::IcecastError;
use crate::installation::InstallationReport;
use crate::state::{BroadcastServerState, HealthReport, StatusReport};
use crate::validation::{FindingSeverity, SecurityFinding, ValidationReport};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use utoipa::ToSchema;

// ============ Gestion des erreurs ============

/// Corps JSON des réponses d'erreur
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
}

/// Statut HTTP associé à une erreur du contrôleur
pub fn status_for(err: &IcecastError) -> StatusCode {
    match err {
        IcecastError::InstallationNotFound { .. } => StatusCode::SERVICE_UNAVAILABLE,
        IcecastError::ConfigInvalid { .. }
        | IcecastError::ConfigWarning { .. }
        | IcecastError::ConfigParse { .. } => StatusCode::BAD_REQUEST,
        IcecastError::PortConflict { .. } | IcecastError::Cancelled { .. } => StatusCode::CONFLICT,
        IcecastError::VerificationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        IcecastError::Launch(_) | IcecastError::ServiceControl(_) | IcecastError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Corps JSON d'une erreur du contrôleur, détails compris
pub fn error_body(err: &IcecastError) -> serde_json::Value {
    let mut body = json!({
        "success": false,
        "error": err.to_string(),
        "code": err.code(),
    });
    match err {
        IcecastError::ConfigInvalid { errors } => body["errors"] = json!(errors),
        IcecastError::ConfigWarning { warnings } => body["warnings"] = json!(warnings),
        IcecastError::PortConflict { port, holder } => {
            body["port"] = json!(port);
            body["holder"] = json!(holder);
        }
        IcecastError::VerificationTimeout { operation, timeout } => {
            body["operation"] = json!(operation);
            body["timeoutMs"] = json!(timeout.as_millis() as u64);
        }
        IcecastError::InstallationNotFound { searched } => {
            body["searched"] = json!(
                searched
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
            );
        }
        _ => {}
    }
    body
}

pub struct AppError(pub IcecastError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (status_for(&self.0), Json(error_body(&self.0))).into_response()
    }
}

impl From<IcecastError> for AppError {
    fn from(err: IcecastError) -> Self {
        Self(err)
    }
}

// ============ Réponses ============

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IcecastStatusResponse {
    pub installation: InstallationReport,
    pub status: StatusReport,
    pub state: BroadcastServerState,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleResponse {
    pub success: bool,
    pub message: String,
    pub status: StatusReport,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecurityCheckResponse {
    pub count: usize,
    pub highest_severity: Option<FindingSeverity>,
    pub findings: Vec<SecurityFinding>,
}

/// Crée le router de l'API Icecast
pub fn create_router(controller: Arc<IcecastController>) -> Router {
    Router::new()
        .route("/system/icecast-status", get(get_icecast_status))
        .route("/icecast/health", get(get_health))
        .route("/system/icecast/start", post(start_icecast))
        .route("/system/icecast/stop", post(stop_icecast))
        .route("/system/icecast/restart", post(restart_icecast))
        .route("/system/icecast/validate-config", get(validate_config))
        .route("/system/icecast/security-check", get(security_check))
        .route("/system/icecast/detect", get(detect_installation))
        .with_state(controller)
}

// ============================================================================
// Route Handlers
// ============================================================================

/// État fusionné processus/port/page d'administration et installation
#[utoipa::path(
    get,
    path = "/system/icecast-status",
    responses((status = 200, description = "Icecast status", body = IcecastStatusResponse)),
    tag = "icecast"
)]
pub async fn get_icecast_status(
    State(controller): State<Arc<IcecastController>>,
) -> Json<IcecastStatusResponse> {
    let status = controller.get_status().await;
    Json(IcecastStatusResponse {
        installation: controller.installation().await,
        status,
        state: controller.snapshot().await,
    })
}

/// Niveau de santé et contrôles individuels
#[utoipa::path(
    get,
    path = "/icecast/health",
    responses((status = 200, description = "Health classification", body = HealthReport)),
    tag = "icecast"
)]
pub async fn get_health(State(controller): State<Arc<IcecastController>>) -> Json<HealthReport> {
    Json(controller.get_health_status().await)
}

/// Démarre Icecast et attend la confirmation
#[utoipa::path(
    post,
    path = "/system/icecast/start",
    responses(
        (status = 200, description = "Server running", body = LifecycleResponse),
        (status = 400, description = "Invalid configuration", body = ErrorResponse),
        (status = 409, description = "Port held by another process", body = ErrorResponse),
        (status = 503, description = "Icecast not installed", body = ErrorResponse),
        (status = 504, description = "Start not confirmed in time", body = ErrorResponse)
    ),
    tag = "icecast"
)]
pub async fn start_icecast(
    State(controller): State<Arc<IcecastController>>,
) -> Result<Json<LifecycleResponse>, AppError> {
    let status = controller.start().await?;
    Ok(Json(LifecycleResponse {
        success: true,
        message: "Icecast is running".to_string(),
        status,
    }))
}

/// Arrête Icecast et attend la disparition du processus
#[utoipa::path(
    post,
    path = "/system/icecast/stop",
    responses(
        (status = 200, description = "Server stopped", body = LifecycleResponse),
        (status = 504, description = "Stop not confirmed in time", body = ErrorResponse)
    ),
    tag = "icecast"
)]
pub async fn stop_icecast(
    State(controller): State<Arc<IcecastController>>,
) -> Result<Json<LifecycleResponse>, AppError> {
    let status = controller.stop().await?;
    Ok(Json(LifecycleResponse {
        success: true,
        message: "Icecast is stopped".to_string(),
        status,
    }))
}

/// Redémarre Icecast (arrêt puis démarrage)
#[utoipa::path(
    post,
    path = "/system/icecast/restart",
    responses(
        (status = 200, description = "Server restarted", body = LifecycleResponse),
        (status = 504, description = "Restart not confirmed in time", body = ErrorResponse)
    ),
    tag = "icecast"
)]
pub async fn restart_icecast(
    State(controller): State<Arc<IcecastController>>,
) -> Result<Json<LifecycleResponse>, AppError> {
    let status = controller.restart().await?;
    Ok(Json(LifecycleResponse {
        success: true,
        message: "Icecast restarted".to_string(),
        status,
    }))
}

/// Valide icecast.xml (erreurs bloquantes et avertissements)
#[utoipa::path(
    get,
    path = "/system/icecast/validate-config",
    responses((status = 200, description = "Validation report", body = ValidationReport)),
    tag = "icecast"
)]
pub async fn validate_config(
    State(controller): State<Arc<IcecastController>>,
) -> Json<ValidationReport> {
    Json(controller.validate_configuration().await)
}

/// Audit de sécurité de la configuration
#[utoipa::path(
    get,
    path = "/system/icecast/security-check",
    responses((status = 200, description = "Security findings", body = SecurityCheckResponse)),
    tag = "icecast"
)]
pub async fn security_check(
    State(controller): State<Arc<IcecastController>>,
) -> Json<SecurityCheckResponse> {
    let findings = controller.check_security_vulnerabilities().await;
    Json(SecurityCheckResponse {
        count: findings.len(),
        highest_severity: findings.iter().map(|f| f.severity).max(),
        findings,
    })
}

/// Relance la détection de l'installation
#[utoipa::path(
    get,
    path = "/system/icecast/detect",
    responses((status = 200, description = "Installation report", body = InstallationReport)),
    tag = "icecast"
)]
pub async fn detect_installation(
    State(controller): State<Arc<IcecastController>>,
) -> Json<InstallationReport> {
    Json(controller.detect_installation().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        let missing = IcecastError::InstallationNotFound { searched: vec![] };
        assert_eq!(status_for(&missing), StatusCode::SERVICE_UNAVAILABLE);

        let timeout = IcecastError::VerificationTimeout {
            operation: "start",
            timeout: Duration::from_secs(8),
        };
        assert_eq!(status_for(&timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(error_body(&timeout)["timeoutMs"], 8000);
    }

    #[test]
    fn test_error_body_details() {
        let err = IcecastError::PortConflict {
            port: 8000,
            holder: Some("nginx (pid 7)".to_string()),
        };
        let body = error_body(&err);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "PORT_CONFLICT");
        assert_eq!(body["port"], 8000);

        let err = IcecastError::InstallationNotFound {
            searched: vec![PathBuf::from("/opt/icecast")],
        };
        assert_eq!(error_body(&err)["searched"][0], "/opt/icecast");
    }
}
