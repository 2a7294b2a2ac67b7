//! Documentation OpenAPI de l'API des flux

use utoipa::OpenApi;

/// Documentation OpenAPI pour l'orchestration des flux
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::start_stream,
        crate::api::stop_stream,
        crate::api::restart_stream,
        crate::api::update_stream,
        crate::api::delete_stream,
        crate::api::stop_all_streams,
        crate::api::start_all_streams,
        crate::api::get_streams_status,
        crate::api::reorder_streams,
        crate::api::get_stream,
        crate::api::get_stream_log,
        crate::api::get_system_config,
    ),
    components(
        schemas(
            crate::api::StreamIdRequest,
            crate::api::UpdateStreamRequest,
            crate::api::ReorderRequest,
            crate::api::ErrorResponse,
            crate::api::StartStreamResponse,
            crate::api::StreamResponse,
            crate::api::UpdateStreamResponse,
            crate::api::StopAllResponse,
            crate::api::StartAllResponse,
            crate::api::ReorderResponse,
            crate::api::StreamLogResponse,
            crate::api::IcecastCapacity,
            crate::api::ControlPlaneInfo,
            crate::api::SystemConfigResponse,
            crate::model::StreamConfig,
            crate::model::StreamRecord,
            crate::model::StreamStatus,
            crate::orchestrator::StreamStats,
            crate::orchestrator::BulkItem,
            crate::orchestrator::BulkOutcome,
            crate::diagnostics::DiagnosisResult,
            crate::diagnostics::DiagnosisCategory,
            crate::diagnostics::DiagnosisSeverity,
        )
    ),
    tags(
        (name = "streams", description = "Orchestration des flux audio vers Icecast")
    ),
    info(
        title = "PMOCast Streams API",
        version = "0.1.0",
        description = r#"
# Orchestration des flux

Chaque flux associe un périphérique de capture à un point de montage Icecast.
Un worker (ffmpeg par défaut) capture, encode et pousse l'audio.

- **Démarrage** : validation, contrôle de capacité (`sources` d'icecast.xml), lancement puis fenêtre de confirmation
- **Échecs** : code de sortie et stderr classés en diagnostic (`connection`, `authentication`, `device`, ...)
- **Persistance** : registre JSON écrit atomiquement à chaque modification
- **Aucun redémarrage automatique** : un flux en erreur attend une action de l'opérateur
        "#,
        license(
            name = "MIT",
        ),
    )
)]
pub struct ApiDoc;
