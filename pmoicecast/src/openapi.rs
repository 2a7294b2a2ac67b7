//! Documentation OpenAPI de l'API Icecast

use utoipa::OpenApi;

/// Documentation OpenAPI pour le contrôle du serveur Icecast
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::get_icecast_status,
        crate::api::get_health,
        crate::api::start_icecast,
        crate::api::stop_icecast,
        crate::api::restart_icecast,
        crate::api::validate_config,
        crate::api::security_check,
        crate::api::detect_installation,
    ),
    components(
        schemas(
            crate::api::IcecastStatusResponse,
            crate::api::LifecycleResponse,
            crate::api::SecurityCheckResponse,
            crate::api::ErrorResponse,
            crate::installation::InstallationReport,
            crate::installation::InstallationChecks,
            crate::state::StatusReport,
            crate::state::BroadcastServerState,
            crate::state::HealthReport,
            crate::state::HealthChecks,
            crate::state::HealthLevel,
            crate::state::ServerPhase,
            crate::probe::ServerStats,
            crate::probe::MountStats,
            crate::validation::ValidationReport,
            crate::validation::SecurityFinding,
            crate::validation::FindingSeverity,
        )
    ),
    tags(
        (name = "icecast", description = "Supervision du serveur de diffusion Icecast")
    ),
    info(
        title = "PMOCast Icecast API",
        version = "0.1.0",
        description = r#"
# Contrôle du serveur Icecast local

- **Détection** : recherche de l'installation (exécutable sous `bin/`, lanceur, `icecast.xml`, répertoire de logs)
- **État** : fusion de trois signaux (processus, port TCP, page `/status-json.xsl`)
- **Cycle de vie** : démarrage, arrêt et redémarrage vérifiés par interrogation périodique
- **Configuration** : erreurs bloquantes et avertissements, audit des mots de passe par défaut

Un serveur n'est considéré comme démarré que si le processus existe **et** que son port répond.
        "#,
        license(
            name = "MIT",
        ),
    )
)]
pub struct ApiDoc;
