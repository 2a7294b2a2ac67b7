use pmoconfig::Config;
use pmoicecast::{IcecastConfigExt, IcecastController, IcecastExt, ReqwestProbe};
use pmoserver::Server;
use pmostreams::{StreamOrchestrator, StreamsConfigExt, StreamsExt};
use pmoutils::SystemOsAdapter;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ========== PHASE 1 : Configuration et journalisation ==========

    let config = Arc::new(Config::load_config("")?);
    let mut server = Server::new_configured(&config);
    server.init_logging(&config).await;

    server
        .add_route("/info", || async {
            serde_json::json!({"name": "PMOCast", "version": env!("CARGO_PKG_VERSION")})
        })
        .await;

    // ========== PHASE 2 : Contrôleur Icecast et orchestrateur ==========

    let os = Arc::new(SystemOsAdapter::default());
    let controller = Arc::new(IcecastController::new(
        config.get_icecast_settings(),
        os.clone(),
        Arc::new(ReqwestProbe::new()),
    ));

    let installation = controller.installation().await;
    if installation.installed {
        info!(
            "🎙️ Icecast installation found at {:?}",
            installation.installation_path
        );
    } else {
        warn!("⚠️ No Icecast installation found, streams cannot be started");
    }

    info!("📡 Loading stream registry...");
    let orchestrator =
        StreamOrchestrator::open(config.get_stream_settings()?, controller.clone(), os).await?;
    let stats = orchestrator.get_stats().await;
    info!(
        "✅ {} stream(s) registered, {} running",
        stats.total, stats.running
    );

    let shutdown = server.shutdown_token();
    tokio::spawn(controller.clone().run_health_loop(shutdown.clone()));
    tokio::spawn(orchestrator.clone().run_supervision(shutdown));

    server.init_icecast(controller).await;
    server.init_streams(orchestrator.clone()).await;

    // ========== PHASE 3 : Démarrage du serveur ==========

    info!("🌐 Starting HTTP server...");
    server.start().await?;

    info!("✅ PMOCast is ready!");
    info!("Press Ctrl+C to stop...");
    server.wait().await;

    info!("🛑 Stopping streams...");
    let report = orchestrator.shutdown().await;
    info!(
        "✅ {} stream(s) stopped, {} failure(s)",
        report.succeeded, report.failed
    );

    Ok(())
}
