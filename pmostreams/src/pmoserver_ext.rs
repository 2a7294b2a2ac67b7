//! Extension pmoserver pour l'orchestration des flux

use crate::api::{self, StreamsState};
use crate::openapi::ApiDoc;
use crate::orchestrator::StreamOrchestrator;
use pmoserver::Server;
use std::sync::Arc;
use tracing::info;
use utoipa::OpenApi;

/// Trait pour étendre pmoserver avec les routes `/streams/*`
///
/// # Exemple
///
/// ```rust,ignore
/// use pmostreams::{StreamOrchestrator, StreamsExt};
///
/// let orchestrator = StreamOrchestrator::open(settings, controller, os).await?;
/// server.init_streams(orchestrator.clone()).await;
/// ```
pub trait StreamsExt {
    /// Enregistre les routes des flux et `/system/config`
    ///
    /// La documentation est servie sous `/swagger-ui/streams`.
    async fn init_streams(&mut self, orchestrator: Arc<StreamOrchestrator>);
}

impl StreamsExt for Server {
    async fn init_streams(&mut self, orchestrator: Arc<StreamOrchestrator>) {
        let info = self.info();
        let state = StreamsState {
            orchestrator,
            base_url: format!("http://{}:{}", info.base_url, info.http_port),
        };
        self.add_openapi(api::create_router(state), ApiDoc::openapi(), "streams")
            .await;
        info!("Streams API registered");
    }
}
