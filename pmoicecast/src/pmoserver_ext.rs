//! Extension pmoserver pour le contrôle d'Icecast
//!
//! `pmoicecast` ajoute ses routes à `pmoserver::Server` via un trait
//! d'extension, sans que pmoserver dépende de pmoicecast.

use crate::controller::IcecastController;
use crate::{api, openapi::ApiDoc};
use pmoserver::Server;
use std::sync::Arc;
use tracing::info;
use utoipa::OpenApi;

/// Trait pour étendre pmoserver avec le contrôle d'Icecast
///
/// # Exemple
///
/// ```rust,ignore
/// use pmoicecast::{IcecastController, IcecastExt};
///
/// let controller = Arc::new(IcecastController::new(settings, os, probe));
/// server.init_icecast(controller.clone()).await;
/// ```
pub trait IcecastExt {
    /// Enregistre les routes `/system/icecast*` et `/icecast/health`
    ///
    /// La documentation est servie sous `/swagger-ui/icecast`.
    async fn init_icecast(&mut self, controller: Arc<IcecastController>);
}

impl IcecastExt for Server {
    async fn init_icecast(&mut self, controller: Arc<IcecastController>) {
        let router = api::create_router(controller);
        self.add_openapi(router, ApiDoc::openapi(), "icecast").await;
        info!("Icecast API registered");
    }
}
