//! # Module Server - high level API over Axum
//!
//! Composes the routers contributed by the other crates, serves them, and
//! owns the shutdown signal shared with the background loops.
//!
//! - JSON routes with `add_route()`
//! - sub-routers with `add_router()`
//! - documented APIs (OpenAPI + Swagger UI) with `add_openapi()`
//! - log endpoints with `init_logging()`
//! - graceful shutdown on Ctrl+C

use crate::logs::{LogState, LogsApiDoc, create_logs_router, init_logging};
use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Json, Router};
use pmoconfig::Config;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{signal, sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Serializable server description
#[derive(Clone, Serialize, utoipa::ToSchema)]
pub struct ServerInfo {
    pub name: String,
    pub base_url: String,
    pub http_port: u16,
}

/// Main HTTP server
pub struct Server {
    name: String,
    base_url: String,
    http_port: u16,
    router: Arc<RwLock<Router>>,
    join_handle: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Server {
    /// Creates a new server instance
    ///
    /// # Arguments
    ///
    /// * `name` - Server name (for logs)
    /// * `base_url` - Advertised host (e.g. "192.168.1.20")
    /// * `http_port` - HTTP port to listen on
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, http_port: u16) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            http_port,
            router: Arc::new(RwLock::new(Router::new())),
            join_handle: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn new_configured(config: &Config) -> Self {
        Self::new("PMOCast", config.get_base_url(), config.get_http_port())
    }

    /// Adds a dynamic JSON GET route
    ///
    /// ```rust,no_run
    /// # use pmoserver::Server;
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let mut server = Server::new("Test", "localhost", 3000);
    /// server.add_route("/info", || async {
    ///     serde_json::json!({"version": "1.0.0"})
    /// }).await;
    /// # }
    /// ```
    pub async fn add_route<F, Fut, T>(&mut self, path: &str, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        let handler = move || {
            let f = f.clone();
            async move { Json(f().await) }
        };

        let mut r = self.router.write().await;
        *r = std::mem::take(&mut *r).route(path, get(handler));
    }

    /// Adds a sub-router
    ///
    /// - `path == "/"` merges the router at the root
    /// - otherwise the router is nested under `path`
    pub async fn add_router(&mut self, path: &str, sub_router: Router) {
        let mut r = self.router.write().await;
        *r = if path == "/" {
            std::mem::take(&mut *r).merge(sub_router)
        } else {
            let normalized = format!("/{}", path.trim_matches('/'));
            std::mem::take(&mut *r).nest(&normalized, sub_router)
        };
    }

    /// Adds a documented API
    ///
    /// The router is merged at the root as-is; the documentation is served at
    /// `/swagger-ui/{name}` and the raw document at `/api-docs/{name}.json`.
    pub async fn add_openapi(
        &mut self,
        api_router: Router,
        openapi: utoipa::openapi::OpenApi,
        name: &str,
    ) {
        let swagger_path: &'static str =
            Box::leak(format!("/swagger-ui/{}", name).into_boxed_str());
        let openapi_json_path: &'static str =
            Box::leak(format!("/api-docs/{}.json", name).into_boxed_str());
        let swagger = SwaggerUi::new(swagger_path).url(openapi_json_path, openapi);

        let mut r = self.router.write().await;
        *r = std::mem::take(&mut *r).merge(api_router).merge(swagger);
    }

    /// Installs the tracing subscriber and registers the log routes
    ///
    /// Registers `/log-sse`, `/log-dump` and `/api/log_setup`.
    pub async fn init_logging(&mut self, config: &Config) -> LogState {
        let log_state = init_logging(config);
        self.add_openapi(
            create_logs_router(log_state.clone()),
            LogsApiDoc::openapi(),
            "logs",
        )
        .await;
        log_state
    }

    /// Token cancelled when the server shuts down
    ///
    /// Background loops select on it to stop together with the server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Snapshot of the composed router
    pub async fn router(&self) -> Router {
        self.router.read().await.clone()
    }

    /// Starts the HTTP server
    ///
    /// Binds the configured port and serves until Ctrl+C or until the
    /// shutdown token is cancelled.
    pub async fn start(&mut self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.http_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTP port {}", self.http_port))?;

        info!(
            "Server {} running at http://{}:{}",
            self.name, self.base_url, self.http_port
        );

        let router = self.router.read().await.clone();
        let shutdown = self.shutdown.clone();

        let ctrl_c_token = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = signal::ctrl_c() => {
                    match result {
                        Ok(()) => info!("Ctrl+C received, shutting down"),
                        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
                    }
                    ctrl_c_token.cancel();
                }
                _ = ctrl_c_token.cancelled() => {}
            }
        });

        self.join_handle = Some(tokio::spawn(async move {
            let graceful = shutdown.clone();
            if let Err(e) = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async move { graceful.cancelled().await })
                .await
            {
                error!("HTTP server error: {}", e);
            }
            shutdown.cancel();
        }));

        Ok(())
    }

    /// Waits for the server to stop
    pub async fn wait(&mut self) {
        if let Some(h) = self.join_handle.take() {
            let _ = h.await;
        }
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            name: self.name.clone(),
            base_url: self.base_url.clone(),
            http_port: self.http_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_add_route_serves_json() {
        let mut server = Server::new("Test", "localhost", 0);
        server
            .add_route("/info", || async { serde_json::json!({"version": "1.0.0"}) })
            .await;

        let (status, json) = get_json(server.router().await, "/info").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["version"], "1.0.0");
    }

    #[tokio::test]
    async fn test_add_router_nests_under_path() {
        let mut server = Server::new("Test", "localhost", 0);
        let sub = Router::new().route("/ping", get(|| async { Json("pong") }));
        server.add_router("/api/", sub).await;

        let (status, json) = get_json(server.router().await, "/api/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, "pong");
    }

    #[tokio::test]
    async fn test_shutdown_token_is_shared() {
        let server = Server::new("Test", "localhost", 0);
        let token = server.shutdown_token();
        assert!(!token.is_cancelled());
        server.shutdown_token().cancel();
        assert!(token.is_cancelled());
    }
}
