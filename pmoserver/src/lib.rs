//! # pmoserver - HTTP host of the PMOCast control plane
//!
//! A thin layer over Axum that the other crates plug their routers into.
//!
//! - [`server`]: the server and its router composition helpers
//! - [`logs`]: tracing initialisation, in-memory log buffer and SSE stream
//!
//! ## Example
//!
//! ```rust,no_run
//! use pmoconfig::Config;
//! use pmoserver::Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_config("")?;
//!     let mut server = Server::new_configured(&config);
//!     server.init_logging(&config).await;
//!
//!     server.add_route("/info", || async {
//!         serde_json::json!({"status": "ok"})
//!     }).await;
//!
//!     server.start().await?;
//!     server.wait().await;
//!     Ok(())
//! }
//! ```

pub mod logs;
pub mod server;

pub use logs::{LogState, SseLayer, log_dump, log_sse};
pub use server::{Server, ServerInfo};
