//! Web server module.
//!
//! A small JSON API for diagnostics and for the owner/config side to push
//! endpoint and settings changes.

mod handlers;

pub use handlers::*;

use crate::config::{ServerConfig, SharedSettings};
use crate::db::Store;
use crate::monitor::Monitor;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::get,
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub monitor: Arc<Monitor>,
    pub scheduler: Arc<Scheduler>,
    pub settings: SharedSettings,
}

/// Web server for powerwatch.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/healthz", get(handlers::handle_health))
            .route("/api/status", get(handlers::handle_status))
            .route("/api/status/{entity_id}", get(handlers::handle_entity_status))
            .route("/api/endpoints", get(handlers::handle_get_endpoints))
            .route(
                "/api/endpoints/{entity_id}",
                get(handlers::handle_get_endpoint)
                    .put(handlers::handle_put_endpoint)
                    .delete(handlers::handle_delete_endpoint),
            )
            .route(
                "/api/settings",
                get(handlers::handle_get_settings).put(handlers::handle_put_settings),
            )
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Status API listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
