//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::monitor::Monitor;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, patch, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Store,
    pub monitor: Arc<Monitor>,
}

/// JSON API server for pingwarden.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, store: Store, monitor: Arc<Monitor>) -> Self {
        Self {
            state: AppState {
                config,
                store,
                monitor,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/targets", post(handlers::handle_create_target))
            .route("/targets", get(handlers::handle_list_targets))
            .route("/targets/{id}", patch(handlers::handle_update_target))
            .route("/targets/{id}", delete(handlers::handle_delete_target))
            .route("/targets/{id}/pause", post(handlers::handle_pause_target))
            .route("/targets/{id}/resume", post(handlers::handle_resume_target))
            .route("/targets/{id}/logs", get(handlers::handle_get_logs))
            .route("/targets/{id}/events", get(handlers::handle_get_events))
            .route("/targets/{id}/insights", get(handlers::handle_get_insights))
            .route("/targets/{id}/traceroute", post(handlers::handle_traceroute))
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server and run until the shutdown future resolves.
    pub async fn start<F>(
        &self,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("API server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
