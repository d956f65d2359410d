//! Control API server.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
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
    pub scheduler: Arc<Scheduler>,
}

/// Control API server for Uptrail.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, store: Arc<Store>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            state: AppState {
                config,
                store,
                scheduler,
            },
        }
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = routes(self.state.clone());

        tracing::info!("Control API listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

/// Build the router with all routes.
pub fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/health", get(handlers::handle_health))
        // Control
        .route("/api/monitors/start", post(handlers::handle_start))
        .route("/api/monitors/stop", post(handlers::handle_stop))
        .route("/api/monitors/restart", post(handlers::handle_restart))
        // Reads
        .route("/api/monitors", get(handlers::handle_list_monitors))
        .route("/api/monitors/{id}/status", get(handlers::handle_status))
        .route("/api/monitors/{id}/stats", get(handlers::handle_stats))
        .route("/api/monitors/{id}/incidents", get(handlers::handle_incidents))
        .route("/api/monitors/{id}/checks", get(handlers::handle_checks))
        .route("/api/monitors/{id}/daily", get(handlers::handle_daily_uptime))
        .route("/api/monitors/{id}", delete(handlers::handle_delete_monitor))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}
