//! JSON control plane
//!
//! A thin axum layer over [`UsenetDownloader`]: every handler forwards to one
//! downloader method and returns its result as JSON. Errors become
//! `{ "error": { code, message, details } }` bodies with a matching status.

use crate::{Config, Result, UsenetDownloader};
use axum::{
    Router,
    http::HeaderValue,
    routing::{get, patch, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub mod error_response;
pub mod routes;
pub mod state;

pub use state::AppState;

/// Create the API router
///
/// # Routes
///
/// ## Queue
/// - `GET /queue` - Jobs in queue order
/// - `POST /queue` - Add a job (raw NZB body; `name`, `category`, `priority`, `password` query)
/// - `POST /queue/sort` - Sort within priority ranks
/// - `POST /queue/top-only` - Restrict dispatch to the head job
/// - `POST /queue/purge` - Delete every matching job
///
/// ## Jobs
/// - `GET /queue/:id` - One job
/// - `DELETE /queue/:id` - Delete (`del_files` query)
/// - `POST /queue/:id/pause` - Pause a job
/// - `POST /queue/:id/resume` - Resume a job
/// - `PATCH /queue/:id/priority` - Change priority
/// - `POST /queue/:id/move` - Move to an index or behind another job
/// - `POST /queue/:id/rename` - Rename and/or supply a password
///
/// ## Engine
/// - `POST /pause`, `POST /resume` - Pause or resume everything
/// - `GET /status` - State, speed and cache figures
/// - `PUT /speed-limit` - Bandwidth limit
/// - `GET /servers` - Per-server figures
/// - `GET /warnings`, `DELETE /warnings` - Warnings ring
/// - `GET /health` - Liveness
///
/// ## History
/// - `GET /history` - Finished and failed jobs (`limit`, `offset` query)
/// - `DELETE /history/:id` - Forget one entry
pub fn create_router(downloader: Arc<UsenetDownloader>, config: Arc<Config>) -> Router {
    let state = AppState::new(downloader, config.clone());

    let router = Router::new()
        // Queue
        .route("/queue", get(routes::list_queue).post(routes::add_job))
        .route("/queue/sort", post(routes::sort_queue))
        .route("/queue/top-only", post(routes::set_top_only))
        .route("/queue/purge", post(routes::purge_queue))
        // Jobs
        .route(
            "/queue/:id",
            get(routes::get_job).delete(routes::delete_job),
        )
        .route("/queue/:id/pause", post(routes::pause_job))
        .route("/queue/:id/resume", post(routes::resume_job))
        .route("/queue/:id/priority", patch(routes::set_job_priority))
        .route("/queue/:id/move", post(routes::move_job))
        .route("/queue/:id/rename", post(routes::rename_job))
        // Engine
        .route("/pause", post(routes::pause_all))
        .route("/resume", post(routes::resume_all))
        .route("/status", get(routes::status))
        .route("/speed-limit", axum::routing::put(routes::set_speed_limit))
        .route("/servers", get(routes::list_servers))
        .route(
            "/warnings",
            get(routes::list_warnings).delete(routes::clear_warnings),
        )
        .route("/health", get(routes::health_check))
        // History
        .route("/history", get(routes::get_history))
        .route("/history/:id", axum::routing::delete(routes::delete_history))
        .with_state(state);

    if config.api.cors_enabled {
        router.layer(build_cors_layer(&config.api.cors_origins))
    } else {
        router
    }
}

/// Build a CORS layer based on configured origins
///
/// `"*"` (or an empty list) allows any origin.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_any = origins.iter().any(|o| o == "*");

    if allow_any || origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Serve the control plane on the configured bind address until the
/// downloader shuts down.
///
/// # Example
///
/// ```no_run
/// use usenet_engine::{Config, UsenetDownloader};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Arc::new(Config::default());
/// let downloader = Arc::new(UsenetDownloader::new((*config).clone()).await?);
///
/// usenet_engine::api::start_api_server(downloader, config).await?;
/// # Ok(())
/// # }
/// ```
pub async fn start_api_server(
    downloader: Arc<UsenetDownloader>,
    config: Arc<Config>,
) -> Result<()> {
    let bind_address = config.api.bind_address;
    tracing::info!(address = %bind_address, "Starting API server");

    let stopped = downloader.cancellation();
    let app = create_router(downloader, config);
    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(crate::error::Error::Io)?;

    tracing::info!(address = %bind_address, "API server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stopped.cancelled().await })
        .await
        .map_err(|e| crate::error::Error::ApiServerError(e.to_string()))?;

    tracing::info!("API server stopped");
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
