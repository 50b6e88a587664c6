//! # HTTP Server for Manual Book Builds
//!
//! Provides a JSON API for listing serial-numbered products, building their
//! manual PDFs, and serving the results through public or signed links.
//!
//! ## Usage
//!
//! ```bash
//! librito serve --listen 0.0.0.0:8080 --data-dir data
//! ```
//!
//! The queue drain loop runs inside the server process, so queued builds
//! only make progress while `serve` is up.

mod handlers;
mod state;

pub use state::ServerConfig;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;

use crate::app::App;
use crate::error::LibritoError;
use state::{AppState, LIST_CACHE_TTL_SECS};

/// Start the HTTP server.
///
/// ## Example
///
/// ```no_run
/// use librito::app::App;
/// use librito::server::{serve, ServerConfig};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), librito::error::LibritoError> {
/// let app = Arc::new(App::open("data")?);
/// let config = ServerConfig {
///     listen_addr: "0.0.0.0:8080".to_string(),
/// };
///
/// serve(app, config).await?;
/// # Ok(())
/// # }
/// ```
pub async fn serve(app: Arc<App>, config: ServerConfig) -> Result<(), LibritoError> {
    let app_state = Arc::new(AppState::new(app.clone(), config.clone()));

    // Spawn the queue drain loop and the cache cleanup task
    tokio::spawn(app.scheduler.clone().run_periodic());
    tokio::spawn(cleanup_caches(app_state.clone()));

    let router = Router::new()
        // Manuals API
        .route("/api/manuals", get(handlers::list))
        .route("/api/manuals/:id", get(handlers::item))
        .route("/api/manuals/:id/preview", get(handlers::preview))
        .route("/api/manuals/:id/build", post(handlers::build))
        .route("/api/manuals/:id/process", post(handlers::process))
        .route("/api/manuals/:id/queue", post(handlers::queue))
        // Signed downloads
        .route("/download", get(handlers::download))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    println!("Librito HTTP server starting...");
    println!("Listening on: {}", config.listen_addr);
    println!("Data directory: {}", app.data_dir.display());
    println!();
    println!(
        "Open http://{}/api/manuals in your browser to list manuals",
        config.listen_addr
    );
    println!();

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| {
            LibritoError::Server(format!("Failed to bind to {}: {}", config.listen_addr, e))
        })?;

    axum::serve(listener, router)
        .await
        .map_err(|e| LibritoError::Server(format!("Server error: {}", e)))?;

    Ok(())
}

/// Background task to clean up expired list cache entries.
async fn cleanup_caches(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    let ttl = Duration::from_secs(LIST_CACHE_TTL_SECS);

    loop {
        interval.tick().await;
        let now = Instant::now();
        let generation = state.generation();

        let mut cache = state.list_cache.write().await;
        let before = cache.len();
        cache.retain(|_, v| v.generation == generation && now.duration_since(v.created) < ttl);
        let after = cache.len();
        if before != after {
            tracing::debug!(
                removed = before - after,
                remaining = after,
                "cleaned up expired list cache entries"
            );
        }
    }
}
