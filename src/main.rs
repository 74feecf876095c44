mod config;
mod db;
mod error;
mod handlers;
mod middleware;
mod models;
mod services;
mod storage;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::Targets, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::config::Config;
use crate::db::Database;
use crate::storage::{BlobStore, LocalBlobStore};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub store: Arc<dyn BlobStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The log directory comes from configuration, so load it first
    let config = Arc::new(Config::load()?);
    let _log_guard = init_tracing(&config);

    tracing::info!("Starting file service...");
    tracing::info!("Configuration loaded");

    // Initialize database
    let db = Database::new(&config.database.path).await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(
        &config.storage.upload_dir,
        config.storage.search_horizon_days,
    ));
    tracing::info!(
        "Blob store ready ({}) at {}",
        store.storage_type(),
        config.storage.upload_dir
    );

    let state = AppState {
        db,
        config: config.clone(),
        store,
    };

    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Console output for everything, plus a daily request log file when `log.dir` is set
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let console = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "fileservice=debug,tower_http=debug".into()),
    );

    match &config.log.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "requests.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let requests = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(Targets::new().with_target(middleware::request_log::TARGET, Level::INFO));

            tracing_subscriber::registry()
                .with(console)
                .with(requests)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(console).init();
            None
        }
    }
}

pub(crate) fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let max_request_size = state.config.storage.max_request_size();

    Router::new()
        // Files
        .route("/files", get(handlers::file::list_files))
        .route("/files/upload", post(handlers::file::upload_files))
        .route("/files/info/:uuid", get(handlers::file::get_file))
        .route(
            "/files/:uuid",
            put(handlers::file::replace_file).delete(handlers::file::delete_file),
        )
        .route("/files/downloadbyuuid/:uuid", get(handlers::file::download_by_uuid))
        .route("/files/downloadbyid/:id", get(handlers::file::download_by_id))
        .route("/files/previewbyuuid/:uuid", get(handlers::file::preview_by_uuid))
        .route("/files/previewbyid/:id", get(handlers::file::preview_by_id))
        // Maintenance
        .route("/maintenance/sweep", post(handlers::file::sweep_orphans))
        // Stats
        .route("/stats/summary", get(handlers::stats::summary))
        .route("/stats/by-type", get(handlers::stats::by_type))
        .route("/health", get(health))
        // Multipart bodies are bounded by the request limit, not axum's 2MB default
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_request_size))
        .layer(axum::middleware::from_fn(middleware::request_log::request_log))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
