use anyhow::Result;
use axum::{Router, extract::DefaultBodyLimit};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use services::{
    chunk_store::DiskChunkStore,
    cleanup_service::{CleanupScheduler, CleanupSweeper, RetentionPolicy},
    permanent_store::LocalPermanentStore,
    session_registry::SessionRegistry,
    session_repository::{
        MemorySessionRepository, SessionRepository, SqliteSessionRepository, run_migrations,
    },
    upload_service::UploadService,
};

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting progressive-upload with config: {:?}", cfg);

    // --- Ensure storage directories exist ---
    for dir in [&cfg.staging_dir, &cfg.finished_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir)?;
            tracing::info!("Created directory at {}", dir);
        }
    }

    // --- Session store ---
    let repository: Arc<dyn SessionRepository> = if cfg.uses_memory_store() {
        if migrate {
            tracing::info!("In-memory session store selected, nothing to migrate.");
            return Ok(());
        }
        tracing::warn!("Using the in-memory session store; uploads will not survive a restart");
        Arc::new(MemorySessionRepository::new())
    } else {
        let db_url = &cfg.database_url;
        tracing::debug!("Connecting using raw URL => {}", db_url);

        let db_path = db_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:")
            .trim_start_matches("file:");
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
        let db = Arc::new(
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?,
        );

        run_migrations(&db).await?;
        if migrate {
            tracing::info!("Database migration complete.");
            return Ok(()); // exit after migration
        }
        Arc::new(SqliteSessionRepository::new(db))
    };

    // --- Initialize core services ---
    let registry = Arc::new(SessionRegistry::new(repository));
    let uploads = UploadService::new(
        registry,
        Arc::new(DiskChunkStore::new(cfg.staging_dir.clone())),
        Arc::new(LocalPermanentStore::new(cfg.finished_dir.clone())),
        cfg.default_chunk_size,
        cfg.max_chunk_size,
    );
    let sweeper = CleanupSweeper::new(
        uploads.clone(),
        RetentionPolicy::from_secs(cfg.session_retention_secs, cfg.orphan_retention_secs),
    );
    let scheduler = CleanupScheduler::start(
        sweeper.clone(),
        cfg.session_sweep_interval(),
        cfg.orphan_sweep_interval(),
    );

    // --- Build router ---
    let body_limit = usize::try_from(cfg.max_chunk_size).unwrap_or(usize::MAX);
    let app: Router = routes::routes::routes()
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state::AppState { uploads, sweeper });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
