//! Kettas log server - device log ingestion with rotating encrypted backups

use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use kettas_log_server::config::{Config, LoggingConfig};
use kettas_log_server::db::Database;
use kettas_log_server::routes::{self, metrics::Metrics};
use kettas_log_server::state::AppState;
use kettas_log_server::tasks::backup::BackupManager;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("KETTAS_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    // Held for the process lifetime so buffered file logs are flushed on exit
    let _log_guard = init_tracing(&config.logging)?;

    for dir in [&config.ingest.upload_dir, &config.ingest.logs_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create working directory {}", dir.display()))?;
    }

    let db = if config.database.enabled {
        let url = config
            .database
            .url
            .as_ref()
            .context("database.url is required when the database is enabled")?;
        let db = Database::new(url.expose_secret(), &config.database.table)
            .await
            .context("Failed to connect to database")?;
        db.ensure_schema().await.context("Failed to prepare database schema")?;
        Some(db)
    } else {
        info!("Database forwarding disabled");
        None
    };

    let metrics = Arc::new(Metrics::new());
    let backup = Arc::new(
        BackupManager::new(config.retention(), config.backup.enabled)?
            .with_metrics(Arc::clone(&metrics)),
    );
    backup.start();

    let listen_addr = config.server.listen_addr;
    let state = AppState::new(config, db, Arc::clone(&backup), metrics);
    let db_handle = state.db.clone();
    let app = routes::router(state);

    info!("Kettas log server v{} starting on {}", env!("CARGO_PKG_VERSION"), listen_addr);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind {listen_addr}"))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server failed")?;

    // Requests are drained; now let the in-flight backup cycle finish
    info!("HTTP server stopped, waiting for backup manager");
    backup.stop().await;

    if let Some(db) = db_handle {
        db.close().await;
    }

    info!("Shutdown complete");
    Ok(())
}

/// Stdout logging plus an optional daily-rolled internal log file
fn init_tracing(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kettas_log_server=info,tower_http=info".into());

    let (file_layer, guard) = match &logging.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let prefix = path
                .file_name()
                .context("logging.file must name a file")?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let appender = tracing_appender::rolling::daily(dir, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            let layer = if logging.json {
                layer.json().boxed()
            } else {
                layer.boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
