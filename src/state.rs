//! Application state shared across handlers

use crate::config::Config;
use crate::db::Database;
use crate::routes::metrics::Metrics;
use crate::tasks::backup::BackupManager;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration loaded at startup
    pub config: Arc<Config>,
    /// Record forwarding pool, present when the database is enabled
    pub db: Option<Arc<Database>>,
    /// Background rotation and retention worker
    pub backup: Arc<BackupManager>,
    /// Application metrics for Prometheus
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: Option<Database>,
        backup: Arc<BackupManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            db: db.map(Arc::new),
            backup,
            metrics,
        }
    }
}
