//! Backup manager - periodic log rotation and backup retention

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::{check_and_rotate, evaluate, RetentionPolicy};
use crate::config::RetentionConfig;
use crate::error::BackupError;
use crate::models::{EvictionReason, RotationOutcome};
use crate::routes::metrics::Metrics;

/// Lifecycle state of the backup manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    /// Turned off by configuration; `start` never spawns a worker
    Disabled,
    Stopped,
    Running,
    Stopping,
}

struct Worker {
    state: ManagerState,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Owns the background worker that rotates the live log directory and
/// prunes the backup directory.
///
/// One cycle runs at startup and then once per check interval. Cycles never
/// overlap; a tick that falls due while a cycle is running is delayed.
pub struct BackupManager {
    config: Arc<RetentionConfig>,
    enabled: bool,
    metrics: Option<Arc<Metrics>>,
    live_lock: Arc<RwLock<()>>,
    worker: Mutex<Worker>,
}

impl BackupManager {
    /// Create a manager for `config`.
    ///
    /// The configuration is validated only when `enabled` is set.
    pub fn new(config: RetentionConfig, enabled: bool) -> Result<Self, BackupError> {
        if enabled {
            config.validate()?;
        }
        let state = if enabled {
            ManagerState::Stopped
        } else {
            ManagerState::Disabled
        };

        Ok(Self {
            config: Arc::new(config),
            enabled,
            metrics: None,
            live_lock: Arc::new(RwLock::new(())),
            worker: Mutex::new(Worker {
                state,
                cancel: CancellationToken::new(),
                handle: None,
            }),
        })
    }

    /// Report cycle results into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Lock guarding writes into the live directory.
    ///
    /// Ingest holds the read side while extracting; rotation takes the
    /// write side for the snapshot and clear.
    pub fn live_lock(&self) -> Arc<RwLock<()>> {
        Arc::clone(&self.live_lock)
    }

    pub fn state(&self) -> ManagerState {
        self.worker.lock().state
    }

    /// Spawn the worker. Must be called from within a Tokio runtime.
    ///
    /// Does nothing when disabled or already running.
    pub fn start(&self) {
        if !self.enabled {
            info!("Backup manager is disabled");
            return;
        }

        let mut worker = self.worker.lock();
        if worker.handle.is_some() {
            warn!(state = ?worker.state, "Backup manager already started");
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_worker(
            Arc::clone(&self.config),
            Arc::clone(&self.live_lock),
            self.metrics.clone(),
            cancel.clone(),
        ));

        worker.cancel = cancel;
        worker.handle = Some(handle);
        worker.state = ManagerState::Running;
    }

    /// Signal the worker to stop and wait for it to exit.
    ///
    /// A cycle already in progress is allowed to finish. Calling this before
    /// `start`, or more than once, is a no-op.
    pub async fn stop(&self) {
        let handle = {
            let mut worker = self.worker.lock();
            let Some(handle) = worker.handle.take() else {
                return;
            };
            worker.state = ManagerState::Stopping;
            worker.cancel.cancel();
            handle
        };

        if let Err(e) = handle.await {
            error!(error = %e, "Backup worker terminated abnormally");
        }

        self.worker.lock().state = ManagerState::Stopped;
        info!("Backup manager stopped");
    }
}

async fn run_worker(
    config: Arc<RetentionConfig>,
    live_lock: Arc<RwLock<()>>,
    metrics: Option<Arc<Metrics>>,
    cancel: CancellationToken,
) {
    info!(
        interval_min = config.check_interval.as_secs() / 60,
        live_dir = %config.live_dir.display(),
        backup_dir = %config.backup_dir.display(),
        "Backup manager started"
    );

    // First tick completes immediately, giving the startup cycle
    let mut interval = tokio::time::interval(config.check_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        // Not raced against cancellation: a started cycle always completes
        let cycle_config = Arc::clone(&config);
        let cycle_lock = Arc::clone(&live_lock);
        let cycle_metrics = metrics.clone();
        let result = tokio::task::spawn_blocking(move || {
            run_cycle(&cycle_config, &cycle_lock, cycle_metrics.as_deref())
        })
        .await;

        if let Err(e) = result {
            error!(error = %e, "Backup cycle panicked");
        }
    }

    info!("Backup manager stopping");
}

/// One rotation check followed by one retention pass.
///
/// Failures are logged; neither step aborts the other.
pub fn run_cycle(
    config: &RetentionConfig,
    live_lock: &RwLock<()>,
    metrics: Option<&Metrics>,
) {
    match check_and_rotate(
        &config.live_dir,
        &config.backup_dir,
        config.password(),
        config.max_live_folder_size_bytes,
        live_lock,
    ) {
        Ok(RotationOutcome::Skipped { live_bytes }) => {
            if let Some(m) = metrics {
                m.set_live_dir_bytes(live_bytes);
            }
        }
        Ok(RotationOutcome::Rotated { .. }) => {
            if let Some(m) = metrics {
                m.inc_rotations();
                m.set_live_dir_bytes(0);
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to rotate logs");
            if let Some(m) = metrics {
                m.inc_rotation_failures();
            }
        }
    }

    let policy = RetentionPolicy::new(config.retention_days, config.max_backup_size_bytes);
    match evaluate(&config.backup_dir, &policy) {
        Ok(report) => {
            if !report.deleted.is_empty() {
                info!(
                    deleted_age = report.count(EvictionReason::Age),
                    deleted_size = report.count(EvictionReason::Size),
                    remaining_bytes = report.remaining_bytes,
                    "Backup retention pass complete"
                );
            }
            if let Some(m) = metrics {
                for reason in [EvictionReason::Age, EvictionReason::Size] {
                    m.inc_backups_deleted(reason, report.count(reason) as u64);
                }
                m.set_backup_dir_bytes(report.remaining_bytes);
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to enforce backup retention");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::retention::list_archives;
    use crate::backup::size::dir_size;
    use std::fs::{self, File};
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;
    use zip::ZipArchive;

    fn test_config(root: &Path, interval: Duration) -> RetentionConfig {
        let live_dir = root.join("logs");
        fs::create_dir_all(&live_dir).unwrap();
        RetentionConfig {
            check_interval: interval,
            max_live_folder_size_bytes: 100,
            max_backup_size_bytes: 1024 * 1024,
            retention_days: 30,
            archive_password: None,
            live_dir,
            backup_dir: root.join("backups"),
        }
    }

    fn archive_count(dir: &Path) -> usize {
        list_archives(dir).unwrap().map(|v| v.len()).unwrap_or(0)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_disabled_manager_is_inert() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path(), Duration::from_secs(60));
        config.retention_days = 0; // not validated when disabled

        let manager = BackupManager::new(config, false).unwrap();
        manager.start();
        assert_eq!(manager.state(), ManagerState::Disabled);
        manager.stop().await;
        assert_eq!(manager.state(), ManagerState::Disabled);
    }

    #[test]
    fn test_invalid_config_rejected_when_enabled() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path(), Duration::from_secs(60));
        config.max_backup_size_bytes = 0;
        assert!(matches!(
            BackupManager::new(config, true),
            Err(BackupError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_before_start_and_twice() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), Duration::from_secs(60));
        let manager = BackupManager::new(config, true).unwrap();

        manager.stop().await;
        assert_eq!(manager.state(), ManagerState::Stopped);

        manager.start();
        assert_eq!(manager.state(), ManagerState::Running);
        manager.stop().await;
        manager.stop().await;
        assert_eq!(manager.state(), ManagerState::Stopped);
    }

    #[tokio::test]
    async fn test_startup_cycle_rotates() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), Duration::from_secs(3600));
        fs::create_dir_all(config.live_dir.join("home_id_1")).unwrap();
        fs::write(config.live_dir.join("home_id_1/a.json"), vec![b'z'; 150]).unwrap();
        let live = config.live_dir.clone();
        let backups = config.backup_dir.clone();

        let metrics = Arc::new(Metrics::new());
        let manager = BackupManager::new(config, true)
            .unwrap()
            .with_metrics(Arc::clone(&metrics));
        manager.start();

        assert!(wait_for(|| archive_count(&backups) == 1).await);
        manager.stop().await;

        assert_eq!(dir_size(&live).unwrap(), 0);
        assert_eq!(archive_count(&backups), 1);
        assert_eq!(metrics.get_metrics().rotations_total, 1);
    }

    #[tokio::test]
    async fn test_ticks_keep_rotating() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), Duration::from_millis(50));
        let live = config.live_dir.clone();
        let backups = config.backup_dir.clone();

        let manager = BackupManager::new(config, true).unwrap();
        manager.start();

        for round in 1..=3 {
            fs::write(live.join(format!("batch_{round}.log")), vec![b'q'; 200]).unwrap();
            // Live dir is only emptied once the snapshot is complete
            assert!(wait_for(|| {
                archive_count(&backups) == round && fs::read_dir(&live).unwrap().count() == 0
            })
            .await);
        }

        manager.stop().await;
        assert_eq!(archive_count(&backups), 3);
    }

    #[tokio::test]
    async fn test_stop_waits_for_running_cycle() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), Duration::from_secs(3600));
        let live = config.live_dir.clone();
        let backups = config.backup_dir.clone();
        fs::create_dir_all(live.join("home_id_9")).unwrap();
        for i in 0..300 {
            let path = live.join(format!("home_id_9/log_{i}.json"));
            fs::write(path, vec![b'r'; 32 * 1024]).unwrap();
        }

        let manager = BackupManager::new(config, true).unwrap();
        manager.start();
        // The snapshot file exists from the moment the cycle starts writing it
        assert!(wait_for(|| archive_count(&backups) == 1).await);
        manager.stop().await;

        assert_eq!(manager.state(), ManagerState::Stopped);
        assert_eq!(fs::read_dir(&live).unwrap().count(), 0);
        let archives = list_archives(&backups).unwrap().unwrap();
        assert_eq!(archives.len(), 1);
        let archive = File::open(backups.join(&archives[0].name)).unwrap();
        let zip = ZipArchive::new(archive).unwrap();
        assert_eq!(zip.file_names().filter(|n| !n.ends_with('/')).count(), 300);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), Duration::from_secs(60));
        let manager = BackupManager::new(config, true).unwrap();

        manager.start();
        manager.stop().await;
        manager.start();
        assert_eq!(manager.state(), ManagerState::Running);
        manager.stop().await;
        assert_eq!(manager.state(), ManagerState::Stopped);
    }

    #[test]
    fn test_cycle_survives_missing_live_dir() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path(), Duration::from_secs(60));
        config.live_dir = dir.path().join("absent");

        let metrics = Metrics::new();
        run_cycle(&config, &RwLock::new(()), Some(&metrics));

        let snapshot = metrics.get_metrics();
        assert_eq!(snapshot.rotation_failures_total, 1);
        assert_eq!(snapshot.rotations_total, 0);
    }
}
