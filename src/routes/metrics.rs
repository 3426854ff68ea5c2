//! Prometheus metrics endpoint

use axum::extract::State;
use axum::response::IntoResponse;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::EvictionReason;
use crate::state::AppState;

/// Application metrics for Prometheus
#[derive(Default)]
pub struct Metrics {
    /// Total requests processed
    pub requests_total: AtomicU64,
    /// Uploads extracted into the live directory
    pub uploads_accepted_total: AtomicU64,
    /// Uploads rejected by validation or extraction
    pub uploads_rejected_total: AtomicU64,
    rotations_total: AtomicU64,
    rotation_failures_total: AtomicU64,
    backups_deleted_age_total: AtomicU64,
    backups_deleted_size_total: AtomicU64,
    /// Live directory size seen by the last cycle
    live_dir_bytes: AtomicU64,
    /// Backup directory size left by the last retention pass
    backup_dir_bytes: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_uploads_accepted(&self) {
        self.uploads_accepted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_uploads_rejected(&self) {
        self.uploads_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rotations(&self) {
        self.rotations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rotation_failures(&self) {
        self.rotation_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backups_deleted(&self, reason: EvictionReason, count: u64) {
        let counter = match reason {
            EvictionReason::Age => &self.backups_deleted_age_total,
            EvictionReason::Size => &self.backups_deleted_size_total,
        };
        counter.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_live_dir_bytes(&self, bytes: u64) {
        self.live_dir_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn set_backup_dir_bytes(&self, bytes: u64) {
        self.backup_dir_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            uploads_accepted_total: self.uploads_accepted_total.load(Ordering::Relaxed),
            uploads_rejected_total: self.uploads_rejected_total.load(Ordering::Relaxed),
            rotations_total: self.rotations_total.load(Ordering::Relaxed),
            rotation_failures_total: self.rotation_failures_total.load(Ordering::Relaxed),
            backups_deleted_age_total: self.backups_deleted_age_total.load(Ordering::Relaxed),
            backups_deleted_size_total: self.backups_deleted_size_total.load(Ordering::Relaxed),
            live_dir_bytes: self.live_dir_bytes.load(Ordering::Relaxed),
            backup_dir_bytes: self.backup_dir_bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub uploads_accepted_total: u64,
    pub uploads_rejected_total: u64,
    pub rotations_total: u64,
    pub rotation_failures_total: u64,
    pub backups_deleted_age_total: u64,
    pub backups_deleted_size_total: u64,
    pub live_dir_bytes: u64,
    pub backup_dir_bytes: u64,
}

/// GET /metrics
///
/// Returns Prometheus-format metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        render(&state.metrics.get_metrics()),
    )
}

fn render(snapshot: &MetricsSnapshot) -> String {
    format!(
        r#"# HELP kettas_requests_total Total number of HTTP requests processed
# TYPE kettas_requests_total counter
kettas_requests_total {}

# HELP kettas_uploads_accepted_total Uploads extracted into the live log directory
# TYPE kettas_uploads_accepted_total counter
kettas_uploads_accepted_total {}

# HELP kettas_uploads_rejected_total Uploads rejected by validation or extraction
# TYPE kettas_uploads_rejected_total counter
kettas_uploads_rejected_total {}

# HELP kettas_rotations_total Live directory rotations into a backup snapshot
# TYPE kettas_rotations_total counter
kettas_rotations_total {}

# HELP kettas_rotation_failures_total Rotations that failed and were retried next cycle
# TYPE kettas_rotation_failures_total counter
kettas_rotation_failures_total {}

# HELP kettas_backups_deleted_total Backup snapshots deleted by retention
# TYPE kettas_backups_deleted_total counter
kettas_backups_deleted_total{{reason="age"}} {}
kettas_backups_deleted_total{{reason="size"}} {}

# HELP kettas_live_dir_bytes Live log directory size at the last check
# TYPE kettas_live_dir_bytes gauge
kettas_live_dir_bytes {}

# HELP kettas_backup_dir_bytes Backup directory size after the last retention pass
# TYPE kettas_backup_dir_bytes gauge
kettas_backup_dir_bytes {}

# HELP kettas_info Build information
# TYPE kettas_info gauge
kettas_info{{version="{}"}} 1
"#,
        snapshot.requests_total,
        snapshot.uploads_accepted_total,
        snapshot.uploads_rejected_total,
        snapshot.rotations_total,
        snapshot.rotation_failures_total,
        snapshot.backups_deleted_age_total,
        snapshot.backups_deleted_size_total,
        snapshot.live_dir_bytes,
        snapshot.backup_dir_bytes,
        env!("CARGO_PKG_VERSION"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = Metrics::new();
        metrics.inc_rotations();
        metrics.inc_backups_deleted(EvictionReason::Size, 3);
        metrics.set_backup_dir_bytes(4096);

        let text = render(&metrics.get_metrics());
        assert!(text.contains("kettas_rotations_total 1\n"));
        assert!(text.contains("kettas_backups_deleted_total{reason=\"size\"} 3\n"));
        assert!(text.contains("kettas_backups_deleted_total{reason=\"age\"} 0\n"));
        assert!(text.contains("kettas_backup_dir_bytes 4096\n"));
    }
}
