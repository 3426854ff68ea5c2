//! Age and size retention over the backup directory

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::backup::archiver::ARCHIVE_EXTENSION;
use crate::error::BackupError;
use crate::models::{ArchiveFile, Deletion, EvictionReason, RetentionReport};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Limits enforced by a retention pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub max_total_bytes: u64,
}

impl RetentionPolicy {
    pub fn new(retention_days: u64, max_total_bytes: u64) -> Self {
        Self {
            max_age: Duration::from_secs(retention_days.saturating_mul(SECS_PER_DAY)),
            max_total_bytes,
        }
    }
}

/// Enforce `policy` on `backup_dir` as of now.
///
/// A backup directory that does not exist yields an empty report.
pub fn evaluate(
    backup_dir: &Path,
    policy: &RetentionPolicy,
) -> Result<RetentionReport, BackupError> {
    evaluate_at(backup_dir, policy, SystemTime::now())
}

/// Enforce `policy` on `backup_dir` as seen at `now`.
///
/// Expired archives are removed first. If the survivors still exceed the
/// size budget they are removed oldest first (ties broken by name) until
/// the total fits. Individual deletion failures are logged and skipped.
pub fn evaluate_at(
    backup_dir: &Path,
    policy: &RetentionPolicy,
    now: SystemTime,
) -> Result<RetentionReport, BackupError> {
    evaluate_with(backup_dir, policy, now, |path| fs::remove_file(path))
}

fn evaluate_with(
    backup_dir: &Path,
    policy: &RetentionPolicy,
    now: SystemTime,
    mut remove: impl FnMut(&Path) -> io::Result<()>,
) -> Result<RetentionReport, BackupError> {
    let Some(mut files) = list_archives(backup_dir)? else {
        debug!(dir = %backup_dir.display(), "Backup dir does not exist, nothing to evaluate");
        return Ok(RetentionReport::default());
    };
    files.sort_by(oldest_first);

    let mut report = RetentionReport::default();
    let mut survivors = Vec::with_capacity(files.len());

    for file in files {
        let age = age_of(&file, now);
        if age <= policy.max_age {
            survivors.push(file);
            continue;
        }

        match remove(&backup_dir.join(&file.name)) {
            Ok(()) => {
                info!(
                    file = %file.name,
                    age_days = age.as_secs() / SECS_PER_DAY,
                    modified = %file.modified_utc(),
                    reason = %EvictionReason::Age,
                    "Deleted backup past retention age"
                );
                report.deleted.push(Deletion {
                    name: file.name,
                    size_bytes: file.size_bytes,
                    reason: EvictionReason::Age,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(file = %file.name, error = %e, "Failed to delete expired backup");
                survivors.push(file);
            }
        }
    }

    let mut total: u64 = survivors.iter().map(|f| f.size_bytes).sum();

    if total > policy.max_total_bytes {
        info!(
            current_bytes = total,
            max_bytes = policy.max_total_bytes,
            "Backup dir over size budget, evicting oldest archives"
        );

        for file in survivors {
            if total <= policy.max_total_bytes {
                break;
            }

            let path = backup_dir.join(&file.name);
            if !matches!(path.try_exists(), Ok(true)) {
                total = total.saturating_sub(file.size_bytes);
                continue;
            }

            match remove(&path) {
                Ok(()) => {
                    total = total.saturating_sub(file.size_bytes);
                    info!(
                        file = %file.name,
                        size_bytes = file.size_bytes,
                        reason = %EvictionReason::Size,
                        "Deleted backup to free space"
                    );
                    report.deleted.push(Deletion {
                        name: file.name,
                        size_bytes: file.size_bytes,
                        reason: EvictionReason::Size,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    total = total.saturating_sub(file.size_bytes);
                }
                Err(e) => {
                    warn!(file = %file.name, error = %e, "Failed to delete backup");
                }
            }
        }
    }

    report.remaining_bytes = total;
    Ok(report)
}

/// List the snapshot archives directly inside `backup_dir`.
///
/// Returns `None` when the directory does not exist. Subdirectories and
/// files without the archive extension are ignored.
pub fn list_archives(backup_dir: &Path) -> Result<Option<Vec<ArchiveFile>>, BackupError> {
    let entries = match fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BackupError::io(backup_dir, e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BackupError::io(backup_dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXTENSION) {
            continue;
        }

        // Entry may vanish between listing and stat
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!(file = %path.display(), error = %e, "Skipping unreadable backup entry");
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        files.push(ArchiveFile {
            name: entry.file_name().to_string_lossy().into_owned(),
            size_bytes: metadata.len(),
            modified_at: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    Ok(Some(files))
}

/// Ordering used by both passes: oldest modification first, then by name
pub fn oldest_first(a: &ArchiveFile, b: &ArchiveFile) -> Ordering {
    a.modified_at
        .cmp(&b.modified_at)
        .then_with(|| a.name.cmp(&b.name))
}

/// Age relative to `now`; timestamps in the future count as age zero
fn age_of(file: &ArchiveFile, now: SystemTime) -> Duration {
    now.duration_since(file.modified_at).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    const DAY: Duration = Duration::from_secs(SECS_PER_DAY);

    fn write_archive(dir: &Path, name: &str, size: usize, modified: SystemTime) {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; size]).unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }

    fn remaining(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = list_archives(dir)
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_missing_dir_is_not_an_error() {
        let dir = tempdir().unwrap();
        let policy = RetentionPolicy::new(30, 10);
        let report = evaluate(&dir.path().join("never-created"), &policy).unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.remaining_bytes, 0);
    }

    #[test]
    fn test_oldest_first_size_eviction() {
        let dir = tempdir().unwrap();
        let now = SystemTime::now();
        write_archive(dir.path(), "a.zip", 10, now - Duration::from_secs(300));
        write_archive(dir.path(), "b.zip", 20, now - Duration::from_secs(200));
        write_archive(dir.path(), "c.zip", 30, now - Duration::from_secs(100));

        let policy = RetentionPolicy::new(30, 35);
        let report = evaluate_at(dir.path(), &policy, now).unwrap();

        assert_eq!(report.deleted_names(), vec!["a.zip", "b.zip"]);
        assert_eq!(report.count(EvictionReason::Size), 2);
        assert_eq!(report.remaining_bytes, 30);
        assert_eq!(remaining(dir.path()), vec!["c.zip"]);
    }

    #[test]
    fn test_age_pass_deletes_expired() {
        let dir = tempdir().unwrap();
        let now = SystemTime::now();
        write_archive(dir.path(), "old.zip", 5, now - DAY * 10);
        write_archive(dir.path(), "fresh.zip", 5, now - DAY);

        let report = evaluate_at(dir.path(), &RetentionPolicy::new(7, 1_000), now).unwrap();

        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.deleted[0].name, "old.zip");
        assert_eq!(report.deleted[0].reason, EvictionReason::Age);
        assert_eq!(remaining(dir.path()), vec!["fresh.zip"]);
    }

    #[test]
    fn test_age_then_size() {
        let dir = tempdir().unwrap();
        let now = SystemTime::now();
        write_archive(dir.path(), "expired.zip", 100, now - DAY * 40);
        write_archive(dir.path(), "older.zip", 60, now - DAY * 3);
        write_archive(dir.path(), "newer.zip", 60, now - DAY * 2);

        let report = evaluate_at(dir.path(), &RetentionPolicy::new(30, 100), now).unwrap();

        assert_eq!(report.count(EvictionReason::Age), 1);
        assert_eq!(report.count(EvictionReason::Size), 1);
        assert_eq!(report.deleted_names(), vec!["expired.zip", "older.zip"]);
        assert_eq!(remaining(dir.path()), vec!["newer.zip"]);
    }

    #[test]
    fn test_ties_broken_by_name() {
        let dir = tempdir().unwrap();
        let now = SystemTime::now();
        let same = now - Duration::from_secs(60);
        write_archive(dir.path(), "b.zip", 10, same);
        write_archive(dir.path(), "a.zip", 10, same);

        let report = evaluate_at(dir.path(), &RetentionPolicy::new(30, 15), now).unwrap();
        assert_eq!(report.deleted_names(), vec!["a.zip"]);
    }

    #[test]
    fn test_ignores_other_entries() {
        let dir = tempdir().unwrap();
        let now = SystemTime::now();
        write_archive(dir.path(), "notes.txt", 500, now - DAY * 90);
        fs::create_dir(dir.path().join("nested.zip")).unwrap();
        write_archive(dir.path(), "keep.zip", 5, now);

        let report = evaluate_at(dir.path(), &RetentionPolicy::new(30, 10), now).unwrap();

        assert!(report.deleted.is_empty());
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("nested.zip").is_dir());
    }

    #[test]
    fn test_within_limits_is_noop() {
        let dir = tempdir().unwrap();
        let now = SystemTime::now();
        write_archive(dir.path(), "a.zip", 10, now - DAY);
        write_archive(dir.path(), "b.zip", 10, now);

        let report = evaluate_at(dir.path(), &RetentionPolicy::new(30, 20), now).unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.remaining_bytes, 20);
    }

    #[test]
    fn test_retention_invariant_holds() {
        let dir = tempdir().unwrap();
        let now = SystemTime::now();
        for i in 0..12u32 {
            let name = format!("kettas_logs_{i:02}.zip");
            write_archive(dir.path(), &name, (i as usize + 1) * 7, now - DAY * (i * 4));
        }

        let policy = RetentionPolicy::new(20, 100);
        evaluate_at(dir.path(), &policy, now).unwrap();

        let survivors = list_archives(dir.path()).unwrap().unwrap();
        let total: u64 = survivors.iter().map(|f| f.size_bytes).sum();
        let all_young = survivors.iter().all(|f| age_of(f, now) <= policy.max_age);
        assert!(total <= policy.max_total_bytes || all_young);
        assert!(all_young);
        assert!(total <= policy.max_total_bytes);
    }

    fn fail_on(name: &'static str) -> impl FnMut(&Path) -> io::Result<()> {
        move |path: &Path| {
            if path.file_name().and_then(|n| n.to_str()) == Some(name) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            fs::remove_file(path)
        }
    }

    #[test]
    fn test_failed_age_deletion_does_not_stop_pass() {
        let dir = tempdir().unwrap();
        let now = SystemTime::now();
        write_archive(dir.path(), "stuck.zip", 5, now - DAY * 50);
        write_archive(dir.path(), "stale.zip", 5, now - DAY * 40);
        write_archive(dir.path(), "fresh.zip", 5, now);

        let policy = RetentionPolicy::new(30, 1_000);
        let report = evaluate_with(dir.path(), &policy, now, fail_on("stuck.zip")).unwrap();

        assert_eq!(report.deleted_names(), vec!["stale.zip"]);
        // Still on disk, so still counted
        assert_eq!(report.remaining_bytes, 10);
        assert_eq!(remaining(dir.path()), vec!["fresh.zip", "stuck.zip"]);
    }

    #[test]
    fn test_failed_size_deletion_does_not_stop_pass() {
        let dir = tempdir().unwrap();
        let now = SystemTime::now();
        write_archive(dir.path(), "a.zip", 10, now - Duration::from_secs(300));
        write_archive(dir.path(), "b.zip", 20, now - Duration::from_secs(200));
        write_archive(dir.path(), "c.zip", 30, now - Duration::from_secs(100));

        let policy = RetentionPolicy::new(30, 35);
        let report = evaluate_with(dir.path(), &policy, now, fail_on("a.zip")).unwrap();

        assert_eq!(report.deleted_names(), vec!["b.zip", "c.zip"]);
        assert_eq!(report.count(EvictionReason::Size), 2);
        assert_eq!(report.remaining_bytes, 10);
        assert_eq!(remaining(dir.path()), vec!["a.zip"]);
    }
}
