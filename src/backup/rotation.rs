//! Live directory rotation: probe, snapshot, clear

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::backup::archiver::{archive_dir, ARCHIVE_EXTENSION};
use crate::backup::size::dir_size;
use crate::error::BackupError;
use crate::models::RotationOutcome;

const ARCHIVE_PREFIX: &str = "kettas_logs";
const TIMESTAMP_FORMAT: &str = "%d_%m_%Y_%H_%M_%S";

/// Rotate `live_dir` into `backup_dir` if it holds more than `max_live_bytes`.
///
/// The live directory is only cleared after its snapshot has been written.
/// If archiving fails the live directory is left untouched.
///
/// Writers into `live_dir` must hold the read side of `live_lock`; the
/// snapshot and the clear run under its write side.
pub fn check_and_rotate(
    live_dir: &Path,
    backup_dir: &Path,
    password: Option<&str>,
    max_live_bytes: u64,
    live_lock: &RwLock<()>,
) -> Result<RotationOutcome, BackupError> {
    let live_bytes = dir_size(live_dir)?;
    debug!(
        current_bytes = live_bytes,
        max_bytes = max_live_bytes,
        "Checking live dir size"
    );

    if live_bytes <= max_live_bytes {
        return Ok(RotationOutcome::Skipped { live_bytes });
    }

    info!(
        current_bytes = live_bytes,
        current_mb = live_bytes / 1024 / 1024,
        max_bytes = max_live_bytes,
        "Live dir size exceeded limit, starting rotation"
    );

    fs::create_dir_all(backup_dir).map_err(|e| BackupError::io(backup_dir, e))?;

    let _writers_paused = live_lock.write();
    let archive_path = next_archive_path(backup_dir, &Local::now());
    archive_dir(live_dir, &archive_path, password)?;
    info!(path = %archive_path.display(), "Logs rotated and archived");

    let removed = clear_dir(live_dir)?;
    info!(entries = removed, dir = %live_dir.display(), "Live dir cleared");

    Ok(RotationOutcome::Rotated {
        live_bytes,
        archive_path,
    })
}

/// Snapshot file name for a rotation at `at`
pub fn archive_file_name(at: &DateTime<Local>) -> String {
    format!(
        "{ARCHIVE_PREFIX}_{}.{ARCHIVE_EXTENSION}",
        at.format(TIMESTAMP_FORMAT)
    )
}

/// First free snapshot path for `at`.
///
/// Two rotations inside the same second share a timestamp; later ones get
/// a `_1`, `_2`, ... suffix.
fn next_archive_path(backup_dir: &Path, at: &DateTime<Local>) -> PathBuf {
    let base = archive_file_name(at);
    let mut candidate = backup_dir.join(&base);
    let stem = base.trim_end_matches(&format!(".{ARCHIVE_EXTENSION}")).to_string();

    let mut n = 1u32;
    while candidate.exists() {
        candidate = backup_dir.join(format!("{stem}_{n}.{ARCHIVE_EXTENSION}"));
        n += 1;
    }
    candidate
}

/// Remove every entry inside `dir`, keeping `dir` itself.
///
/// Continues past failures and reports them together.
pub fn clear_dir(dir: &Path) -> Result<usize, BackupError> {
    clear_dir_with(dir, |path, is_dir| {
        if is_dir {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    })
}

fn clear_dir_with(
    dir: &Path,
    mut remove: impl FnMut(&Path, bool) -> io::Result<()>,
) -> Result<usize, BackupError> {
    let entries = fs::read_dir(dir).map_err(|e| BackupError::io(dir, e))?;

    let mut total = 0usize;
    let mut failed = 0usize;
    for entry in entries {
        total += 1;
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to read live dir entry");
                failed += 1;
                continue;
            }
        };

        let path = entry.path();
        let result = match entry.file_type() {
            Ok(ft) => remove(&path, ft.is_dir()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to remove live dir entry");
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(BackupError::PartialFailure {
            operation: "clear live dir",
            failed,
            total,
        });
    }
    Ok(total)
}
