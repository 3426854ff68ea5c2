//! Core domain models for the log server

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

/// A snapshot archive found in the backup directory.
///
/// Rebuilt from the filesystem on every retention pass; never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub name: String,
    pub size_bytes: u64,
    pub modified_at: SystemTime,
}

impl ArchiveFile {
    pub fn modified_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.modified_at)
    }
}

/// Why a backup archive was evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Older than the retention window
    Age,
    /// Removed to bring the backup directory under its size budget
    Size,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Age => "age",
            EvictionReason::Size => "size",
        }
    }
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One archive removed by a retention pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub name: String,
    pub size_bytes: u64,
    pub reason: EvictionReason,
}

/// Outcome of one retention pass over the backup directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub deleted: Vec<Deletion>,
    /// Bytes still held by archives after the pass
    pub remaining_bytes: u64,
}

impl RetentionReport {
    pub fn deleted_names(&self) -> Vec<&str> {
        self.deleted.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn count(&self, reason: EvictionReason) -> usize {
        self.deleted.iter().filter(|d| d.reason == reason).count()
    }
}

/// Result of a rotation check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Live directory was within its limit; nothing was touched
    Skipped { live_bytes: u64 },
    /// Live directory was archived to `archive_path` and cleared
    Rotated {
        live_bytes: u64,
        archive_path: PathBuf,
    },
}

/// Response payload for a processed upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub message: &'static str,
    pub home_id: String,
    pub inserted_count: usize,
    pub db_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_error: Option<String>,
}
