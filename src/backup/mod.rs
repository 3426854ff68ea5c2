//! Rotation and retention engine for the live log directory.
//!
//! The live directory fills up with extracted device logs. A rotation
//! snapshots it into one compressed (optionally AES-256 encrypted) zip in
//! the backup directory and clears it; a retention pass then prunes the
//! backup directory by age and by cumulative size. The scheduler that
//! drives both lives in [`crate::tasks::backup`].

pub mod archiver;
pub mod retention;
pub mod rotation;
pub mod size;

pub use archiver::{archive_dir, extract_archive, ARCHIVE_EXTENSION};
pub use retention::{evaluate, RetentionPolicy};
pub use rotation::check_and_rotate;
pub use size::dir_size;
