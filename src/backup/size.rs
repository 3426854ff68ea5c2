//! Recursive directory size probe

use std::path::Path;
use walkdir::WalkDir;

use crate::error::BackupError;

/// Sum the byte length of every non-directory entry under `path`.
///
/// A missing root or any entry that cannot be stat'ed is an error.
pub fn dir_size(path: &Path) -> Result<u64, BackupError> {
    let mut total = 0u64;

    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|e| {
            let at = e.path().unwrap_or(path).to_path_buf();
            BackupError::io(at, e.into())
        })?;

        if entry.file_type().is_dir() {
            continue;
        }

        let metadata = entry
            .metadata()
            .map_err(|e| BackupError::io(entry.path(), e.into()))?;
        total = total.saturating_add(metadata.len());
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_sums_nested_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.log"), vec![0u8; 100]).unwrap();
        fs::create_dir_all(dir.path().join("home_id_1/sub")).unwrap();
        fs::write(dir.path().join("home_id_1/b.json"), vec![0u8; 250]).unwrap();
        fs::write(dir.path().join("home_id_1/sub/c.json"), vec![0u8; 7]).unwrap();

        assert_eq!(dir_size(dir.path()).unwrap(), 357);
    }

    #[test]
    fn test_empty_dir_is_zero() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        assert_eq!(dir_size(dir.path()).unwrap(), 0);
    }

    #[test]
    fn test_missing_root_is_error() {
        let dir = tempdir().unwrap();
        let err = dir_size(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, BackupError::Io { .. }));
    }
}
