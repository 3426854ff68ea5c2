//! Zip archiving of a directory tree, and the matching extractor.
//!
//! File entries are deflated and, when a password is supplied, encrypted
//! per entry with WinZip AES-256. Directory entries are always plain.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{AesMode, CompressionMethod, ZipArchive, ZipWriter};

use crate::error::BackupError;

/// Extension carried by every snapshot in the backup directory
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Entries at or above this size are written with zip64 headers
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Archive `source` into a new zip file at `destination`.
///
/// Entry names are the base name of `source` followed by the path relative
/// to it, so `logs/home_id_1/a.json` is stored as `logs/home_id_1/a.json`.
/// `destination` is created with create-new semantics and its parent must
/// already exist. On failure a partial file may be left behind.
pub fn archive_dir(
    source: &Path,
    destination: &Path,
    password: Option<&str>,
) -> Result<(), BackupError> {
    let password = password.filter(|p| !p.is_empty());
    let prefix = base_name(source);

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
        .map_err(|e| BackupError::io(destination, e))?;
    let mut writer = ZipWriter::new(BufWriter::new(file));

    let mut files = 0usize;
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let at = e.path().unwrap_or(source).to_path_buf();
            BackupError::io(at, e.into())
        })?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let name = entry_name(&prefix, relative);

        if entry.file_type().is_dir() {
            if name.is_empty() {
                continue;
            }
            writer
                .add_directory(format!("{name}/"), FileOptions::<()>::default())
                .map_err(|e| BackupError::archive(destination, e))?;
            continue;
        }

        let mut input = File::open(entry.path()).map_err(|e| BackupError::io(entry.path(), e))?;
        let len = input
            .metadata()
            .map_err(|e| BackupError::io(entry.path(), e))?
            .len();

        writer
            .start_file(name, file_options(password, len >= ZIP64_THRESHOLD))
            .map_err(|e| BackupError::archive(destination, e))?;
        io::copy(&mut input, &mut writer).map_err(|e| BackupError::io(entry.path(), e))?;
        files += 1;
    }

    let mut out = writer
        .finish()
        .map_err(|e| BackupError::archive(destination, e))?;
    out.flush().map_err(|e| BackupError::io(destination, e))?;

    debug!(
        source = %source.display(),
        archive = %destination.display(),
        files = files,
        encrypted = password.is_some(),
        "Archive written"
    );
    Ok(())
}

/// Extract every entry of the zip at `archive` into `dest_dir`.
///
/// Existing files are overwritten. Entries whose names would resolve
/// outside `dest_dir` abort the extraction. Returns the number of files
/// written.
pub fn extract_archive(
    archive: &Path,
    dest_dir: &Path,
    password: Option<&str>,
) -> Result<usize, BackupError> {
    let password = password.filter(|p| !p.is_empty());
    let file = File::open(archive).map_err(|e| BackupError::io(archive, e))?;
    let mut zip = ZipArchive::new(file).map_err(|e| BackupError::archive(archive, e))?;

    let mut written = 0usize;
    for i in 0..zip.len() {
        let mut entry = match password {
            Some(pw) => zip.by_index_decrypt(i, pw.as_bytes()),
            None => zip.by_index(i),
        }
        .map_err(|e| BackupError::archive(archive, e))?;

        let relative = entry.enclosed_name().ok_or_else(|| {
            BackupError::io(
                archive,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("entry escapes destination: {}", entry.name()),
                ),
            )
        })?;
        let out_path = dest_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| BackupError::io(&out_path, e))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
        }
        let mut out = File::create(&out_path).map_err(|e| BackupError::io(&out_path, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| BackupError::io(&out_path, e))?;
        written += 1;
    }

    Ok(written)
}

fn file_options(password: Option<&str>, large: bool) -> FileOptions<'_, ()> {
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(large);
    match password {
        Some(pw) => options.with_aes_encryption(AesMode::Aes256, pw),
        None => options,
    }
}

fn base_name(source: &Path) -> String {
    source
        .file_name()
        .map(PathBuf::from)
        .or_else(|| {
            source
                .canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(PathBuf::from))
        })
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Zip entry names always use `/`, whatever the host separator
fn entry_name(prefix: &str, relative: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !prefix.is_empty() {
        parts.push(prefix.to_string());
    }
    parts.extend(relative.components().filter_map(|c| match c {
        Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
        _ => None,
    }));
    parts.join("/")
}
