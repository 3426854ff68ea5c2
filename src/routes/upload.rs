//! Device log archive upload endpoint

use axum::{
    extract::{Multipart, State},
    Json,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backup::extract_archive;
use crate::db;
use crate::error::{AppError, Result};
use crate::models::UploadResponse;
use crate::state::AppState;

/// Local file header signature of a zip archive
const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";
const HOME_ID_PREFIX: &str = "home_id_";
const DB_TIMEOUT: Duration = Duration::from_secs(30);

/// POST /upload
///
/// Accepts a multipart `file` field holding a device log zip named
/// `HOMEID_TIMESTAMP.zip` (optionally prefixed with `home_id_`), extracts it
/// into the device's directory under the live log dir, and forwards JSON
/// records to the database when enabled.
pub async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>> {
    let result = process_upload(&state, multipart).await;
    match &result {
        Ok(_) => state.metrics.inc_uploads_accepted(),
        Err(_) => state.metrics.inc_uploads_rejected(),
    }
    result.map(Json)
}

async fn process_upload(state: &AppState, mut multipart: Multipart) -> Result<UploadResponse> {
    let ingest = &state.config.ingest;

    let (raw_name, data) = loop {
        let Some(field) = multipart.next_field().await? else {
            warn!("File upload failed: no file field");
            return Err(AppError::InvalidRequest("File upload failed".into()));
        };
        if field.name() == Some("file") {
            let name = field.file_name().unwrap_or_default().to_string();
            let data = field.bytes().await?;
            break (name, data);
        }
    };

    let filename = sanitize_filename(&raw_name).ok_or_else(|| {
        warn!(filename = %raw_name, "Invalid filename");
        AppError::InvalidRequest("Invalid filename".into())
    })?;

    if Path::new(&filename).extension().and_then(|e| e.to_str()) != Some("zip") {
        warn!(filename = %filename, "Invalid file type");
        return Err(AppError::InvalidRequest("Only zip files are allowed".into()));
    }

    if data.len() < ZIP_MAGIC.len() {
        warn!(filename = %filename, "File too short");
        return Err(AppError::InvalidRequest("File too short".into()));
    }
    if &data[..ZIP_MAGIC.len()] != ZIP_MAGIC {
        warn!(
            filename = %filename,
            header = ?&data[..ZIP_MAGIC.len()],
            "Invalid file content (not a zip)"
        );
        return Err(AppError::InvalidRequest("Invalid file content".into()));
    }

    if data.len() as u64 > ingest.max_file_size_bytes() {
        warn!(filename = %filename, size = data.len(), "File too large");
        return Err(AppError::PayloadTooLarge(format!(
            "File size exceeds limit of {} MB",
            ingest.max_file_size_mb
        )));
    }

    let home_id = parse_home_id(&filename).ok_or_else(|| {
        warn!(filename = %filename, "Invalid filename format");
        AppError::InvalidRequest(
            "Invalid filename format. Expected HOMEID_TIMESTAMP.zip or home_id_HOMEID_TIMESTAMP.zip"
                .into(),
        )
    })?;

    let temp_path = ingest
        .upload_dir
        .join(format!("{}_{}", Uuid::new_v4(), filename));
    tokio::fs::write(&temp_path, &data).await.map_err(|e| {
        error!(error = %e, path = %temp_path.display(), "Failed to save file");
        AppError::InternalError("Failed to save file".into())
    })?;

    let target_dir = ingest.logs_dir.join(format!("{HOME_ID_PREFIX}{home_id}"));
    let extracted = extract_into(
        &temp_path,
        &target_dir,
        ingest.password().map(str::to_owned),
        state.backup.live_lock(),
    )
    .await;

    if let Err(e) = tokio::fs::remove_file(&temp_path).await {
        warn!(error = %e, path = %temp_path.display(), "Failed to remove temporary upload");
    }

    let files = extracted?;
    info!(filename = %filename, home_id = %home_id, files = files, "File processed successfully");

    let Some(database) = state.db.clone() else {
        info!(home_id = %home_id, "Database forwarding disabled, skipping insert");
        return Ok(UploadResponse {
            message: "File uploaded, extracted and processed",
            home_id,
            inserted_count: 0,
            db_enabled: false,
            db_error: None,
        });
    };

    match forward_records(&database, &target_dir, &home_id).await {
        Ok(inserted_count) => Ok(UploadResponse {
            message: "File uploaded, extracted and processed",
            home_id,
            inserted_count,
            db_enabled: true,
            db_error: None,
        }),
        Err(e) => {
            error!(error = %e, home_id = %home_id, "Database insert failed");
            Ok(UploadResponse {
                message: "File uploaded and extracted, but db insert failed",
                home_id,
                inserted_count: 0,
                db_enabled: true,
                db_error: Some(e.to_string()),
            })
        }
    }
}

async fn extract_into(
    archive: &Path,
    target_dir: &Path,
    password: Option<String>,
    live_lock: Arc<RwLock<()>>,
) -> Result<usize> {
    let archive = archive.to_path_buf();
    let target_dir: PathBuf = target_dir.to_path_buf();

    tokio::task::spawn_blocking(move || {
        // Rotation cannot snapshot or clear the live dir while this is held
        let _rotation_paused = live_lock.read();
        std::fs::create_dir_all(&target_dir).map_err(|e| {
            error!(error = %e, dir = %target_dir.display(), "Failed to create target directory");
            AppError::InternalError("Failed to create target directory".into())
        })?;
        extract_archive(&archive, &target_dir, password.as_deref()).map_err(|e| {
            error!(error = %e, archive = %archive.display(), "Unzip error");
            AppError::InternalError("Failed to unzip file".into())
        })
    })
    .await
    .map_err(|e| AppError::InternalError(format!("Join error: {}", e)))?
}

async fn forward_records(database: &db::Database, dir: &Path, home_id: &str) -> Result<usize> {
    let dir = dir.to_path_buf();
    let documents = tokio::task::spawn_blocking(move || db::collect_documents(&dir, Utc::now()))
        .await
        .map_err(|e| AppError::InternalError(format!("Join error: {}", e)))?
        .map_err(|e| AppError::InternalError(format!("Failed to read device dir: {}", e)))?;

    if documents.is_empty() {
        info!(home_id = %home_id, "No records to insert");
        return Ok(0);
    }

    tokio::time::timeout(DB_TIMEOUT, database.insert_documents(home_id, &documents))
        .await
        .map_err(|_| AppError::DatabaseError("Insert timed out".into()))?
}

/// Strip any client-side directory components from an uploaded file name
fn sanitize_filename(raw: &str) -> Option<String> {
    let name = Path::new(raw).file_name()?.to_str()?;
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

/// Device id from `HOMEID_TIMESTAMP.zip` or `home_id_HOMEID_TIMESTAMP.zip`
fn parse_home_id(filename: &str) -> Option<String> {
    let clean = filename.strip_prefix(HOME_ID_PREFIX).unwrap_or(filename);
    let mut parts = clean.split('_');
    let home_id = parts.next()?;
    parts.next()?;
    (!home_id.is_empty()).then(|| home_id.to_string())
}
