use axum::{
    body::Body,
    extract::{multipart::Field, rejection::QueryRejection, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use std::path::{Path as FsPath, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{ApiResponse, AppError, Result};
use crate::models::{
    DeleteResponse, FileListResponse, FileQuery, FileRecord, FileResponse, SweepResponse,
    UploadResponse,
};
use crate::services::{FileService, StagedUpload};
use crate::storage::Blob;
use crate::AppState;

/// Upload one or more files
/// POST /files/upload
pub async fn upload_files(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<UploadResponse>>> {
    let limits = &state.config.storage;
    let mut staged = Vec::new();

    let result = match stage_multipart(&mut multipart, limits, limits.max_files_per_request, &mut staged).await {
        Ok(()) => FileService::upload(&state.db, state.store.as_ref(), limits, &staged).await,
        Err(e) => Err(e),
    };

    cleanup_staged(&staged).await;
    Ok(Json(ApiResponse::success(result?)))
}

/// Replace the content of an existing file
/// PUT /files/:uuid
pub async fn replace_file(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<FileResponse>>> {
    let limits = &state.config.storage;
    let mut staged = Vec::new();

    let result = match stage_multipart(&mut multipart, limits, 1, &mut staged).await {
        Ok(()) => match staged.first() {
            Some(upload) => {
                FileService::replace_file(&state.db, state.store.as_ref(), limits, &uuid, upload).await
            }
            None => Err(AppError::BadRequest("No file provided".to_string())),
        },
        Err(e) => Err(e),
    };

    cleanup_staged(&staged).await;
    Ok(Json(ApiResponse::success(result?)))
}

/// List files
/// GET /files?page=&pageSize=&type=&search=
pub async fn list_files(
    State(state): State<AppState>,
    query: std::result::Result<Query<FileQuery>, QueryRejection>,
) -> Result<Json<ApiResponse<FileListResponse>>> {
    let Query(query) = query.map_err(|e| AppError::BadRequest(format!("Invalid query: {}", e)))?;
    let files =
        FileService::list_files(&state.db, &query.filter(), query.page(), query.page_size()).await?;
    Ok(Json(ApiResponse::success(files)))
}

/// Get file metadata
/// GET /files/info/:uuid
pub async fn get_file(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<ApiResponse<FileResponse>>> {
    let file = FileService::get_file(&state.db, &uuid).await?;
    Ok(Json(ApiResponse::success(FileResponse::from(file))))
}

/// GET /files/downloadbyuuid/:uuid
pub async fn download_by_uuid(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Response> {
    let (record, blob) = FileService::open_by_identifier(&state.db, state.store.as_ref(), &uuid).await?;
    blob_response(record, blob, "attachment")
}

/// GET /files/downloadbyid/:id
pub async fn download_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let (record, blob) = FileService::open_by_id(&state.db, state.store.as_ref(), parse_id(&id)?).await?;
    blob_response(record, blob, "attachment")
}

/// GET /files/previewbyuuid/:uuid
pub async fn preview_by_uuid(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Response> {
    let (record, blob) = FileService::open_by_identifier(&state.db, state.store.as_ref(), &uuid).await?;
    blob_response(record, blob, "inline")
}

/// GET /files/previewbyid/:id
pub async fn preview_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let (record, blob) = FileService::open_by_id(&state.db, state.store.as_ref(), parse_id(&id)?).await?;
    blob_response(record, blob, "inline")
}

/// Delete a file
/// DELETE /files/:uuid
pub async fn delete_file(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<ApiResponse<DeleteResponse>>> {
    let deleted = FileService::delete_file(&state.db, state.store.as_ref(), &uuid).await?;
    Ok(Json(ApiResponse::success(deleted)))
}

/// Remove orphan blobs and abandoned temporary files
/// POST /maintenance/sweep
pub async fn sweep_orphans(State(state): State<AppState>) -> Result<Json<ApiResponse<SweepResponse>>> {
    let grace = Duration::from_secs(state.config.storage.orphan_grace_secs);
    let report = FileService::sweep_orphans(&state.db, state.store.as_ref(), grace).await?;
    tracing::info!(
        scanned = report.scanned,
        removed_orphans = report.removed_orphans,
        removed_temp = report.removed_temp,
        "Orphan sweep finished"
    );
    Ok(Json(ApiResponse::success(report)))
}

fn parse_id(id: &str) -> Result<i64> {
    id.parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid file id: {}", id)))
}

/// Stream a blob back with the given Content-Disposition type
fn blob_response(record: FileRecord, blob: Blob, disposition: &str) -> Result<Response> {
    let fallback_name: String = record
        .filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();
    let encoded_name = urlencoding::encode(&record.filename);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, record.mime_type.as_str())
        .header(header::CONTENT_LENGTH, blob.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "{}; filename=\"{}\"; filename*=UTF-8''{}",
                disposition, fallback_name, encoded_name
            ),
        )
        .body(Body::from_stream(ReaderStream::new(blob.reader)))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}

/// Spool every file field to the staging directory.
/// Staged files are pushed as they complete so the caller can always clean them up.
async fn stage_multipart(
    multipart: &mut Multipart,
    limits: &StorageConfig,
    max_files: usize,
    staged: &mut Vec<StagedUpload>,
) -> Result<()> {
    let staging_dir = PathBuf::from(&limits.staging_dir);
    tokio::fs::create_dir_all(&staging_dir).await.map_err(|e| {
        tracing::error!("Failed to create staging directory {:?}: {}", staging_dir, e);
        e
    })?;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::BadRequest(format!("Failed to process multipart: {}", e))
    })? {
        let name = field.name().unwrap_or("").to_string();
        if name != "files" && name != "file" {
            continue;
        }
        if staged.len() >= max_files {
            return Err(AppError::BadRequest(format!(
                "Too many files, at most {} per request",
                max_files
            )));
        }

        let file_name = field
            .file_name()
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::BadRequest("No file name provided".to_string()))?;
        let content_type = field.content_type().map(|s| s.to_string());

        let (path, size) = stage_field(field, &staging_dir, limits.max_file_size).await?;
        staged.push(StagedUpload {
            file_name,
            content_type,
            path,
            size,
        });
    }

    Ok(())
}

async fn stage_field(mut field: Field<'_>, staging_dir: &FsPath, max_size: u64) -> Result<(PathBuf, u64)> {
    let temp_path = staging_dir.join(format!("upload_{}", Uuid::new_v4().simple()));
    let mut file = tokio::fs::File::create(&temp_path).await?;

    let copied = async {
        let mut size = 0u64;
        while let Some(chunk) = field.chunk().await.map_err(|e| {
            AppError::BadRequest(format!("Failed to read file chunk: {}", e))
        })? {
            size += chunk.len() as u64;
            if size > max_size {
                return Err(AppError::BadRequest(format!(
                    "File too large, limit is {} bytes",
                    max_size
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok::<u64, AppError>(size)
    }
    .await;

    drop(file);
    match copied {
        Ok(size) => Ok((temp_path, size)),
        Err(e) => {
            cleanup_staged_path(&temp_path).await;
            Err(e)
        }
    }
}

async fn cleanup_staged(staged: &[StagedUpload]) {
    for upload in staged {
        cleanup_staged_path(&upload.path).await;
    }
}

async fn cleanup_staged_path(path: &FsPath) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::error!("Failed to remove temp file {:?}: {}", path, e);
    }
}
