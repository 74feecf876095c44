use chrono::{SecondsFormat, Utc};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::config::StorageConfig;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    DeleteResponse, FileFilter, FileListResponse, FileRecord, FileResponse, NewFileRecord,
    SweepResponse, UploadResponse,
};
use crate::services::index::FileIndex;
use crate::services::media;
use crate::storage::{Blob, BlobReader, BlobStore};

/// A client file already spooled to local disk, waiting to enter the store
#[derive(Debug, Clone)]
pub struct StagedUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub path: PathBuf,
    pub size: u64,
}

/// Upload after validation, ready to be written
struct ValidatedUpload<'a> {
    staged: &'a StagedUpload,
    file_name: String,
    mime_type: String,
}

/// Blob written for an upload, waiting for its row
struct WrittenBlob {
    uuid: String,
    filename: String,
    size: i64,
    mime_type: String,
}

/// File service
pub struct FileService;

impl FileService {
    /// Store one or more files.
    ///
    /// Blobs are written before their rows; every row goes in one transaction.
    /// Any failure removes every blob this call wrote.
    pub async fn upload(
        db: &Database,
        store: &dyn BlobStore,
        limits: &StorageConfig,
        uploads: &[StagedUpload],
    ) -> Result<UploadResponse> {
        if uploads.is_empty() {
            return Err(AppError::BadRequest("No file provided".to_string()));
        }
        if uploads.len() > limits.max_files_per_request {
            return Err(AppError::BadRequest(format!(
                "Too many files, at most {} per request",
                limits.max_files_per_request
            )));
        }

        let validated = uploads
            .iter()
            .map(|staged| Self::validate(limits, staged))
            .collect::<Result<Vec<_>>>()?;

        // Stage: blobs first, an orphan blob is recoverable, a dangling row is not
        let mut written: Vec<WrittenBlob> = Vec::with_capacity(validated.len());
        for upload in &validated {
            match Self::write_blob(store, upload).await {
                Ok(new) => written.push(new),
                Err(e) => {
                    Self::remove_blobs(store, &written, "upload").await;
                    return Err(e);
                }
            }
        }

        // Commit
        let records = match Self::insert_all(db, &written).await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("Index insert failed, removing {} new blob(s): {}", written.len(), e);
                Self::remove_blobs(store, &written, "upload").await;
                return Err(e);
            }
        };

        for record in &records {
            tracing::info!(
                identifier = record.uuid.as_str(),
                size = record.size,
                mime_type = record.mime_type.as_str(),
                "File uploaded"
            );
        }

        Ok(UploadResponse {
            uploaded: records.len(),
            files: records.into_iter().map(FileResponse::from).collect(),
        })
    }

    fn validate<'a>(limits: &StorageConfig, staged: &'a StagedUpload) -> Result<ValidatedUpload<'a>> {
        let file_name = media::sanitize_file_name(&staged.file_name)
            .ok_or_else(|| AppError::BadRequest("Invalid file name".to_string()))?;

        if staged.size == 0 {
            return Err(AppError::BadRequest(format!("File is empty: {}", file_name)));
        }
        if staged.size > limits.max_file_size {
            return Err(AppError::BadRequest(format!(
                "File too large: {} exceeds {} bytes",
                file_name, limits.max_file_size
            )));
        }

        let mime_type = media::detect_media_type(&file_name, staged.content_type.as_deref());
        if !limits.is_allowed(&mime_type) {
            return Err(AppError::BadRequest(format!(
                "File type not allowed: {}",
                mime_type
            )));
        }

        Ok(ValidatedUpload {
            staged,
            file_name,
            mime_type,
        })
    }

    async fn open_staged(staged: &StagedUpload) -> Result<BlobReader> {
        let file = tokio::fs::File::open(&staged.path).await.map_err(|e| {
            tracing::error!("Failed to open staged upload {:?}: {}", staged.path, e);
            e
        })?;
        Ok(Box::new(file))
    }

    async fn write_blob(store: &dyn BlobStore, upload: &ValidatedUpload<'_>) -> Result<WrittenBlob> {
        let uuid = media::new_identifier();
        let reader = Self::open_staged(upload.staged).await?;
        let size = store.save(&uuid, reader).await?;

        let new = WrittenBlob {
            uuid,
            filename: upload.file_name.clone(),
            size: size as i64,
            mime_type: upload.mime_type.clone(),
        };

        if size != upload.staged.size {
            Self::remove_blobs(store, std::slice::from_ref(&new), "upload").await;
            return Err(AppError::Storage(format!(
                "Size mismatch for {}: expected {} bytes, wrote {}",
                new.uuid, upload.staged.size, size
            )));
        }
        Ok(new)
    }

    async fn insert_all(db: &Database, written: &[WrittenBlob]) -> Result<Vec<FileRecord>> {
        let mut tx = db.pool().begin().await?;
        let mut records = Vec::with_capacity(written.len());
        for blob in written {
            let new = NewFileRecord {
                uuid: blob.uuid.clone(),
                filename: blob.filename.clone(),
                size: blob.size,
                mime_type: blob.mime_type.clone(),
                created_at: now(),
            };
            records.push(FileIndex::insert(tx.as_mut(), &new).await?);
        }
        tx.commit().await?;
        Ok(records)
    }

    /// Best-effort compensation; failures are left for the orphan sweep
    async fn remove_blobs(store: &dyn BlobStore, written: &[WrittenBlob], operation: &str) {
        for new in written {
            if let Err(e) = store.delete(&new.uuid).await {
                tracing::error!(
                    identifier = new.uuid.as_str(),
                    operation,
                    "Failed to remove orphan blob, needs cleanup: {}",
                    e
                );
            }
        }
    }

    /// Get a record by identifier
    pub async fn get_file(db: &Database, uuid: &str) -> Result<FileRecord> {
        FileIndex::get_by_identifier(db, uuid).await
    }

    /// Resolve a record and open its blob
    pub async fn open_by_identifier(
        db: &Database,
        store: &dyn BlobStore,
        uuid: &str,
    ) -> Result<(FileRecord, Blob)> {
        let record = FileIndex::get_by_identifier(db, uuid).await?;
        Self::open_record(store, record).await
    }

    /// Same as [`Self::open_by_identifier`] but keyed by numeric id
    pub async fn open_by_id(
        db: &Database,
        store: &dyn BlobStore,
        id: i64,
    ) -> Result<(FileRecord, Blob)> {
        let record = FileIndex::get_by_id(db, id).await?;
        Self::open_record(store, record).await
    }

    async fn open_record(store: &dyn BlobStore, record: FileRecord) -> Result<(FileRecord, Blob)> {
        let blob = store.open(&record.uuid).await.map_err(|e| {
            tracing::warn!(identifier = record.uuid.as_str(), "Blob unavailable for indexed file: {}", e);
            e
        })?;

        if blob.size != record.size as u64 {
            return Err(AppError::Storage(format!(
                "Size mismatch for {}: index has {} bytes, blob has {}",
                record.uuid, record.size, blob.size
            )));
        }
        Ok((record, blob))
    }

    /// List files, newest first
    pub async fn list_files(
        db: &Database,
        filter: &FileFilter,
        page: i64,
        page_size: i64,
    ) -> Result<FileListResponse> {
        let (records, total) = FileIndex::list(db, filter, page, page_size).await?;
        Ok(FileListResponse {
            data: records.into_iter().map(FileResponse::from).collect(),
            total,
            page,
            pages: (total + page_size - 1) / page_size,
        })
    }

    /// Delete a file.
    ///
    /// The row goes first: once it is committed the file is gone for clients,
    /// and a blob that then fails to delete is only logged for cleanup.
    pub async fn delete_file(db: &Database, store: &dyn BlobStore, uuid: &str) -> Result<DeleteResponse> {
        let mut tx = db.pool().begin().await?;
        let affected = FileIndex::delete(tx.as_mut(), uuid).await?;
        if affected == 0 {
            return Err(AppError::NotFound("File not found".to_string()));
        }
        tx.commit().await?;

        if let Err(e) = store.delete(uuid).await {
            tracing::warn!(
                identifier = uuid,
                operation = "delete",
                "Index row removed but blob delete failed, needs cleanup: {}",
                e
            );
        }

        tracing::info!(identifier = uuid, "File deleted");
        Ok(DeleteResponse {
            deleted: true,
            uuid: uuid.to_string(),
        })
    }

    /// Replace the content of an existing file, keeping its identifier
    pub async fn replace_file(
        db: &Database,
        store: &dyn BlobStore,
        limits: &StorageConfig,
        uuid: &str,
        upload: &StagedUpload,
    ) -> Result<FileResponse> {
        let validated = Self::validate(limits, upload)?;
        let existing = FileIndex::get_by_identifier(db, uuid).await?;

        let reader = Self::open_staged(upload).await?;
        let staged = store.stage(uuid, reader).await?;
        let size = staged.size();
        if size != upload.size {
            store.discard(staged).await;
            return Err(AppError::Storage(format!(
                "Size mismatch for {}: expected {} bytes, wrote {}",
                uuid, upload.size, size
            )));
        }

        // The old copy stays parked until the row change is committed
        let swap = store.swap(staged).await?;
        match Self::update_record(db, uuid, &validated, size).await {
            Ok(()) => store.confirm_swap(swap).await,
            Err(e) => {
                if let Err(restore) = store.revert_swap(swap).await {
                    tracing::error!(
                        identifier = uuid,
                        operation = "replace",
                        "Index update failed and the previous blob could not be restored: {}",
                        restore
                    );
                }
                return Err(e);
            }
        }

        tracing::info!(identifier = uuid, size, "File replaced");
        Ok(FileResponse {
            id: existing.id,
            uuid: existing.uuid,
            filename: validated.file_name,
            size: size as i64,
            mime_type: validated.mime_type,
            created_at: existing.created_at,
        })
    }

    async fn update_record(
        db: &Database,
        uuid: &str,
        upload: &ValidatedUpload<'_>,
        size: u64,
    ) -> Result<()> {
        let mut tx = db.pool().begin().await?;
        let updated = FileIndex::update(
            tx.as_mut(),
            uuid,
            &upload.file_name,
            size as i64,
            &upload.mime_type,
        )
        .await?;
        if updated == 0 {
            return Err(AppError::NotFound("File not found".to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Remove blobs without an index row and stale temporary files older than `grace`
    pub async fn sweep_orphans(
        db: &Database,
        store: &dyn BlobStore,
        grace: Duration,
    ) -> Result<SweepResponse> {
        let now = SystemTime::now();
        let blobs = store.list().await?;
        let mut report = SweepResponse {
            scanned: blobs.len(),
            ..Default::default()
        };

        for blob in blobs {
            // Young blobs may belong to an upload that has not committed yet
            if now.duration_since(blob.modified).unwrap_or_default() < grace {
                continue;
            }
            if FileIndex::exists(db, &blob.identifier).await? {
                continue;
            }
            match store.delete(&blob.identifier).await {
                Ok(()) => {
                    tracing::info!(identifier = blob.identifier.as_str(), "Removed orphan blob");
                    report.removed_orphans += 1;
                }
                Err(AppError::NotFound(_)) => {}
                Err(e) => tracing::warn!(
                    identifier = blob.identifier.as_str(),
                    "Failed to remove orphan blob: {}",
                    e
                ),
            }
        }

        report.removed_temp = store.sweep_temp(grace).await?;
        Ok(report)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBlobStore;
    use chrono::{DateTime, Days, Local};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    struct Fixture {
        dir: TempDir,
        db: Database,
        store: LocalBlobStore,
        limits: StorageConfig,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let db = Database::new(dir.path().join("files.db")).await.unwrap();
            db.run_migrations().await.unwrap();
            let store = LocalBlobStore::new(dir.path().join("uploads"), 365);
            let limits = StorageConfig {
                max_file_size: 64,
                ..StorageConfig::default()
            };
            Self { dir, db, store, limits }
        }

        async fn stage(&self, name: &str, data: &[u8]) -> StagedUpload {
            let staging = self.dir.path().join("staging");
            tokio::fs::create_dir_all(&staging).await.unwrap();
            let path = staging.join(media::new_identifier());
            tokio::fs::write(&path, data).await.unwrap();
            StagedUpload {
                file_name: name.to_string(),
                content_type: None,
                path,
                size: data.len() as u64,
            }
        }

        async fn upload(&self, name: &str, data: &[u8]) -> Result<UploadResponse> {
            let staged = self.stage(name, data).await;
            FileService::upload(&self.db, &self.store, &self.limits, &[staged]).await
        }

        fn blob_files(&self) -> Vec<PathBuf> {
            walkdir::WalkDir::new(self.store.base_path())
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect()
        }
    }

    /// Make every later commit that touched `files` fail on a deferred foreign key
    async fn fail_commits_after_update(db: &Database) {
        for sql in [
            "CREATE TABLE guard_parent (id TEXT PRIMARY KEY)",
            "CREATE TABLE guard_child (parent TEXT REFERENCES guard_parent(id) DEFERRABLE INITIALLY DEFERRED)",
            "CREATE TRIGGER files_update_guard AFTER UPDATE ON files BEGIN INSERT INTO guard_child (parent) VALUES ('missing'); END",
        ] {
            sqlx::query(sql).execute(db.pool()).await.unwrap();
        }
    }

    async fn read_blob(blob: Blob) -> Vec<u8> {
        let mut reader = blob.reader;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_upload_then_download_round_trip() {
        let fx = Fixture::new().await;
        let payload = b"\x00\x01binary\xffpayload";

        let response = fx.upload("data.json", payload).await.unwrap();
        assert_eq!(response.uploaded, 1);
        let file = &response.files[0];
        assert_eq!(file.uuid.len(), 32);
        assert_eq!(file.size, payload.len() as i64);
        assert_eq!(file.mime_type, "application/json");

        let (record, blob) = FileService::open_by_identifier(&fx.db, &fx.store, &file.uuid)
            .await
            .unwrap();
        assert_eq!(record.filename, "data.json");
        assert_eq!(read_blob(blob).await, payload);

        let (_, blob) = FileService::open_by_id(&fx.db, &fx.store, file.id).await.unwrap();
        assert_eq!(read_blob(blob).await, payload);
    }

    #[tokio::test]
    async fn test_multi_file_upload_is_listed_newest_first() {
        let fx = Fixture::new().await;
        let staged = vec![
            fx.stage("one.txt", b"1").await,
            fx.stage("two.txt", b"22").await,
            fx.stage("three.txt", b"333").await,
        ];

        let response = FileService::upload(&fx.db, &fx.store, &fx.limits, &staged)
            .await
            .unwrap();
        assert_eq!(response.uploaded, 3);

        let list = FileService::list_files(&fx.db, &FileFilter::default(), 1, 3)
            .await
            .unwrap();
        assert_eq!(list.total, 3);
        assert_eq!(list.pages, 1);
        let listed: Vec<_> = list.data.iter().map(|f| f.uuid.clone()).collect();
        let mut expected: Vec<_> = response.files.iter().map(|f| f.uuid.clone()).collect();
        expected.reverse();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn test_invalid_uploads_touch_nothing() {
        let fx = Fixture::new().await;

        let too_big = fx.upload("big.txt", &[b'x'; 65]).await;
        assert!(matches!(too_big, Err(AppError::BadRequest(_))));

        let bad_type = fx.upload("tool.exe", b"MZ").await;
        assert!(matches!(bad_type, Err(AppError::BadRequest(_))));

        let empty = fx.upload("empty.txt", b"").await;
        assert!(matches!(empty, Err(AppError::BadRequest(_))));

        // One bad file rejects the whole batch before any write
        let batch = vec![fx.stage("ok.txt", b"fine").await, fx.stage("bad.exe", b"MZ").await];
        let result = FileService::upload(&fx.db, &fx.store, &fx.limits, &batch).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));

        assert!(fx.blob_files().is_empty());
        assert_eq!(FileIndex::summary(&fx.db).await.unwrap().total_files, 0);
    }

    #[tokio::test]
    async fn test_index_failure_removes_orphan_blob() {
        let fx = Fixture::new().await;
        sqlx::query("DROP TABLE files").execute(fx.db.pool()).await.unwrap();

        let result = fx.upload("a.txt", b"0123456789").await;
        assert!(matches!(result, Err(AppError::Database(_))));
        assert!(fx.blob_files().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_not_repeatable() {
        let fx = Fixture::new().await;
        let uuid = fx.upload("a.txt", b"0123456789").await.unwrap().files[0].uuid.clone();

        let deleted = FileService::delete_file(&fx.db, &fx.store, &uuid).await.unwrap();
        assert!(deleted.deleted);
        assert!(fx.blob_files().is_empty());

        assert!(matches!(
            FileService::delete_file(&fx.db, &fx.store, &uuid).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            FileService::open_by_identifier(&fx.db, &fx.store, &uuid).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_succeeds_when_blob_already_gone() {
        let fx = Fixture::new().await;
        let uuid = fx.upload("a.txt", b"abc").await.unwrap().files[0].uuid.clone();
        fx.store.delete(&uuid).await.unwrap();

        // Reads of the dangling row fail at the blob layer
        assert!(matches!(
            FileService::open_by_identifier(&fx.db, &fx.store, &uuid).await,
            Err(AppError::NotFound(_))
        ));

        let deleted = FileService::delete_file(&fx.db, &fx.store, &uuid).await.unwrap();
        assert!(deleted.deleted);
        assert!(!FileIndex::exists(&fx.db, &uuid).await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_updates_row_and_blob() {
        let fx = Fixture::new().await;
        let original = fx.upload("a.txt", b"first").await.unwrap().files.remove(0);

        let upload = fx.stage("b.html", b"<p>second</p>").await;
        let replaced = FileService::replace_file(&fx.db, &fx.store, &fx.limits, &original.uuid, &upload)
            .await
            .unwrap();
        assert_eq!(replaced.id, original.id);
        assert_eq!(replaced.filename, "b.html");
        assert_eq!(replaced.mime_type, "text/html");

        let (record, blob) = FileService::open_by_identifier(&fx.db, &fx.store, &original.uuid)
            .await
            .unwrap();
        assert_eq!(record.size, 13);
        assert_eq!(read_blob(blob).await, b"<p>second</p>");
        assert_eq!(fx.blob_files().len(), 1);

        let missing = FileService::replace_file(
            &fx.db,
            &fx.store,
            &fx.limits,
            &media::new_identifier(),
            &upload,
        )
        .await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
        assert_eq!(fx.blob_files().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_replace_commit_keeps_previous_file() {
        let fx = Fixture::new().await;
        let original = fx.upload("a.txt", b"first").await.unwrap().files.remove(0);
        fail_commits_after_update(&fx.db).await;

        let upload = fx.stage("b.html", b"<p>second</p>").await;
        let result =
            FileService::replace_file(&fx.db, &fx.store, &fx.limits, &original.uuid, &upload).await;
        assert!(matches!(result, Err(AppError::Database(_))));

        let (record, blob) = FileService::open_by_identifier(&fx.db, &fx.store, &original.uuid)
            .await
            .unwrap();
        assert_eq!(record.filename, "a.txt");
        assert_eq!(record.size, 5);
        assert_eq!(read_blob(blob).await, b"first");
        assert_eq!(fx.blob_files().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_replace_commit_keeps_copy_in_older_shard() {
        let fx = Fixture::new().await;
        let today = Local::now().date_naive();
        let last_week = today.checked_sub_days(Days::new(7)).unwrap();

        let uuid = media::new_identifier();
        let staged = fx
            .store
            .stage_on(last_week, &uuid, Box::new(&b"last week"[..]))
            .await
            .unwrap();
        fx.store.publish(staged).await.unwrap();
        let mut conn = fx.db.pool().acquire().await.unwrap();
        FileIndex::insert(
            &mut conn,
            &NewFileRecord {
                uuid: uuid.clone(),
                filename: "old.txt".to_string(),
                size: 9,
                mime_type: "text/plain".to_string(),
                created_at: now(),
            },
        )
        .await
        .unwrap();
        drop(conn);

        fail_commits_after_update(&fx.db).await;
        let upload = fx.stage("new.txt", b"this week").await;
        let result = FileService::replace_file(&fx.db, &fx.store, &fx.limits, &uuid, &upload).await;
        assert!(matches!(result, Err(AppError::Database(_))));

        assert_eq!(fx.blob_files(), vec![fx.store.blob_path(last_week, &uuid)]);
        let (record, blob) = FileService::open_by_identifier(&fx.db, &fx.store, &uuid)
            .await
            .unwrap();
        assert_eq!(record.filename, "old.txt");
        assert_eq!(read_blob(blob).await, b"last week");

        // Once commits go through the blob moves to today's shard
        sqlx::query("DROP TRIGGER files_update_guard")
            .execute(fx.db.pool())
            .await
            .unwrap();
        let replaced = FileService::replace_file(&fx.db, &fx.store, &fx.limits, &uuid, &upload)
            .await
            .unwrap();
        assert_eq!(replaced.filename, "new.txt");
        assert_eq!(fx.blob_files(), vec![fx.store.blob_path(today, &uuid)]);
    }

    #[tokio::test]
    async fn test_created_at_is_stamped_at_insert() {
        let fx = Fixture::new().await;
        let staged = vec![fx.stage("one.txt", b"1").await, fx.stage("two.txt", b"22").await];
        let response = FileService::upload(&fx.db, &fx.store, &fx.limits, &staged)
            .await
            .unwrap();

        // Both rows are stamped after the last blob was written
        let last_blob = fx
            .blob_files()
            .into_iter()
            .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(response.files[1].uuid.as_str()))
            .unwrap();
        let written: DateTime<Utc> = std::fs::metadata(last_blob).unwrap().modified().unwrap().into();

        for file in &response.files {
            let created = DateTime::parse_from_rfc3339(&file.created_at)
                .unwrap()
                .with_timezone(&Utc);
            assert!(created >= written, "{} < {}", created, written);
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_only_orphans() {
        let fx = Fixture::new().await;
        let kept = fx.upload("a.txt", b"indexed").await.unwrap().files.remove(0);

        let orphan = media::new_identifier();
        fx.store.save(&orphan, Box::new(&b"no row"[..])).await.unwrap();

        let young = FileService::sweep_orphans(&fx.db, &fx.store, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(young.scanned, 2);
        assert_eq!(young.removed_orphans, 0);

        let report = FileService::sweep_orphans(&fx.db, &fx.store, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(report.removed_orphans, 1);
        assert!(matches!(fx.store.open(&orphan).await, Err(AppError::NotFound(_))));
        assert!(fx.store.open(&kept.uuid).await.is_ok());
    }
}
