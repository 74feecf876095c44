use async_trait::async_trait;
use chrono::{Days, Local, NaiveDate};
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{AppError, Result};
use crate::storage::{Blob, BlobEntry, BlobReader, BlobStore, BlobSwap, StagedBlob};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TEMP_SUFFIX: &str = ".part";

// ENOSPC and EDQUOT on Linux
const QUOTA_ERRNOS: [i32; 2] = [28, 122];

/// Local file system blob store.
///
/// Blobs live at `base/<upload-date>/<first 2 chars>/<identifier>`. The upload
/// date is not recorded anywhere else, so lookups walk back day by day from
/// today and fall back to scanning the whole tree.
pub struct LocalBlobStore {
    base_path: PathBuf,
    search_horizon_days: u32,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>, search_horizon_days: u32) -> Self {
        Self {
            base_path: base_path.into(),
            search_horizon_days,
        }
    }

    #[cfg(test)]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    fn shard_dir(&self, date: NaiveDate, identifier: &str) -> PathBuf {
        self.base_path
            .join(date.format(DATE_FORMAT).to_string())
            .join(&identifier[..2])
    }

    /// Final location of `identifier` when written on `date`
    pub fn blob_path(&self, date: NaiveDate, identifier: &str) -> PathBuf {
        self.shard_dir(date, identifier).join(identifier)
    }

    pub(crate) async fn stage_on(
        &self,
        date: NaiveDate,
        identifier: &str,
        mut reader: BlobReader,
    ) -> Result<StagedBlob> {
        validate_identifier(identifier)?;

        let dir = self.shard_dir(date, identifier);
        let final_path = dir.join(identifier);
        let temp_path = temp_path_beside(&final_path, identifier);

        let mut file = create_file(&dir, &temp_path)
            .await
            .map_err(|e| write_error(e, "create", identifier))?;

        let size = match copy_to_file(&mut reader, &mut file).await {
            Ok(size) => size,
            Err(e) => {
                drop(file);
                remove_quietly(&temp_path).await;
                self.prune_empty_parents(&temp_path).await;
                return Err(write_error(e, "write", identifier));
            }
        };

        tracing::debug!("Staged blob {} ({} bytes) at {:?}", identifier, size, temp_path);
        Ok(StagedBlob {
            identifier: identifier.to_string(),
            size,
            temp_path,
            final_path,
        })
    }

    /// Find the blob for `identifier`, searching back from `today`
    pub(crate) async fn locate_from(
        &self,
        today: NaiveDate,
        identifier: &str,
    ) -> Result<Option<PathBuf>> {
        validate_identifier(identifier)?;

        for days_ago in 0..=u64::from(self.search_horizon_days) {
            let Some(date) = today.checked_sub_days(Days::new(days_ago)) else {
                break;
            };
            let candidate = self.blob_path(date, identifier);
            match fs::metadata(&candidate).await {
                Ok(meta) if meta.is_file() => return Ok(Some(candidate)),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(read_error(e, "stat", identifier)),
            }
        }

        tracing::warn!(
            identifier,
            horizon_days = self.search_horizon_days,
            "Blob not in recent shards, falling back to full scan"
        );
        self.full_scan(identifier).await
    }

    async fn locate(&self, identifier: &str) -> Result<Option<PathBuf>> {
        self.locate_from(Self::today(), identifier).await
    }

    async fn full_scan(&self, identifier: &str) -> Result<Option<PathBuf>> {
        let base = self.base_path.clone();
        let identifier = identifier.to_string();
        tokio::task::spawn_blocking(move || scan_for(&base, &identifier))
            .await
            .map_err(|e| AppError::Internal(format!("Blob scan task failed: {}", e)))
    }

    /// Remove the prefix folder, then the date folder, while they are empty
    async fn prune_empty_parents(&self, blob_path: &Path) {
        let mut current = blob_path.parent().map(Path::to_path_buf);
        for _ in 0..2 {
            let Some(dir) = current else { break };
            if dir == self.base_path || !dir.starts_with(&self.base_path) {
                break;
            }
            match fs::read_dir(&dir).await {
                Ok(mut entries) => match entries.next_entry().await {
                    Ok(None) => {}
                    _ => break,
                },
                Err(_) => break,
            }
            // A concurrent write may have landed since the check; remove_dir refuses then.
            if let Err(e) = fs::remove_dir(&dir).await {
                tracing::debug!("Kept directory {:?}: {}", dir, e);
                break;
            }
            current = dir.parent().map(Path::to_path_buf);
        }
    }

    async fn remove_blob_file(&self, path: &Path, identifier: &str) -> Result<()> {
        fs::remove_file(path)
            .await
            .map_err(|e| read_error(e, "delete", identifier))?;
        tracing::debug!("Deleted blob {:?}", path);
        self.prune_empty_parents(path).await;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn stage(&self, identifier: &str, reader: BlobReader) -> Result<StagedBlob> {
        self.stage_on(Self::today(), identifier, reader).await
    }

    async fn publish(&self, staged: StagedBlob) -> Result<()> {
        if let Err(e) = fs::rename(&staged.temp_path, &staged.final_path).await {
            let err = write_error(e, "publish", &staged.identifier);
            self.discard(staged).await;
            return Err(err);
        }
        tracing::debug!("Saved blob to {:?}", staged.final_path);
        Ok(())
    }

    async fn swap(&self, staged: StagedBlob) -> Result<BlobSwap> {
        let identifier = staged.identifier.clone();
        let located = match self.locate(&identifier).await {
            Ok(located) => located,
            Err(e) => {
                self.discard(staged).await;
                return Err(e);
            }
        };

        // Park the current copy under a temporary name in its own shard
        let previous = match located {
            Some(original) => {
                let parked = temp_path_beside(&original, &identifier);
                if let Err(e) = fs::rename(&original, &parked).await {
                    self.discard(staged).await;
                    return Err(write_error(e, "park", &identifier));
                }
                Some((original, parked))
            }
            None => None,
        };

        let current = staged.final_path.clone();
        if let Err(e) = self.publish(staged).await {
            if let Some((original, parked)) = &previous {
                if let Err(restore) = fs::rename(parked, original).await {
                    tracing::error!(
                        identifier = identifier.as_str(),
                        "Failed to restore parked blob {:?}: {}",
                        parked,
                        restore
                    );
                }
            }
            return Err(e);
        }

        tracing::debug!("Swapped blob {} into {:?}", identifier, current);
        Ok(BlobSwap {
            identifier,
            current,
            previous,
        })
    }

    async fn confirm_swap(&self, swap: BlobSwap) {
        if let Some((_, parked)) = swap.previous {
            remove_quietly(&parked).await;
            self.prune_empty_parents(&parked).await;
        }
    }

    async fn revert_swap(&self, swap: BlobSwap) -> Result<()> {
        match fs::remove_file(&swap.current).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(write_error(e, "revert", &swap.identifier)),
        }

        if let Some((original, parked)) = &swap.previous {
            fs::rename(parked, original)
                .await
                .map_err(|e| write_error(e, "restore", &swap.identifier))?;
        }
        self.prune_empty_parents(&swap.current).await;

        tracing::debug!("Reverted blob swap for {}", swap.identifier);
        Ok(())
    }

    async fn discard(&self, staged: StagedBlob) {
        remove_quietly(&staged.temp_path).await;
        self.prune_empty_parents(&staged.temp_path).await;
    }

    async fn open(&self, identifier: &str) -> Result<Blob> {
        let path = self
            .locate(identifier)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Blob not found: {}", identifier)))?;

        // The blob can disappear between locate and open when a delete races us.
        let file = fs::File::open(&path)
            .await
            .map_err(|e| read_error(e, "open", identifier))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| read_error(e, "stat", identifier))?
            .len();

        Ok(Blob {
            reader: Box::new(file),
            size,
        })
    }

    async fn delete(&self, identifier: &str) -> Result<()> {
        let path = self
            .locate(identifier)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Blob not found: {}", identifier)))?;
        self.remove_blob_file(&path, identifier).await
    }

    async fn list(&self) -> Result<Vec<BlobEntry>> {
        let base = self.base_path.clone();
        tokio::task::spawn_blocking(move || {
            shard_files(&base)
                .filter_map(|(path, modified)| {
                    let name = path.file_name()?.to_str()?;
                    let prefix = path.parent()?.file_name()?.to_str()?;
                    (is_valid_identifier(name) && name.starts_with(prefix)).then(|| BlobEntry {
                        identifier: name.to_string(),
                        modified,
                    })
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| AppError::Internal(format!("Blob listing task failed: {}", e)))
    }

    async fn sweep_temp(&self, older_than: Duration) -> Result<usize> {
        let base = self.base_path.clone();
        let stale: Vec<PathBuf> = tokio::task::spawn_blocking(move || {
            let now = SystemTime::now();
            shard_files(&base)
                .filter(|(path, modified)| {
                    let is_temp = path
                        .file_name()
                        .and_then(OsStr::to_str)
                        .map(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX))
                        .unwrap_or(false);
                    let age = now.duration_since(*modified).unwrap_or_default();
                    is_temp && age >= older_than
                })
                .map(|(path, _)| path)
                .collect()
        })
        .await
        .map_err(|e| AppError::Internal(format!("Temp sweep task failed: {}", e)))?;

        let mut removed = 0;
        for path in stale {
            match fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    self.prune_empty_parents(&path).await;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove temp file {:?}: {}", path, e),
            }
        }
        Ok(removed)
    }

    fn storage_type(&self) -> &'static str {
        "local"
    }
}

fn is_valid_identifier(identifier: &str) -> bool {
    identifier.len() >= 2 && identifier.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn validate_identifier(identifier: &str) -> Result<()> {
    if is_valid_identifier(identifier) {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "Invalid blob identifier: {}",
            identifier
        )))
    }
}

fn is_quota_error(e: &io::Error) -> bool {
    e.raw_os_error()
        .map(|code| QUOTA_ERRNOS.contains(&code))
        .unwrap_or(false)
}

fn write_error(e: io::Error, op: &str, identifier: &str) -> AppError {
    if is_quota_error(&e) {
        AppError::QuotaExceeded(format!("Failed to {} blob {}: {}", op, identifier, e))
    } else {
        AppError::Storage(format!("Failed to {} blob {}: {}", op, identifier, e))
    }
}

fn read_error(e: io::Error, op: &str, identifier: &str) -> AppError {
    if e.kind() == io::ErrorKind::NotFound {
        AppError::NotFound(format!("Blob not found: {}", identifier))
    } else {
        write_error(e, op, identifier)
    }
}

/// Hidden temporary name next to `path`, picked up by the temp sweep
fn temp_path_beside(path: &Path, identifier: &str) -> PathBuf {
    path.with_file_name(format!(
        ".{}.{}{}",
        identifier,
        Uuid::new_v4().simple(),
        TEMP_SUFFIX
    ))
}

async fn create_file(dir: &Path, path: &Path) -> io::Result<fs::File> {
    let mut retried = false;
    loop {
        fs::create_dir_all(dir).await?;
        match fs::File::create(path).await {
            Ok(file) => return Ok(file),
            // The shard directory was pruned by a concurrent delete
            Err(e) if e.kind() == io::ErrorKind::NotFound && !retried => retried = true,
            Err(e) => return Err(e),
        }
    }
}

async fn copy_to_file(reader: &mut BlobReader, file: &mut fs::File) -> io::Result<u64> {
    let size = tokio::io::copy(reader, file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(size)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

/// Files exactly at `<date>/<prefix>/<name>` below `base`
fn shard_files(base: &Path) -> impl Iterator<Item = (PathBuf, SystemTime)> {
    WalkDir::new(base)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((entry.into_path(), modified))
        })
}

/// Recursive search for `*/<prefix>/<identifier>` anywhere under `base`
fn scan_for(base: &Path, identifier: &str) -> Option<PathBuf> {
    let prefix = OsStr::new(&identifier[..2]);
    WalkDir::new(base)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| {
            entry.file_type().is_file()
                && entry.file_name() == OsStr::new(identifier)
                && entry.path().parent().and_then(Path::file_name) == Some(prefix)
        })
        .map(|entry| entry.into_path())
}
