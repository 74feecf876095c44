use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Metadata row for one stored blob
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FileRecord {
    pub id: i64,
    /// Random 128-bit hex identifier addressing the blob
    pub uuid: String,
    pub filename: String,
    pub size: i64,
    pub mime_type: String,
    pub created_at: String,
}

/// Fields of a record that does not exist yet
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub uuid: String,
    pub filename: String,
    pub size: i64,
    pub mime_type: String,
    pub created_at: String,
}

/// File as returned to API clients
#[derive(Debug, Clone, Serialize)]
pub struct FileResponse {
    pub id: i64,
    pub uuid: String,
    pub filename: String,
    pub size: i64,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub created_at: String,
}

impl From<FileRecord> for FileResponse {
    fn from(record: FileRecord) -> Self {
        Self {
            id: record.id,
            uuid: record.uuid,
            filename: record.filename,
            size: record.size,
            mime_type: record.mime_type,
            created_at: record.created_at,
        }
    }
}

/// Upload result
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub uploaded: usize,
    pub files: Vec<FileResponse>,
}

/// Paginated file list
#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub data: Vec<FileResponse>,
    pub total: i64,
    pub page: i64,
    pub pages: i64,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
    pub uuid: String,
}

/// Orphan sweep report
#[derive(Debug, Default, Serialize)]
pub struct SweepResponse {
    pub scanned: usize,
    pub removed_orphans: usize,
    pub removed_temp: usize,
}

/// File list query parameters
#[derive(Debug, Default, Deserialize)]
pub struct FileQuery {
    pub page: Option<i64>,
    #[serde(rename = "pageSize")]
    pub page_size: Option<i64>,
    #[serde(rename = "type")]
    pub mime_type: Option<String>,
    pub search: Option<String>,
}

/// Optional filters applied to listing
#[derive(Debug, Default, Clone)]
pub struct FileFilter {
    pub mime_type: Option<String>,
    pub search: Option<String>,
}

impl FileQuery {
    pub const DEFAULT_PAGE_SIZE: i64 = 10;
    pub const MAX_PAGE_SIZE: i64 = 100;

    /// 1-based page, never below 1
    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn page_size(&self) -> i64 {
        self.page_size
            .unwrap_or(Self::DEFAULT_PAGE_SIZE)
            .clamp(1, Self::MAX_PAGE_SIZE)
    }

    pub fn filter(&self) -> FileFilter {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        FileFilter {
            mime_type: non_empty(&self.mime_type).map(|t| t.to_ascii_lowercase()),
            search: non_empty(&self.search),
        }
    }
}
