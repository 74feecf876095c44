use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{FileFilter, FileRecord, NewFileRecord, StatsSummary, TypeStat};

const RECORD_COLUMNS: &str = "SELECT id, uuid, filename, size, mime_type, created_at FROM files";

/// Metadata index over the `files` table
pub struct FileIndex;

impl FileIndex {
    /// Insert a record, returning it with its assigned id
    pub async fn insert(conn: &mut SqliteConnection, new: &NewFileRecord) -> Result<FileRecord> {
        let result = sqlx::query(
            r#"
            INSERT INTO files (uuid, filename, size, mime_type, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.uuid)
        .bind(&new.filename)
        .bind(new.size)
        .bind(&new.mime_type)
        .bind(&new.created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| constraint_error(e, &new.uuid))?;

        Ok(FileRecord {
            id: result.last_insert_rowid(),
            uuid: new.uuid.clone(),
            filename: new.filename.clone(),
            size: new.size,
            mime_type: new.mime_type.clone(),
            created_at: new.created_at.clone(),
        })
    }

    /// Get a record by identifier
    pub async fn get_by_identifier(db: &Database, uuid: &str) -> Result<FileRecord> {
        sqlx::query_as(&format!("{} WHERE uuid = ?", RECORD_COLUMNS))
            .bind(uuid)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))
    }

    /// Get a record by numeric id
    pub async fn get_by_id(db: &Database, id: i64) -> Result<FileRecord> {
        sqlx::query_as(&format!("{} WHERE id = ?", RECORD_COLUMNS))
            .bind(id)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))
    }

    pub async fn exists(db: &Database, uuid: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM files WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(db.pool())
            .await?;
        Ok(found.is_some())
    }

    /// One page of records, newest first, plus the size of the filtered set
    pub async fn list(
        db: &Database,
        filter: &FileFilter,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<FileRecord>, i64)> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM files");
        push_filters(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(db.pool()).await?;

        let offset = (page.max(1) - 1) * page_size;
        let mut query = QueryBuilder::<Sqlite>::new(RECORD_COLUMNS);
        push_filters(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(page_size)
            .push(" OFFSET ")
            .push_bind(offset);
        let records: Vec<FileRecord> = query.build_query_as().fetch_all(db.pool()).await?;

        Ok((records, total))
    }

    /// Replace the descriptive fields of a record, returning rows affected
    pub async fn update(
        conn: &mut SqliteConnection,
        uuid: &str,
        filename: &str,
        size: i64,
        mime_type: &str,
    ) -> Result<u64> {
        let result = sqlx::query("UPDATE files SET filename = ?, size = ?, mime_type = ? WHERE uuid = ?")
            .bind(filename)
            .bind(size)
            .bind(mime_type)
            .bind(uuid)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete a record, returning rows affected (0 when already absent)
    pub async fn delete(conn: &mut SqliteConnection, uuid: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM files WHERE uuid = ?")
            .bind(uuid)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn summary(db: &Database) -> Result<StatsSummary> {
        let summary = sqlx::query_as(
            "SELECT COUNT(*) AS total_files, COALESCE(SUM(size), 0) AS total_size FROM files",
        )
        .fetch_one(db.pool())
        .await?;
        Ok(summary)
    }

    pub async fn by_type(db: &Database) -> Result<Vec<TypeStat>> {
        let stats = sqlx::query_as(
            r#"
            SELECT mime_type, COUNT(*) AS file_count, COALESCE(SUM(size), 0) AS total_size
            FROM files
            GROUP BY mime_type
            ORDER BY file_count DESC, mime_type ASC
            "#,
        )
        .fetch_all(db.pool())
        .await?;
        Ok(stats)
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filter: &FileFilter) {
    let mut separator = " WHERE ";
    if let Some(mime_type) = &filter.mime_type {
        builder
            .push(separator)
            .push("mime_type = ")
            .push_bind(mime_type.clone());
        separator = " AND ";
    }
    if let Some(search) = &filter.search {
        builder
            .push(separator)
            .push("filename LIKE ")
            .push_bind(like_pattern(search))
            .push(" ESCAPE '\\'");
    }
}

/// `%term%` with LIKE wildcards in the term escaped
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn constraint_error(e: sqlx::Error, uuid: &str) -> AppError {
    match e.as_database_error() {
        Some(db_err) if db_err.is_unique_violation() => {
            AppError::Conflict(format!("Duplicate file identifier: {}", uuid))
        }
        _ => AppError::Database(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_db(dir: &TempDir) -> Database {
        let db = Database::new(dir.path().join("index.db")).await.unwrap();
        db.run_migrations().await.unwrap();
        db
    }

    fn record(uuid: &str, filename: &str, size: i64, mime_type: &str, second: u32) -> NewFileRecord {
        NewFileRecord {
            uuid: uuid.to_string(),
            filename: filename.to_string(),
            size,
            mime_type: mime_type.to_string(),
            created_at: format!("2026-10-19T10:00:{:02}.000000Z", second),
        }
    }

    async fn insert(db: &Database, new: NewFileRecord) -> FileRecord {
        let mut conn = db.pool().acquire().await.unwrap();
        FileIndex::insert(&mut conn, &new).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;

        let inserted = insert(&db, record("aa11", "a.txt", 10, "text/plain", 1)).await;
        assert!(inserted.id > 0);

        let by_uuid = FileIndex::get_by_identifier(&db, "aa11").await.unwrap();
        assert_eq!(by_uuid.id, inserted.id);
        assert_eq!(by_uuid.filename, "a.txt");

        let by_id = FileIndex::get_by_id(&db, inserted.id).await.unwrap();
        assert_eq!(by_id.uuid, "aa11");

        assert!(matches!(
            FileIndex::get_by_identifier(&db, "missing").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            FileIndex::get_by_id(&db, 9999).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_identifier_is_conflict() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        insert(&db, record("dup0", "a.txt", 1, "text/plain", 1)).await;

        let mut conn = db.pool().acquire().await.unwrap();
        let result = FileIndex::insert(&mut conn, &record("dup0", "b.txt", 2, "text/plain", 2)).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_list_newest_first_with_total() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        for i in 0..5u32 {
            insert(&db, record(&format!("id{i:02}"), &format!("f{i}.txt"), 1, "text/plain", i)).await;
        }

        let (all, total) = FileIndex::list(&db, &FileFilter::default(), 1, 5).await.unwrap();
        assert_eq!(total, 5);
        let uuids: Vec<_> = all.iter().map(|r| r.uuid.as_str()).collect();
        assert_eq!(uuids, ["id04", "id03", "id02", "id01", "id00"]);

        let (page, total) = FileIndex::list(&db, &FileFilter::default(), 2, 2).await.unwrap();
        assert_eq!(total, 5);
        let uuids: Vec<_> = page.iter().map(|r| r.uuid.as_str()).collect();
        assert_eq!(uuids, ["id02", "id01"]);

        let (beyond, total) = FileIndex::list(&db, &FileFilter::default(), 9, 2).await.unwrap();
        assert!(beyond.is_empty());
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        insert(&db, record("t1", "Report.pdf", 3, "application/pdf", 1)).await;
        insert(&db, record("t2", "notes.txt", 4, "text/plain", 2)).await;
        insert(&db, record("t3", "report_100%.txt", 5, "text/plain", 3)).await;

        let by_type = FileFilter {
            mime_type: Some("text/plain".into()),
            search: None,
        };
        let (records, total) = FileIndex::list(&db, &by_type, 1, 10).await.unwrap();
        assert_eq!(total, 2);
        assert!(records.iter().all(|r| r.mime_type == "text/plain"));

        let by_name = FileFilter {
            mime_type: None,
            search: Some("report".into()),
        };
        let (_, total) = FileIndex::list(&db, &by_name, 1, 10).await.unwrap();
        assert_eq!(total, 2);

        let literal_percent = FileFilter {
            mime_type: Some("text/plain".into()),
            search: Some("100%".into()),
        };
        let (records, total) = FileIndex::list(&db, &literal_percent, 1, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(records[0].uuid, "t3");
    }

    #[tokio::test]
    async fn test_delete_reports_affected_rows() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        insert(&db, record("gone", "a.txt", 1, "text/plain", 1)).await;

        let mut conn = db.pool().acquire().await.unwrap();
        assert_eq!(FileIndex::delete(&mut conn, "gone").await.unwrap(), 1);
        assert_eq!(FileIndex::delete(&mut conn, "gone").await.unwrap(), 0);
        drop(conn);
        assert!(!FileIndex::exists(&db, "gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_aggregates() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;

        let empty = FileIndex::summary(&db).await.unwrap();
        assert_eq!(empty.total_files, 0);
        assert_eq!(empty.total_size, 0);
        assert!(FileIndex::by_type(&db).await.unwrap().is_empty());

        insert(&db, record("s1", "a.png", 100, "image/png", 1)).await;
        insert(&db, record("s2", "b.txt", 10, "text/plain", 2)).await;
        insert(&db, record("s3", "c.txt", 20, "text/plain", 3)).await;

        let summary = FileIndex::summary(&db).await.unwrap();
        assert_eq!(summary.total_files, 3);
        assert_eq!(summary.total_size, 130);

        let stats = FileIndex::by_type(&db).await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].mime_type, "text/plain");
        assert_eq!(stats[0].file_count, 2);
        assert_eq!(stats[0].total_size, 30);
        assert_eq!(stats[1].mime_type, "image/png");
    }
}
