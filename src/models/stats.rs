use serde::Serialize;
use sqlx::FromRow;

/// Totals over every stored file
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StatsSummary {
    pub total_files: i64,
    pub total_size: i64,
}

/// Totals for one media type
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TypeStat {
    #[serde(rename = "type")]
    pub mime_type: String,
    pub file_count: i64,
    pub total_size: i64,
}

#[derive(Debug, Serialize)]
pub struct TypeStatsResponse {
    pub stats: Vec<TypeStat>,
}
