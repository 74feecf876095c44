use axum::{extract::State, Json};

use crate::error::{ApiResponse, Result};
use crate::models::{StatsSummary, TypeStatsResponse};
use crate::services::FileIndex;
use crate::AppState;

/// GET /stats/summary
pub async fn summary(State(state): State<AppState>) -> Result<Json<ApiResponse<StatsSummary>>> {
    let summary = FileIndex::summary(&state.db).await?;
    Ok(Json(ApiResponse::success(summary)))
}

/// Per media type counts, largest group first
/// GET /stats/by-type
pub async fn by_type(State(state): State<AppState>) -> Result<Json<ApiResponse<TypeStatsResponse>>> {
    let stats = FileIndex::by_type(&state.db).await?;
    Ok(Json(ApiResponse::success(TypeStatsResponse { stats })))
}
