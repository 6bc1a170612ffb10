use axum::{extract::State, Extension, Json};
use voc_core::PipelineStats;

use crate::middleware::RequestId;

use super::{map_scheduler_error, ApiError, ApiResponse, AppState, ResponseMeta};

pub(super) async fn pipeline_stats(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
) -> Result<Json<ApiResponse<PipelineStats>>, ApiError> {
    let stats = state
        .scheduler
        .pipeline_stats()
        .await
        .map_err(|e| map_scheduler_error(req_id.0.clone(), &e))?;

    Ok(Json(ApiResponse {
        data: stats,
        meta: ResponseMeta::new(req_id.0),
    }))
}
