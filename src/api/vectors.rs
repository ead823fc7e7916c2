use super::{ApiResult, AppState};
use crate::metrics::get_metrics_collector;
use crate::model::*;
use axum::{
    extract::{Path, State},
    Json,
};

// POST /collections/:collection/search
pub async fn search(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<Json<SearchResponse>> {
    let _measurement = crate::measure_operation!("api.search");
    get_metrics_collector().track_metric("api.search.vector_dimension", req.vector.len() as f64);
    let response = state.db.search(&collection, req).await?;
    Ok(Json(response))
}
