use super::{ApiResult, AppState};
use crate::model::*;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct CreateIndexRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub definition: IndexDefinition,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildRequest {
    #[serde(default)]
    pub num_lists: Option<usize>,
}

// GET /collections/:collection/indexes
pub async fn list(State(state): State<AppState>, Path(collection): Path<String>) -> Json<Value> {
    let indexes = state.db.list_indexes(&collection);
    Json(json!({ "collection": collection, "indexes": indexes }))
}

// POST /collections/:collection/indexes
pub async fn create(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(req): Json<CreateIndexRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let name = req.name.unwrap_or_else(|| req.definition.default_name());
    let created = state.db.create_index(&collection, &name, req.definition).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(json!({ "name": name, "created": created }))))
}

// DELETE /collections/:collection/indexes/:name
pub async fn drop_index(
    State(state): State<AppState>,
    Path((collection, name)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    state.db.drop_index(&collection, &name).await?;
    Ok(Json(json!({ "dropped": name })))
}

// POST /collections/:collection/indexes/:name/rebuild
pub async fn rebuild(
    State(state): State<AppState>,
    Path((collection, name)): Path<(String, String)>,
    body: Option<Json<RebuildRequest>>,
) -> ApiResult<Json<Value>> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let stats = state.db.rebuild_index(&collection, &name, req.num_lists).await?;
    Ok(Json(json!({ "name": name, "stats": stats })))
}
