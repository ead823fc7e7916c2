use super::{ApiResult, AppState};
use crate::errors::StoreError;
use crate::model::*;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum InsertBody {
    Many(Vec<Document>),
    One(Document),
}

#[derive(Debug, Deserialize)]
pub struct CountParams {
    /// Filter document as JSON text.
    pub filter: Option<String>,
}

// POST /collections/:collection/documents
pub async fn insert(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(body): Json<InsertBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let docs = match body {
        InsertBody::Many(docs) => docs,
        InsertBody::One(doc) => vec![doc],
    };
    let inserted = state.db.insert_many(&collection, docs)?;
    Ok((StatusCode::CREATED, Json(json!({ "insertedIds": inserted }))))
}

// GET /collections/:collection/documents/:id
pub async fn get(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> ApiResult<Json<Document>> {
    Ok(Json(state.db.get(&collection, &id)?))
}

// PATCH /collections/:collection/documents/:id
pub async fn update(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(patch): Json<DocumentPatch>,
) -> ApiResult<Json<Document>> {
    Ok(Json(state.db.update(&collection, &id, patch)?))
}

// DELETE /collections/:collection/documents/:id
pub async fn delete(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.db.delete(&collection, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

// GET /collections/:collection/count?filter={...}
pub async fn count(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(params): Query<CountParams>,
) -> ApiResult<Json<Value>> {
    let filter: Option<Value> = match params.filter.as_deref() {
        Some(text) => Some(
            serde_json::from_str(text)
                .map_err(|e| StoreError::validation(format!("filter is not valid JSON: {e}")))?,
        ),
        None => None,
    };
    let n = state.db.count(&collection, filter.as_ref())?;
    Ok(Json(json!({ "n": n })))
}

// POST /collections/:collection/find
pub async fn find(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(req): Json<FindRequest>,
) -> ApiResult<Json<Value>> {
    let documents = state.db.find(&collection, &req)?;
    Ok(Json(json!({ "documents": documents })))
}
