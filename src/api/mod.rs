use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    serve, Json, Router,
};
use crate::errors::StoreError;
use crate::metrics::get_metrics_collector;
use crate::{admin, Config, Database};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;

mod documents;
mod indices;
mod vectors;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
}

/// A [`StoreError`] rendered as an HTTP response.
pub struct ApiError(pub StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            StoreError::Validation(_) | StoreError::DimensionMismatch { .. } | StoreError::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            StoreError::NotFound(_) | StoreError::IndexNotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Conflict { .. } => StatusCode::CONFLICT,
            StoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            StoreError::Validation(_) => "ValidationException",
            StoreError::DimensionMismatch { .. } => "DimensionMismatch",
            StoreError::Serialization(_) => "SerializationException",
            StoreError::NotFound(_) => "NotFoundException",
            StoreError::IndexNotFound { .. } => "IndexNotFound",
            StoreError::Conflict { .. } => "ConflictException",
            StoreError::Storage(_) => "InternalServerException",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }
        let body = json!({
            "ok": 0,
            "code": self.code(),
            "errmsg": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

// GET /health
async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy", "version": crate::VERSION}))
}

// GET /metrics
async fn metrics() -> impl IntoResponse {
    let collector = get_metrics_collector();
    Json(json!({
        "operations": collector.summaries(),
        "values": collector.values(),
    }))
}

// POST /runCommand
async fn run_command(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult<Json<Value>> {
    let reply = match body {
        Value::Array(_) => Value::Array(admin::run_script(&state.db, &body).await?),
        _ => admin::run_command(&state.db, &body).await?,
    };
    Ok(Json(reply))
}

pub fn router(db: Arc<Database>) -> Router {
    let state = AppState { db };
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/runCommand", post(run_command))
        .route(
            "/collections/:collection/indexes",
            get(indices::list).post(indices::create),
        )
        .route(
            "/collections/:collection/indexes/:name",
            axum::routing::delete(indices::drop_index),
        )
        .route(
            "/collections/:collection/indexes/:name/rebuild",
            post(indices::rebuild),
        )
        .route("/collections/:collection/documents", post(documents::insert))
        .route(
            "/collections/:collection/documents/:id",
            get(documents::get).patch(documents::update).delete(documents::delete),
        )
        .route("/collections/:collection/count", get(documents::count))
        .route("/collections/:collection/find", post(documents::find))
        .route("/collections/:collection/search", post(vectors::search))
        .with_state(state)
}

pub async fn run(config: &Config, db: Arc<Database>) -> anyhow::Result<()> {
    let app = router(db);
    let listener = TcpListener::bind(&config.bind).await?;
    tracing::info!("API listening on {}", config.bind);
    serve(listener, app).await?;
    Ok(())
}
