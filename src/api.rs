//! HTTP surface: output artifacts and the file-id index.

use crate::contents::FileIdIndexer;
use crate::outputs::OutputStore;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct ApiState {
    pub outputs: Arc<OutputStore>,
    pub indexer: Arc<dyn FileIdIndexer>,
}

pub fn router(outputs: Arc<OutputStore>, indexer: Arc<dyn FileIdIndexer>) -> Router {
    Router::new()
        .route("/api/outputs/:file_id/:cell_id/:index", get(get_output))
        .route("/api/fileid/index", post(index_path))
        .with_state(ApiState { outputs, indexer })
}

async fn get_output(
    State(state): State<ApiState>,
    Path((file_id, cell_id, index)): Path<(String, String, i64)>,
) -> Result<Json<Value>, StatusCode> {
    state
        .outputs
        .read(&file_id, &cell_id, index)
        .await
        .map(Json)
        .map_err(|e| {
            if e.is_not_found() {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })
}

#[derive(Serialize)]
struct IndexResponse {
    id: String,
    path: String,
}

async fn index_path(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<IndexResponse>, StatusCode> {
    let path = params
        .get("path")
        .filter(|p| !p.is_empty())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let id = state.indexer.index(path);
    Ok(Json(IndexResponse {
        id,
        path: path.clone(),
    }))
}
