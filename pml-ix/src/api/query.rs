//! Search API handlers
//!
//! POST /search with free text plus structured filters

use crate::error::ApiResult;
use crate::query::FilterSet;
use crate::AppState;
use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// POST /search request
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub text: String,
    #[serde(default)]
    pub filters: FilterSet,
}

/// POST /search response: ordered item ids
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub items: Vec<Uuid>,
    pub count: usize,
}

pub fn query_routes() -> Router<AppState> {
    Router::new().route("/search", post(search))
}

/// POST /search - malformed filter combinations are rejected with 400
pub async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<Json<SearchResponse>> {
    let items = state.query.search(&request.text, &request.filters)?;
    tracing::debug!(text = %request.text, hits = items.len(), "Search executed");
    let count = items.len();
    Ok(Json(SearchResponse { items, count }))
}
