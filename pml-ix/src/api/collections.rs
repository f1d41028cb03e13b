//! Smart collections API handlers
//!
//! GET /collections, POST /collections/refresh

use crate::AppState;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

/// One collection in the listing
#[derive(Debug, Serialize)]
pub struct CollectionSummary {
    pub name: String,
    pub count: usize,
    pub members: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub index_version: u64,
}

pub fn collection_routes() -> Router<AppState> {
    Router::new()
        .route("/collections", get(list))
        .route("/collections/refresh", post(refresh))
}

/// GET /collections - cached collections in rule order
pub async fn list(State(state): State<AppState>) -> Json<Vec<CollectionSummary>> {
    let summaries = state
        .collections
        .list()
        .into_iter()
        .map(|collection| CollectionSummary {
            name: collection.name,
            count: collection.members.len(),
            members: collection.members.into_iter().collect(),
        })
        .collect();
    Json(summaries)
}

/// POST /collections/refresh - explicit recompute against the live index
pub async fn refresh(State(state): State<AppState>) -> Json<RefreshResponse> {
    let index_version = state.collections.recompute();
    Json(RefreshResponse { index_version })
}
