//! Item API handlers
//!
//! GET /items/{id}, POST /items/{id}/favorite

use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use pml_common::models::MediaItem;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct FavoriteResponse {
    pub item_id: Uuid,
    pub favorite: bool,
}

pub fn item_routes() -> Router<AppState> {
    Router::new()
        .route("/items/:id", get(get_item))
        .route("/items/:id/favorite", post(toggle_favorite))
}

/// GET /items/{id}
pub async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MediaItem>> {
    let item = state
        .index
        .get(id)
        .ok_or_else(|| ApiError::NotFound(format!("item {}", id)))?;
    Ok(Json(item))
}

/// POST /items/{id}/favorite - direct user edit, index-visible immediately
pub async fn toggle_favorite(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<FavoriteResponse>> {
    let favorite = state.index.favorite_toggle(id)?;
    // Favorites membership reflects the toggle without waiting for a batch
    state.collections.recompute();
    Ok(Json(FavoriteResponse {
        item_id: id,
        favorite,
    }))
}
