//! pml-ix library interface
//!
//! Media ingest & index service: asynchronous analysis pipeline, concurrent
//! multi-attribute index, query engine, and smart collections, exposed over
//! HTTP REST + SSE.

pub mod analyzer;
pub mod api;
pub mod collections;
pub mod db;
pub mod error;
pub mod index;
pub mod ingest;
pub mod models;
pub mod query;
pub mod source;
pub mod voice;

pub use crate::error::{ApiError, ApiResult};

use crate::analyzer::AnalyzerSet;
use crate::collections::CollectionMaterializer;
use crate::index::MediaIndex;
use crate::ingest::{AnalysisScheduler, IngestionCoordinator, SchedulerConfig, WorkQueue};
use crate::models::FaceClusterRegistry;
use crate::query::QueryEngine;
use crate::source::AssetSource;
use axum::Router;
use chrono::{DateTime, Utc};
use pml_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application state shared across handlers and background tasks.
///
/// This is the explicit state container owned by the pipeline root; change
/// notifications flow through the event bus, never through globals.
#[derive(Clone)]
pub struct AppState {
    /// Snapshot database pool
    pub db: SqlitePool,
    /// Event bus for pipeline events and SSE broadcasting
    pub event_bus: EventBus,
    /// Concurrent media index
    pub index: Arc<MediaIndex>,
    /// Analysis work queue
    pub queue: Arc<WorkQueue>,
    /// Face cluster registry
    pub faces: Arc<FaceClusterRegistry>,
    /// Ingestion control surface
    pub coordinator: Arc<IngestionCoordinator>,
    /// Worker pool
    pub scheduler: Arc<AnalysisScheduler>,
    /// Search engine
    pub query: Arc<QueryEngine>,
    /// Smart collection materializer
    pub collections: Arc<CollectionMaterializer>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    /// Wire the full pipeline around the given source and analyzer set
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        source: Arc<dyn AssetSource>,
        analyzers: AnalyzerSet,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        let index = Arc::new(MediaIndex::new());
        let queue = Arc::new(WorkQueue::new());
        let faces = Arc::new(FaceClusterRegistry::new());

        let scheduler = Arc::new(AnalysisScheduler::new(
            Arc::clone(&index),
            Arc::clone(&source),
            analyzers,
            Arc::clone(&faces),
            Arc::clone(&queue),
            event_bus.clone(),
            scheduler_config,
        ));

        let coordinator = Arc::new(IngestionCoordinator::new(
            source,
            Arc::clone(&index),
            Arc::clone(&queue),
            Arc::clone(&scheduler),
            Arc::clone(&faces),
            db.clone(),
            event_bus.clone(),
        ));

        let query = Arc::new(QueryEngine::new(Arc::clone(&index)));
        let collections = Arc::new(CollectionMaterializer::new(
            Arc::clone(&index),
            event_bus.clone(),
        ));

        Self {
            db,
            event_bus,
            index,
            queue,
            faces,
            coordinator,
            scheduler,
            query,
            collections,
            startup_time: Utc::now(),
        }
    }

    /// Spawn the worker pool and the background tasks reacting to events
    pub fn spawn_pipeline(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = self.scheduler.spawn_workers();
        handles.push(self.coordinator.spawn_maintenance());
        handles.push(self.collections.spawn_recompute_task());
        handles
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::ingest_routes())
        .merge(api::query_routes())
        .merge(api::collection_routes())
        .merge(api::item_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .route("/status/events", get(api::status_stream))
        .with_state(state)
}
