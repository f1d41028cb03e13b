//! pml-ix - Media Ingest & Index service
//!
//! Watches a media library folder, runs the analysis pipeline over new and
//! changed items, and serves search, smart collections, and ingest control
//! over HTTP REST + SSE.

use anyhow::Result;
use pml_common::config::ServiceConfig;
use pml_common::events::EventBus;
use pml_ix::analyzer::AnalyzerSet;
use pml_ix::ingest::SchedulerConfig;
use pml_ix::source::FsAssetSource;
use pml_ix::AppState;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting pml-ix (Media Ingest & Index) service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Resolve configuration: CLI arg > env > TOML > defaults
    let cli_root = std::env::args().nth(1);
    let config = ServiceConfig::load(None)?;
    let library_root = config.resolve_library_root(cli_root.as_deref());
    info!("Library root: {}", library_root.display());

    // Open or create the snapshot database
    let db_path = config.database_path();
    info!("Database: {}", db_path.display());
    let db = pml_ix::db::init_db_pool(&db_path).await?;
    info!("Database connection established");

    // Event bus for pipeline events and SSE broadcasting
    let event_bus = EventBus::new(config.event_capacity);
    info!("Event bus initialized");

    // Analyzer capabilities are pluggable; none are bundled with the
    // service binary.
    let analyzers = AnalyzerSet::new();

    let source = Arc::new(FsAssetSource::new(library_root));
    let state = AppState::new(
        db,
        event_bus,
        source,
        analyzers,
        SchedulerConfig::from_service(&config),
    );

    // Restore the persisted snapshot and reconcile against the source
    // instead of rescanning from zero
    match state.coordinator.load_snapshot().await {
        Ok(report) => info!(
            added = report.added,
            changed = report.changed,
            removed = report.removed,
            total = report.total_items,
            "Snapshot restored and reconciled"
        ),
        Err(e) => tracing::warn!(error = %e, "Snapshot restore failed, starting empty"),
    }

    // Start workers and event-driven maintenance tasks
    let _handles = state.spawn_pipeline();
    info!("Analysis pipeline started");

    // Build router and serve
    let app = pml_ix::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    info!("Listening on http://{}", config.bind);
    info!("Health check: http://{}/health", config.bind);

    axum::serve(listener, app).await?;

    Ok(())
}
