//! Ingestion coordinator
//!
//! Detects new and changed items from the asset source, manages the
//! enqueue/cancel/pause/resume control surface, and owns snapshot
//! persistence plus index rebuild on corruption.

use crate::index::MediaIndex;
use crate::ingest::queue::{Priority, WorkQueue};
use crate::ingest::scheduler::AnalysisScheduler;
use crate::models::FaceClusterRegistry;
use crate::source::AssetSource;
use anyhow::Result;
use chrono::{DateTime, Utc};
use pml_common::events::{EventBus, MediaEvent};
use pml_common::models::{MediaItem, ProcessingState};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Result of one sync pass against the asset source
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Newly discovered items
    pub added: usize,
    /// Items whose fingerprint changed
    pub changed: usize,
    /// Items no longer present at the source
    pub removed: usize,
    /// Library size after the sync
    pub total_items: usize,
}

/// Pipeline root coordinating source, queue, scheduler, and snapshot store
pub struct IngestionCoordinator {
    source: Arc<dyn AssetSource>,
    index: Arc<MediaIndex>,
    queue: Arc<WorkQueue>,
    scheduler: Arc<AnalysisScheduler>,
    faces: Arc<FaceClusterRegistry>,
    db: SqlitePool,
    events: EventBus,
}

impl IngestionCoordinator {
    pub fn new(
        source: Arc<dyn AssetSource>,
        index: Arc<MediaIndex>,
        queue: Arc<WorkQueue>,
        scheduler: Arc<AnalysisScheduler>,
        faces: Arc<FaceClusterRegistry>,
        db: SqlitePool,
        events: EventBus,
    ) -> Self {
        Self {
            source,
            index,
            queue,
            scheduler,
            faces,
            db,
            events,
        }
    }

    /// Diff the source's current listing against the index.
    ///
    /// New ids are created UNPROCESSED. A changed fingerprint resets the
    /// item to UNPROCESSED while its previously committed attrs stay in the
    /// index, so search keeps working during the rescan. Vanished ids are
    /// removed from the queue and the index.
    pub async fn sync(&self) -> Result<SyncReport> {
        let listing = self
            .source
            .list_items()
            .await
            .map_err(|e| anyhow::anyhow!("asset source listing failed: {}", e))?;

        let mut report = SyncReport::default();
        let mut current: HashSet<Uuid> = HashSet::with_capacity(listing.len());

        for entry in listing {
            current.insert(entry.id);
            match self.index.get(entry.id) {
                None => {
                    self.index.insert_item(MediaItem::new(
                        entry.id,
                        entry.fingerprint,
                        entry.created_at,
                        entry.kind,
                    ));
                    report.added += 1;
                }
                Some(item) => {
                    if item.fingerprint != entry.fingerprint {
                        self.index.update_fingerprint(entry.id, entry.fingerprint)?;
                        // Items already queued or mid-analysis are left
                        // alone; their stale result still records the old
                        // fingerprint, so they stay eligible for re-analysis.
                        if !matches!(
                            item.state,
                            ProcessingState::Queued | ProcessingState::Processing
                        ) {
                            self.index
                                .force_state(entry.id, ProcessingState::Unprocessed)?;
                        }
                        report.changed += 1;
                    }
                }
            }
        }

        let known = self.index.all_ids();
        for id in known {
            if !current.contains(&id) {
                self.queue.cancel(&[id]);
                self.faces.forget_item(id);
                self.index.remove_item(id);
                report.removed += 1;
            }
        }

        report.total_items = self.index.len();
        tracing::info!(
            added = report.added,
            changed = report.changed,
            removed = report.removed,
            total = report.total_items,
            "Source sync completed"
        );
        self.events.emit_lossy(MediaEvent::SyncCompleted {
            added: report.added,
            changed: report.changed,
            removed: report.removed,
            total_items: report.total_items,
            timestamp: Utc::now(),
        });

        Ok(report)
    }

    /// Enqueue items for analysis.
    ///
    /// `ids = None` enqueues everything that needs analysis. Explicit ids
    /// may also re-analyze PROCESSED/FAILED items. Items already QUEUED or
    /// PROCESSING are never re-enqueued (the state machine rejects the
    /// QUEUED transition). Returns the number of items enqueued.
    pub fn enqueue(&self, ids: Option<Vec<Uuid>>, priority: Priority) -> usize {
        let candidate_ids = match ids {
            Some(ids) => ids,
            None => self
                .index
                .with_snapshot(|view| {
                    let mut ids: Vec<Uuid> = view
                        .items()
                        .filter(|item| match item.state {
                            ProcessingState::Unprocessed => true,
                            ProcessingState::Processed | ProcessingState::Failed => {
                                item.needs_analysis()
                            }
                            _ => false,
                        })
                        .map(|item| item.id)
                        .collect();
                    ids.sort();
                    ids
                }),
        };

        let mut accepted: Vec<(Uuid, DateTime<Utc>, ProcessingState)> = Vec::new();
        for id in candidate_ids {
            let Some(item) = self.index.get(id) else {
                tracing::debug!(item_id = %id, "Enqueue skipped: unknown item");
                continue;
            };
            match self.index.transition(id, ProcessingState::Queued) {
                Ok(old) => {
                    self.events.emit_lossy(MediaEvent::ItemStateChanged {
                        item_id: id,
                        old_state: old,
                        new_state: ProcessingState::Queued,
                        timestamp: Utc::now(),
                    });
                    accepted.push((id, item.created_at, old));
                }
                Err(e) => {
                    tracing::debug!(item_id = %id, error = %e, "Enqueue skipped");
                }
            }
        }

        if accepted.is_empty() {
            tracing::debug!("No items eligible for analysis");
            return 0;
        }

        // Account the batch before work becomes visible to workers so the
        // progress total never lags behind completions.
        self.scheduler.begin_batch(accepted.len());
        let mut enqueued = 0;
        for (id, created_at, revert) in accepted {
            if self.queue.push(id, created_at, priority, revert) {
                enqueued += 1;
            } else {
                tracing::error!(item_id = %id, "Queue rejected item in QUEUED state");
            }
        }
        tracing::info!(enqueued, ?priority, "Items enqueued for analysis");
        enqueued
    }

    /// Cancel pending and in-flight analysis for the given items
    pub fn cancel(&self, ids: &[Uuid]) -> usize {
        self.scheduler.cancel_ids(ids)
    }

    /// Stop handing work to the pool; in-flight items finish normally
    pub fn pause(&self) {
        self.queue.pause();
        tracing::info!("Ingestion paused");
    }

    pub fn resume(&self) {
        self.queue.resume();
        tracing::info!("Ingestion resumed");
    }

    /// Persist the current item set plus version stamp
    pub async fn persist_snapshot(&self) -> Result<()> {
        let items = self.index.items_snapshot();
        let version = self.index.version();
        crate::db::snapshot::save_snapshot(&self.db, &items, version).await?;
        tracing::debug!(items = items.len(), version, "Snapshot persisted");
        Ok(())
    }

    /// Load the persisted snapshot into the index, then reconcile it
    /// against the source listing instead of rebuilding from zero.
    pub async fn load_snapshot(&self) -> Result<SyncReport> {
        let (items, version) = crate::db::snapshot::load_snapshot(&self.db).await?;
        if !items.is_empty() {
            tracing::info!(items = items.len(), version, "Restoring snapshot");
            self.restore_face_registry(&items);
            self.index.rebuild(items);
            self.index.restore_version(version);
        }
        self.sync().await
    }

    /// Full recovery path for index corruption: rebuild from the stored
    /// snapshot, then resync against the asset source.
    pub async fn rebuild_from_snapshot(&self) -> Result<usize> {
        tracing::warn!("Rebuilding media index from stored snapshot");
        let (items, version) = crate::db::snapshot::load_snapshot(&self.db).await?;
        self.restore_face_registry(&items);
        self.index.rebuild(items);
        self.index.restore_version(version);
        self.sync().await?;
        let count = self.index.len();
        self.events.emit_lossy(MediaEvent::IndexRebuilt {
            item_count: count,
            timestamp: Utc::now(),
        });
        Ok(count)
    }

    /// Merge face cluster `from` into `into`, rewriting affected items
    pub fn merge_face_clusters(&self, into: Uuid, from: Uuid) -> Option<usize> {
        self.faces.merge(into, from)?;
        Some(self.index.replace_face_cluster(from, into))
    }

    fn restore_face_registry(&self, items: &[MediaItem]) {
        // Cluster membership is recoverable from item attrs; signatures are
        // not persisted, so re-analysis re-establishes them.
        for item in items {
            for cluster_id in &item.attrs.face_clusters {
                self.faces.restore_membership(*cluster_id, item.id);
            }
        }
    }

    /// Background task reacting to pipeline events: snapshot after each
    /// completed batch, rebuild on index corruption.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut rx = coordinator.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(MediaEvent::BatchCompleted { .. }) => {
                        if let Err(e) = coordinator.persist_snapshot().await {
                            tracing::error!(error = %e, "Snapshot persistence failed");
                        }
                    }
                    Ok(MediaEvent::IndexCorrupted { item_id, .. }) => {
                        tracing::error!(item_id = %item_id, "Index corruption reported, starting rebuild");
                        if let Err(e) = coordinator.rebuild_from_snapshot().await {
                            tracing::error!(error = %e, "Index rebuild failed");
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Maintenance task lagged behind event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
