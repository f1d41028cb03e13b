//! Analysis scheduler
//!
//! A fixed-size pool of tokio workers drains the priority queue, invokes
//! every configured analyzer capability independently, and commits results
//! into the media index as one atomic step per item.
//!
//! Failure semantics: transient capability errors (including per-invocation
//! timeouts) retry with exponential backoff up to the attempt ceiling;
//! exhausting the ceiling leaves that capability's contribution absent while
//! the item still completes as PROCESSED. Only a structural error marks the
//! item FAILED. A vanished asset is dropped silently. Cancellation is
//! cooperative: a flagged in-flight item finishes computing but its result
//! is discarded and the pre-enqueue state restored.

use crate::analyzer::{AnalysisError, AnalyzerSet};
use crate::index::{IndexError, MediaIndex};
use crate::ingest::queue::{WorkEntry, WorkQueue};
use crate::models::FaceClusterRegistry;
use crate::source::{AssetSource, SourceError};
use chrono::Utc;
use pml_common::config::ServiceConfig;
use pml_common::events::{EventBus, MediaEvent};
use pml_common::models::{ItemAttrs, ProcessingState};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Scheduler tuning knobs
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool size
    pub workers: usize,
    /// Retry ceiling per capability invocation
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub retry_base: Duration,
    /// Backoff cap
    pub retry_cap: Duration,
    /// Per-invocation capability timeout; elapsing counts as transient
    pub capability_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_secs(5),
            capability_timeout: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    pub fn from_service(config: &ServiceConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            max_attempts: config.max_attempts.max(1),
            retry_base: config.retry_base(),
            retry_cap: config.retry_cap(),
            capability_timeout: config.capability_timeout(),
        }
    }
}

/// Batch progress exposed as processed/total.
///
/// Counters are atomic so the ratio is monotonically non-decreasing under
/// concurrent completions; they reset only when a new batch begins.
#[derive(Default)]
pub struct BatchProgress {
    processed: AtomicUsize,
    total: AtomicUsize,
}

impl BatchProgress {
    fn reset(&self, total: usize) {
        self.processed.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    fn extend(&self, additional: usize) {
        self.total.fetch_add(additional, Ordering::SeqCst);
    }

    fn reduce_total(&self, removed: usize) {
        // Cancelled-before-start items leave the batch entirely
        let mut current = self.total.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(removed);
            match self.total.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn record_done(&self) -> (usize, usize) {
        let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        (processed, self.total.load(Ordering::SeqCst))
    }

    pub fn snapshot(&self) -> (usize, usize) {
        (
            self.processed.load(Ordering::SeqCst),
            self.total.load(Ordering::SeqCst),
        )
    }

    pub fn is_idle(&self) -> bool {
        let (processed, total) = self.snapshot();
        total == 0 || processed >= total
    }

    pub fn ratio(&self) -> f64 {
        let (processed, total) = self.snapshot();
        if total == 0 {
            0.0
        } else {
            (processed as f64 / total as f64).min(1.0)
        }
    }
}

/// Progress as reported over the API
#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub processed: usize,
    pub total: usize,
    pub ratio: f64,
}

/// Outcome of one capability after retries
enum CapabilityOutcome<T> {
    /// Capability produced a value
    Success(T),
    /// Retry ceiling exhausted; contribution absent, item not failed
    Absent,
    /// Structural error; the whole item is failed
    Fatal(String),
}

impl<T> CapabilityOutcome<T> {
    fn fatal_reason(&self) -> Option<&str> {
        match self {
            CapabilityOutcome::Fatal(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Bounded worker pool executing the analysis pipeline
pub struct AnalysisScheduler {
    index: Arc<MediaIndex>,
    source: Arc<dyn AssetSource>,
    analyzers: AnalyzerSet,
    faces: Arc<FaceClusterRegistry>,
    queue: Arc<WorkQueue>,
    events: EventBus,
    config: SchedulerConfig,
    progress: BatchProgress,
    batch_lock: Mutex<()>,
    cancelled: Mutex<HashSet<Uuid>>,
    shutdown: CancellationToken,
}

impl AnalysisScheduler {
    pub fn new(
        index: Arc<MediaIndex>,
        source: Arc<dyn AssetSource>,
        analyzers: AnalyzerSet,
        faces: Arc<FaceClusterRegistry>,
        queue: Arc<WorkQueue>,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        if analyzers.is_empty() {
            tracing::warn!("No analyzer capabilities configured; items will complete without derived attributes");
        }
        Self {
            index,
            source,
            analyzers,
            faces,
            queue,
            events,
            config,
            progress: BatchProgress::default(),
            batch_lock: Mutex::new(()),
            cancelled: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the worker pool. Workers run until [`stop`](Self::stop).
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker| {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move {
                    scheduler.worker_loop(worker).await;
                })
            })
            .collect()
    }

    /// Signal workers to stop once the queue stops yielding work
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.queue.close();
    }

    /// Account for newly enqueued work. Starts a fresh batch (counters
    /// reset) when the previous one is complete, otherwise extends it.
    pub fn begin_batch(&self, enqueued: usize) {
        let _lock = self.batch_lock.lock().unwrap();
        if self.progress.is_idle() {
            self.progress.reset(enqueued);
            self.events.emit_lossy(MediaEvent::BatchStarted {
                total: enqueued,
                timestamp: Utc::now(),
            });
        } else {
            self.progress.extend(enqueued);
        }
    }

    /// Cancel pending and in-flight work.
    ///
    /// Queued entries are removed and their pre-enqueue state restored.
    /// In-flight entries are flagged; the worker discards the computed
    /// result instead of committing. Returns the number of affected items.
    pub fn cancel_ids(&self, ids: &[Uuid]) -> usize {
        let removed = self.queue.cancel(ids);
        for entry in &removed {
            if let Ok(old) = self.index.force_state(entry.id, entry.revert) {
                self.events.emit_lossy(MediaEvent::ItemStateChanged {
                    item_id: entry.id,
                    old_state: old,
                    new_state: entry.revert,
                    timestamp: Utc::now(),
                });
            }
        }
        if !removed.is_empty() {
            self.progress.reduce_total(removed.len());
            self.maybe_complete_batch();
        }

        let removed_ids: HashSet<Uuid> = removed.iter().map(|entry| entry.id).collect();
        let mut inflight = 0;
        {
            let mut cancelled = self.cancelled.lock().unwrap();
            for id in ids {
                if removed_ids.contains(id) {
                    continue;
                }
                let is_processing = self
                    .index
                    .get(*id)
                    .map(|item| item.state == ProcessingState::Processing)
                    .unwrap_or(false);
                if is_processing && cancelled.insert(*id) {
                    inflight += 1;
                }
            }
        }

        let affected = removed.len() + inflight;
        if affected > 0 {
            tracing::info!(
                queued_removed = removed.len(),
                inflight_flagged = inflight,
                "Ingestion work cancelled"
            );
            self.events.emit_lossy(MediaEvent::IngestCancelled {
                cancelled: affected,
                timestamp: Utc::now(),
            });
        }
        affected
    }

    pub fn progress_report(&self) -> ProgressReport {
        let (processed, total) = self.progress.snapshot();
        ProgressReport {
            processed,
            total,
            ratio: self.progress.ratio(),
        }
    }

    async fn worker_loop(&self, worker: usize) {
        tracing::debug!(worker, "Analysis worker started");
        loop {
            let entry = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                entry = self.queue.pop_claim(|id| self.claim(id)) => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };
            self.process_item(entry).await;
        }
        tracing::debug!(worker, "Analysis worker stopped");
    }

    /// Claim QUEUED → PROCESSING under the queue lock. Failing the claim
    /// (state moved underneath) skips the entry without processing it.
    fn claim(&self, id: Uuid) -> bool {
        match self.index.transition(id, ProcessingState::Processing) {
            Ok(old) => {
                self.events.emit_lossy(MediaEvent::ItemStateChanged {
                    item_id: id,
                    old_state: old,
                    new_state: ProcessingState::Processing,
                    timestamp: Utc::now(),
                });
                true
            }
            Err(e) => {
                tracing::debug!(item_id = %id, error = %e, "Claim rejected");
                false
            }
        }
    }

    async fn process_item(&self, entry: WorkEntry) {
        let id = entry.id;
        let Some(item) = self.index.get(id) else {
            tracing::warn!(item_id = %id, "Claimed item disappeared from index");
            self.finish_one();
            return;
        };
        let old_attrs = item.attrs.clone();
        let analyzed_fp = item.fingerprint.clone();

        let content = match self.source.fetch_content(id).await {
            Ok(content) => content,
            Err(SourceError::AssetUnavailable(_)) => {
                // Vanished mid-processing: silent drop, no retry, no entries
                self.faces.forget_item(id);
                self.index.remove_item(id);
                self.cancelled.lock().unwrap().remove(&id);
                tracing::warn!(item_id = %id, "Asset vanished mid-processing, dropped from library");
                self.finish_one();
                return;
            }
            Err(e) => {
                self.finalize_failed(&entry, format!("content fetch failed: {}", e))
                    .await;
                return;
            }
        };

        // Every configured capability runs independently; one failing does
        // not block the others.
        let (tags, text, faces, geo) = tokio::join!(
            self.run_optional_tags(id, &content),
            self.run_optional_text(id, &content),
            self.run_optional_faces(id, &content),
            self.run_optional_geo(id, &content),
        );

        let fatal = [
            tags.as_ref().and_then(|o| o.fatal_reason()),
            text.as_ref().and_then(|o| o.fatal_reason()),
            faces.as_ref().and_then(|o| o.fatal_reason()),
            geo.as_ref().and_then(|o| o.fatal_reason()),
        ]
        .into_iter()
        .flatten()
        .next()
        .map(str::to_string);

        if let Some(reason) = fatal {
            self.finalize_failed(&entry, reason).await;
            return;
        }

        // Commit decision and swap are serialized per item; cancellation is
        // checked inside the guard so a discarded result never touches the
        // index or the face registry.
        let guard = self.index.commit_guard(id);
        let _guard = guard.lock().await;

        if self.take_cancelled(id) {
            self.discard_result(&entry).await;
            return;
        }

        let new_attrs = ItemAttrs {
            tags: match tags {
                Some(CapabilityOutcome::Success(values)) => values.into_iter().collect(),
                Some(_) => BTreeSet::new(),
                None => old_attrs.tags.clone(),
            },
            detected_text: match text {
                Some(CapabilityOutcome::Success(value)) => value,
                Some(_) => String::new(),
                None => old_attrs.detected_text.clone(),
            },
            face_clusters: match faces {
                Some(CapabilityOutcome::Success(signatures)) => {
                    self.faces.forget_item(id);
                    self.faces.observe(id, &signatures)
                }
                Some(_) => {
                    self.faces.forget_item(id);
                    BTreeSet::new()
                }
                None => old_attrs.face_clusters.clone(),
            },
            location: match geo {
                Some(CapabilityOutcome::Success(value)) => value,
                Some(_) => None,
                None => old_attrs.location.clone(),
            },
        };

        match self.index.commit(id, &old_attrs, new_attrs, analyzed_fp) {
            Ok(index_version) => {
                self.events.emit_lossy(MediaEvent::ItemCommitted {
                    item_id: id,
                    index_version,
                    timestamp: Utc::now(),
                });
                self.transition_terminal(id, ProcessingState::Processed);
            }
            Err(IndexError::Corruption(_)) => {
                tracing::error!(item_id = %id, "Index corruption detected on commit; requesting rebuild");
                self.events.emit_lossy(MediaEvent::IndexCorrupted {
                    item_id: id,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                tracing::error!(item_id = %id, error = %e, "Commit failed");
            }
        }
        self.finish_one();
    }

    async fn finalize_failed(&self, entry: &WorkEntry, reason: String) {
        let id = entry.id;
        let guard = self.index.commit_guard(id);
        let _guard = guard.lock().await;

        if self.take_cancelled(id) {
            self.discard_result(entry).await;
            return;
        }

        tracing::warn!(item_id = %id, reason = %reason, "Item analysis failed");
        self.transition_terminal(id, ProcessingState::Failed);
        self.events.emit_lossy(MediaEvent::ItemFailed {
            item_id: id,
            reason,
            timestamp: Utc::now(),
        });
        self.finish_one();
    }

    /// In-flight cancellation: the computed result is discarded and the
    /// pre-enqueue state restored; the index never sees a partial result.
    async fn discard_result(&self, entry: &WorkEntry) {
        let id = entry.id;
        if let Ok(old) = self.index.force_state(id, entry.revert) {
            self.events.emit_lossy(MediaEvent::ItemStateChanged {
                item_id: id,
                old_state: old,
                new_state: entry.revert,
                timestamp: Utc::now(),
            });
        }
        tracing::info!(item_id = %id, "In-flight analysis result discarded after cancellation");
        self.finish_one();
    }

    fn transition_terminal(&self, id: Uuid, terminal: ProcessingState) {
        match self.index.transition(id, terminal) {
            Ok(old) => {
                self.events.emit_lossy(MediaEvent::ItemStateChanged {
                    item_id: id,
                    old_state: old,
                    new_state: terminal,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                tracing::error!(item_id = %id, error = %e, "Terminal transition failed");
            }
        }
    }

    fn take_cancelled(&self, id: Uuid) -> bool {
        self.cancelled.lock().unwrap().remove(&id)
    }

    fn finish_one(&self) {
        let (processed, total) = self.progress.record_done();
        self.events.emit_lossy(MediaEvent::IngestProgress {
            processed,
            total,
            timestamp: Utc::now(),
        });
        self.maybe_complete_batch();
    }

    fn maybe_complete_batch(&self) {
        let (processed, total) = self.progress.snapshot();
        if total > 0 && processed >= total {
            tracing::info!(processed, "Ingestion batch completed");
            self.events.emit_lossy(MediaEvent::BatchCompleted {
                processed,
                timestamp: Utc::now(),
            });
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
        self.config
            .retry_base
            .saturating_mul(factor)
            .min(self.config.retry_cap)
    }

    /// Run one capability with timeout, retry, and backoff
    async fn run_capability<T, Fut>(
        &self,
        name: &'static str,
        item_id: Uuid,
        op: impl Fn() -> Fut,
    ) -> CapabilityOutcome<T>
    where
        Fut: Future<Output = Result<T, AnalysisError>>,
    {
        for attempt in 1..=self.config.max_attempts {
            match tokio::time::timeout(self.config.capability_timeout, op()).await {
                Ok(Ok(value)) => return CapabilityOutcome::Success(value),
                Ok(Err(AnalysisError::Permanent(reason))) => {
                    tracing::warn!(item_id = %item_id, capability = name, reason = %reason, "Permanent capability failure");
                    return CapabilityOutcome::Fatal(reason);
                }
                Ok(Err(AnalysisError::Transient(reason))) => {
                    tracing::debug!(item_id = %item_id, capability = name, attempt, reason = %reason, "Transient capability failure");
                }
                Err(_) => {
                    tracing::debug!(item_id = %item_id, capability = name, attempt, "Capability invocation timed out");
                }
            }
            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }
        tracing::warn!(item_id = %item_id, capability = name, attempts = self.config.max_attempts, "Capability retry ceiling exhausted, contribution absent");
        CapabilityOutcome::Absent
    }

    async fn run_optional_tags(
        &self,
        id: Uuid,
        content: &[u8],
    ) -> Option<CapabilityOutcome<Vec<String>>> {
        let capability = self.analyzers.tags.clone()?;
        Some(
            self.run_capability("tags", id, || capability.tags(content))
                .await,
        )
    }

    async fn run_optional_text(
        &self,
        id: Uuid,
        content: &[u8],
    ) -> Option<CapabilityOutcome<String>> {
        let capability = self.analyzers.text.clone()?;
        Some(
            self.run_capability("text", id, || capability.recognize_text(content))
                .await,
        )
    }

    async fn run_optional_faces(
        &self,
        id: Uuid,
        content: &[u8],
    ) -> Option<CapabilityOutcome<Vec<String>>> {
        let capability = self.analyzers.faces.clone()?;
        Some(
            self.run_capability("faces", id, || capability.face_signatures(content))
                .await,
        )
    }

    async fn run_optional_geo(
        &self,
        id: Uuid,
        content: &[u8],
    ) -> Option<CapabilityOutcome<Option<String>>> {
        let capability = self.analyzers.geo.clone()?;
        Some(
            self.run_capability("geo", id, || capability.locate(content))
                .await,
        )
    }
}
