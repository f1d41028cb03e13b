//! End-to-end pipeline tests over an in-memory source and scripted
//! analyzer capabilities.

mod support;

use chrono::{TimeZone, Utc};
use pml_common::models::ProcessingState;
use pml_ix::analyzer::{AnalyzerSet, TagCapability, TextCapability};
use pml_ix::ingest::Priority;
use pml_ix::query::FilterSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use support::*;

fn ts(year: i32, month: u32, day: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
}

#[tokio::test]
async fn test_ingest_to_processed_end_to_end() {
    let source = Arc::new(MemorySource::new());
    let beach = source.add_asset(ts(2024, 6, 1), &TestAsset::with_tags(&["beach"]));
    let nature = source.add_asset(ts(2024, 6, 2), &TestAsset::with_tags(&["nature"]));
    let plain = source.add_asset(ts(2024, 6, 3), &TestAsset::default());

    let (analyzers, _) = scripted_analyzers();
    let state = test_state(Arc::clone(&source), analyzers).await;
    let _handles = state.spawn_pipeline();

    let report = state.coordinator.sync().await.unwrap();
    assert_eq!(report.added, 3);

    let mut rx = state.event_bus.subscribe();
    assert_eq!(state.coordinator.enqueue(None, Priority::Fifo), 3);
    wait_for_batch_completed(&mut rx).await;

    for id in [beach, nature, plain] {
        let item = state.index.get(id).unwrap();
        assert_eq!(item.state, ProcessingState::Processed);
        state.index.verify_item(id).unwrap();
    }

    // Committed attrs are searchable
    assert_eq!(
        state.query.search("beach", &FilterSet::default()).unwrap(),
        vec![beach]
    );

    // Scenario: beach/nature/plain partition into the right collections
    state.collections.recompute();
    let collections = state.collections.list();
    let find = |name: &str| {
        collections
            .iter()
            .find(|c| c.name == name)
            .unwrap()
            .members
            .clone()
    };
    assert_eq!(find("Beach & Vacation").len(), 1);
    assert_eq!(find("Nature & Landscapes").len(), 1);
    assert_eq!(find("Screenshots & Documents").len(), 0);
}

#[tokio::test]
async fn test_duplicate_enqueue_runs_analyzer_once() {
    let source = Arc::new(MemorySource::new());
    let id = source.add_asset(ts(2024, 1, 1), &TestAsset::with_tags(&["beach"]));

    let (analyzers, tags) = scripted_analyzers();
    let state = test_state(Arc::clone(&source), analyzers).await;
    let _handles = state.spawn_pipeline();
    state.coordinator.sync().await.unwrap();

    // Both enqueues land before processing starts
    state.coordinator.pause();

    let mut total = 0;
    for _ in 0..4 {
        total += state.coordinator.enqueue(Some(vec![id]), Priority::Fifo);
    }
    assert_eq!(total, 1, "QUEUED items must never be re-enqueued");

    let mut rx = state.event_bus.subscribe();
    state.coordinator.resume();
    wait_for_batch_completed(&mut rx).await;

    assert_eq!(tags.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        state.index.get(id).unwrap().state,
        ProcessingState::Processed
    );
}

#[tokio::test]
async fn test_retry_exhaustion_leaves_contribution_absent() {
    let source = Arc::new(MemorySource::new());
    let id = source.add_asset(
        ts(2024, 2, 2),
        &TestAsset {
            tags: vec!["beach".to_string()],
            text: "never recognized".to_string(),
            ..Default::default()
        },
    );

    let flaky = Arc::new(AlwaysTransientText::default());
    let analyzers = AnalyzerSet::new()
        .with_tags(Arc::new(ScriptedTags::default()) as Arc<dyn TagCapability>)
        .with_text(Arc::clone(&flaky) as Arc<dyn TextCapability>);
    let state = test_state(Arc::clone(&source), analyzers).await;
    let _handles = state.spawn_pipeline();
    state.coordinator.sync().await.unwrap();

    let mut rx = state.event_bus.subscribe();
    state.coordinator.enqueue(Some(vec![id]), Priority::Fifo);
    wait_for_batch_completed(&mut rx).await;

    // Ceiling respected, item still PROCESSED, no text contributed
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    let item = state.index.get(id).unwrap();
    assert_eq!(item.state, ProcessingState::Processed);
    assert!(item.attrs.detected_text.is_empty());
    // Other capabilities were unaffected
    assert!(item.attrs.tags.contains("beach"));

    state.collections.recompute();
    let screenshots = state
        .collections
        .list()
        .into_iter()
        .find(|c| c.name == "Screenshots & Documents")
        .unwrap();
    assert!(screenshots.members.is_empty());
}

#[tokio::test]
async fn test_permanent_failure_marks_item_failed() {
    let source = Arc::new(MemorySource::new());
    let id = source.add_asset(ts(2024, 3, 3), &TestAsset::with_tags(&["beach"]));

    let analyzers = AnalyzerSet::new().with_tags(Arc::new(PermanentTags));
    let state = test_state(Arc::clone(&source), analyzers).await;
    let _handles = state.spawn_pipeline();
    state.coordinator.sync().await.unwrap();

    let mut rx = state.event_bus.subscribe();
    state.coordinator.enqueue(Some(vec![id]), Priority::Fifo);
    wait_for_batch_completed(&mut rx).await;

    let item = state.index.get(id).unwrap();
    assert_eq!(item.state, ProcessingState::Failed);
    assert!(item.attrs.is_empty());

    // Failed items stay listable by date but join no attribute collection
    assert_eq!(
        state.index.range_by_date(ts(2024, 1, 1), ts(2024, 12, 31)),
        vec![id]
    );
    state.collections.recompute();
    for collection in state.collections.list() {
        assert!(collection.members.is_empty());
    }
}

#[tokio::test]
async fn test_cancel_in_flight_discards_result() {
    let source = Arc::new(MemorySource::new());
    let id = source.add_asset(ts(2024, 4, 4), &TestAsset::with_tags(&["beach"]));

    let (gated, gate) = GatedTags::new();
    let analyzers = AnalyzerSet::new().with_tags(gated as Arc<dyn TagCapability>);
    let state = test_state(Arc::clone(&source), analyzers).await;
    let _handles = state.spawn_pipeline();
    state.coordinator.sync().await.unwrap();

    let mut rx = state.event_bus.subscribe();
    state.coordinator.enqueue(Some(vec![id]), Priority::Fifo);

    // Wait until the worker holds the item, then cancel mid-flight
    {
        let index = Arc::clone(&state.index);
        wait_until(move || {
            index
                .get(id)
                .is_some_and(|item| item.state == ProcessingState::Processing)
        })
        .await;
    }
    assert_eq!(state.coordinator.cancel(&[id]), 1);

    // Let the analysis finish; its result must be discarded
    gate.add_permits(1);
    wait_for_batch_completed(&mut rx).await;

    let item = state.index.get(id).unwrap();
    assert_eq!(item.state, ProcessingState::Unprocessed);
    assert!(item.attrs.is_empty());
    assert!(item.last_analyzed.is_none());
    assert!(state.index.lookup_by_tag("beach").is_empty());
}

#[tokio::test]
async fn test_batch_cancellation_keeps_committed_prefix() {
    let source = Arc::new(MemorySource::new());
    let ids: Vec<_> = (0..6)
        .map(|i| source.add_asset(ts(2024, 5, 1 + i), &TestAsset::with_tags(&["beach"])))
        .collect();

    let (gated, gate) = GatedTags::new();
    let analyzers = AnalyzerSet::new().with_tags(gated as Arc<dyn TagCapability>);

    // Single worker for a deterministic commit order
    let db = pml_ix::db::init_memory_pool().await.unwrap();
    let event_bus = pml_common::events::EventBus::new(256);
    let mut config = test_scheduler_config();
    config.workers = 1;
    let state = pml_ix::AppState::new(db, event_bus, source.clone(), analyzers, config);
    let _handles = state.spawn_pipeline();
    state.coordinator.sync().await.unwrap();

    let mut rx = state.event_bus.subscribe();
    // FIFO: items commit in discovery order
    state.coordinator.enqueue(Some(ids.clone()), Priority::Fifo);

    // Let exactly 4 items commit; the 5th parks inside the capability
    gate.add_permits(4);
    {
        let index = Arc::clone(&state.index);
        let committed_ids = ids.clone();
        wait_until(move || {
            committed_ids
                .iter()
                .take(4)
                .all(|id| {
                    index
                        .get(*id)
                        .is_some_and(|item| item.state == ProcessingState::Processed)
                })
        })
        .await;
    }
    {
        let index = Arc::clone(&state.index);
        let fifth = ids[4];
        wait_until(move || {
            index
                .get(fifth)
                .is_some_and(|item| item.state == ProcessingState::Processing)
        })
        .await;
    }

    // Cancel the whole batch: 5th is mid-flight, 6th still queued
    assert_eq!(state.coordinator.cancel(&ids), 2);
    gate.add_permits(1);
    wait_for_batch_completed(&mut rx).await;

    // The four committed items keep their attributes
    for id in &ids[..4] {
        let item = state.index.get(*id).unwrap();
        assert_eq!(item.state, ProcessingState::Processed);
        assert!(item.attrs.tags.contains("beach"));
    }
    // No trace of the discarded in-flight result or the cancelled tail
    for id in &ids[4..] {
        let item = state.index.get(*id).unwrap();
        assert_eq!(item.state, ProcessingState::Unprocessed);
        assert!(item.attrs.is_empty());
    }
    assert_eq!(state.index.lookup_by_tag("beach").len(), 4);
}

#[tokio::test]
async fn test_vanished_asset_dropped_silently() {
    let source = Arc::new(MemorySource::new());
    let id = source.add_asset(ts(2024, 6, 6), &TestAsset::with_tags(&["beach"]));

    let (analyzers, _) = scripted_analyzers();
    let state = test_state(Arc::clone(&source), analyzers).await;
    let _handles = state.spawn_pipeline();
    state.coordinator.sync().await.unwrap();

    // Item vanishes between listing and fetch
    source.set_unavailable(id);

    let mut rx = state.event_bus.subscribe();
    state.coordinator.enqueue(Some(vec![id]), Priority::Fifo);
    wait_for_batch_completed(&mut rx).await;

    assert!(state.index.get(id).is_none());
    assert!(state.index.lookup_by_tag("beach").is_empty());
}

#[tokio::test]
async fn test_progress_is_monotone_and_reaches_one() {
    let source = Arc::new(MemorySource::new());
    for i in 0..5 {
        source.add_asset(ts(2024, 7, 1 + i), &TestAsset::with_tags(&["beach"]));
    }

    let (analyzers, _) = scripted_analyzers();
    // Single worker: progress events arrive in counter order, so the event
    // stream itself is monotone, not just the counter
    let db = pml_ix::db::init_memory_pool().await.unwrap();
    let mut config = test_scheduler_config();
    config.workers = 1;
    let state = pml_ix::AppState::new(
        db,
        pml_common::events::EventBus::new(256),
        source.clone(),
        analyzers,
        config,
    );
    let _handles = state.spawn_pipeline();
    state.coordinator.sync().await.unwrap();

    let mut rx = state.event_bus.subscribe();
    state.coordinator.enqueue(None, Priority::Fifo);

    let mut last_ratio = 0.0_f64;
    loop {
        match rx.recv().await.unwrap() {
            pml_common::events::MediaEvent::IngestProgress {
                processed, total, ..
            } => {
                let ratio = processed as f64 / total as f64;
                assert!(
                    ratio >= last_ratio,
                    "progress regressed: {} < {}",
                    ratio,
                    last_ratio
                );
                last_ratio = ratio;
            }
            pml_common::events::MediaEvent::BatchCompleted { processed, .. } => {
                assert_eq!(processed, 5);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(state.scheduler.progress_report().ratio, 1.0);
}

#[tokio::test]
async fn test_fingerprint_change_reanalyzes_without_blank_gap() {
    let source = Arc::new(MemorySource::new());
    let id = source.add_asset(ts(2024, 8, 8), &TestAsset::with_tags(&["beach"]));

    let (analyzers, _) = scripted_analyzers();
    let state = test_state(Arc::clone(&source), analyzers).await;
    let _handles = state.spawn_pipeline();
    state.coordinator.sync().await.unwrap();

    let mut rx = state.event_bus.subscribe();
    state.coordinator.enqueue(None, Priority::Fifo);
    wait_for_batch_completed(&mut rx).await;
    assert_eq!(state.index.lookup_by_tag("beach"), vec![id]);

    // Content changes at the source
    source.update_asset(id, &TestAsset::with_tags(&["nature"]));
    let report = state.coordinator.sync().await.unwrap();
    assert_eq!(report.changed, 1);

    // Reset to UNPROCESSED, but the old tags stay searchable until the
    // re-analysis commits
    let item = state.index.get(id).unwrap();
    assert_eq!(item.state, ProcessingState::Unprocessed);
    assert_eq!(state.index.lookup_by_tag("beach"), vec![id]);

    let mut rx = state.event_bus.subscribe();
    assert_eq!(state.coordinator.enqueue(None, Priority::Fifo), 1);
    wait_for_batch_completed(&mut rx).await;

    // Replace policy: the new analysis supersedes the old tags wholesale
    assert!(state.index.lookup_by_tag("beach").is_empty());
    assert_eq!(state.index.lookup_by_tag("nature"), vec![id]);
}

#[tokio::test]
async fn test_sync_removes_vanished_items() {
    let source = Arc::new(MemorySource::new());
    let keep = source.add_asset(ts(2024, 9, 1), &TestAsset::default());
    let gone = source.add_asset(ts(2024, 9, 2), &TestAsset::default());

    let (analyzers, _) = scripted_analyzers();
    let state = test_state(Arc::clone(&source), analyzers).await;
    state.coordinator.sync().await.unwrap();
    assert_eq!(state.index.len(), 2);

    source.remove_asset(gone);
    let report = state.coordinator.sync().await.unwrap();
    assert_eq!(report.removed, 1);
    assert!(state.index.get(keep).is_some());
    assert!(state.index.get(gone).is_none());
}

#[tokio::test]
async fn test_snapshot_restart_skips_reanalysis() {
    let source = Arc::new(MemorySource::new());
    let id = source.add_asset(ts(2024, 10, 1), &TestAsset::with_tags(&["beach"]));

    let (analyzers, tags) = scripted_analyzers();
    let db = pml_ix::db::init_memory_pool().await.unwrap();
    let state = pml_ix::AppState::new(
        db.clone(),
        pml_common::events::EventBus::new(256),
        source.clone(),
        analyzers,
        test_scheduler_config(),
    );
    let _handles = state.spawn_pipeline();
    state.coordinator.sync().await.unwrap();

    let mut rx = state.event_bus.subscribe();
    state.coordinator.enqueue(None, Priority::Fifo);
    wait_for_batch_completed(&mut rx).await;
    state.coordinator.persist_snapshot().await.unwrap();
    let version_before = state.index.version();
    assert_eq!(tags.calls.load(Ordering::SeqCst), 1);

    // "Restart": fresh state over the same database and source
    let (analyzers2, tags2) = scripted_analyzers();
    let restarted = pml_ix::AppState::new(
        db,
        pml_common::events::EventBus::new(256),
        source.clone(),
        analyzers2,
        test_scheduler_config(),
    );
    let _handles2 = restarted.spawn_pipeline();
    let report = restarted.coordinator.load_snapshot().await.unwrap();
    assert_eq!(report.added, 0);

    // Attributes restored without re-running analysis
    let item = restarted.index.get(id).unwrap();
    assert!(item.attrs.tags.contains("beach"));
    assert!(!item.needs_analysis());
    assert!(restarted.index.version() >= version_before);

    assert_eq!(restarted.coordinator.enqueue(None, Priority::Fifo), 0);
    assert_eq!(tags2.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_corruption_recovery_rebuilds_from_snapshot() {
    let source = Arc::new(MemorySource::new());
    let id = source.add_asset(ts(2024, 11, 1), &TestAsset::with_tags(&["beach"]));

    let (analyzers, _) = scripted_analyzers();
    let state = test_state(Arc::clone(&source), analyzers).await;
    let _handles = state.spawn_pipeline();
    state.coordinator.sync().await.unwrap();

    let mut rx = state.event_bus.subscribe();
    state.coordinator.enqueue(None, Priority::Fifo);
    wait_for_batch_completed(&mut rx).await;
    state.coordinator.persist_snapshot().await.unwrap();

    // Force a divergence, then recover through the rebuild path
    let item = state.index.get(id).unwrap();
    let stale = pml_common::models::ItemAttrs::default();
    assert!(state
        .index
        .commit(id, &stale, stale.clone(), item.fingerprint.clone())
        .is_err());

    let count = state.coordinator.rebuild_from_snapshot().await.unwrap();
    assert_eq!(count, 1);
    let restored = state.index.get(id).unwrap();
    assert!(restored.attrs.tags.contains("beach"));
    state.index.verify_item(id).unwrap();
}
