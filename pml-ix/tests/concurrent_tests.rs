//! Integration tests for concurrent access patterns

mod support;

use chrono::{TimeZone, Utc};
use pml_common::models::{Fingerprint, ItemAttrs, MediaItem, MediaKind, ProcessingState};
use pml_ix::index::MediaIndex;
use pml_ix::ingest::Priority;
use std::sync::Arc;
use support::*;
use tokio::task::JoinSet;
use uuid::Uuid;

#[tokio::test]
async fn test_concurrent_commits_to_unrelated_items() {
    let index = Arc::new(MediaIndex::new());
    let mut ids = Vec::new();
    for i in 0..20 {
        let item = MediaItem::new(
            Uuid::new_v4(),
            Fingerprint::new(format!("hash-{}", i), i),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            MediaKind::Photo,
        );
        ids.push(item.id);
        index.insert_item(item);
    }

    let mut join_set = JoinSet::new();
    for (i, id) in ids.iter().copied().enumerate() {
        let index = Arc::clone(&index);
        join_set.spawn(async move {
            let guard = index.commit_guard(id);
            let _guard = guard.lock().await;
            let old_attrs = ItemAttrs::default();
            let new_attrs = ItemAttrs {
                tags: [format!("tag-{}", i)].into_iter().collect(),
                detected_text: format!("text {}", i),
                ..Default::default()
            };
            index
                .commit(id, &old_attrs, new_attrs, Fingerprint::new(format!("hash-{}", i), i as i64))
                .expect("commit failed");
            id
        });
    }

    while let Some(result) = join_set.join_next().await {
        let id = result.expect("task panicked");
        index.verify_item(id).expect("index inconsistent after commit");
    }

    // Every commit landed exactly once
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(index.lookup_by_tag(&format!("tag-{}", i)), vec![*id]);
    }
}

#[tokio::test]
async fn test_concurrent_enqueue_yields_single_execution() {
    let source = Arc::new(MemorySource::new());
    let id = source.add_asset(
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        &TestAsset::with_tags(&["beach"]),
    );

    let (analyzers, tags) = scripted_analyzers();
    let state = test_state(Arc::clone(&source), analyzers).await;
    state.coordinator.sync().await.unwrap();

    // Workers start only after the enqueue storm so every task races on a
    // not-yet-started item
    let mut join_set = JoinSet::new();
    for _ in 0..10 {
        let coordinator = Arc::clone(&state.coordinator);
        join_set.spawn(async move { coordinator.enqueue(Some(vec![id]), Priority::Fifo) });
    }

    let mut total = 0;
    while let Some(result) = join_set.join_next().await {
        total += result.expect("task panicked");
    }
    assert_eq!(total, 1, "exactly one enqueue may win");

    let mut rx = state.event_bus.subscribe();
    let _handles = state.spawn_pipeline();
    wait_for_batch_completed(&mut rx).await;

    assert_eq!(tags.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(
        state.index.get(id).unwrap().state,
        ProcessingState::Processed
    );
}

#[tokio::test]
async fn test_readers_run_during_commits() {
    let index = Arc::new(MediaIndex::new());
    for i in 0..50 {
        let mut item = MediaItem::new(
            Uuid::new_v4(),
            Fingerprint::new(format!("hash-{}", i), i),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            MediaKind::Photo,
        );
        item.attrs.tags.insert("stable".to_string());
        index.insert_item(item);
    }
    let ids = index.all_ids();

    let mut join_set = JoinSet::new();

    // Writers: toggle favorites and commit fresh attrs
    for id in ids.iter().copied() {
        let index = Arc::clone(&index);
        join_set.spawn(async move {
            index.favorite_toggle(id).unwrap();
            let old_attrs = index.get(id).unwrap().attrs;
            let mut new_attrs = old_attrs.clone();
            new_attrs.detected_text = "committed".to_string();
            let fingerprint = index.get(id).unwrap().fingerprint;
            index.commit(id, &old_attrs, new_attrs, fingerprint).unwrap();
        });
    }

    // Readers: every snapshot must be internally consistent
    for _ in 0..8 {
        let index = Arc::clone(&index);
        join_set.spawn(async move {
            for _ in 0..20 {
                index.with_snapshot(|view| {
                    for item in view.items() {
                        // The "stable" tag is never removed by any writer
                        assert!(item.attrs.tags.contains("stable"));
                    }
                });
                tokio::task::yield_now().await;
            }
        });
    }

    while let Some(result) = join_set.join_next().await {
        result.expect("task panicked");
    }

    for id in ids {
        index.verify_item(id).unwrap();
        assert_eq!(index.get(id).unwrap().attrs.detected_text, "committed");
    }
}

#[tokio::test]
async fn test_state_transitions_stay_legal_under_load() {
    let source = Arc::new(MemorySource::new());
    let ids: Vec<_> = (0..12)
        .map(|i| {
            source.add_asset(
                Utc.with_ymd_and_hms(2024, 4, 1 + i, 0, 0, 0).unwrap(),
                &TestAsset::with_tags(&["beach"]),
            )
        })
        .collect();

    let (analyzers, _) = scripted_analyzers();
    let state = test_state(Arc::clone(&source), analyzers).await;
    let _handles = state.spawn_pipeline();
    state.coordinator.sync().await.unwrap();

    // Record every observed transition while the batch runs
    let mut rx = state.event_bus.subscribe();
    state.coordinator.enqueue(None, Priority::ByYear);

    let mut transitions = Vec::new();
    loop {
        match rx.recv().await.unwrap() {
            pml_common::events::MediaEvent::ItemStateChanged {
                old_state,
                new_state,
                ..
            } => transitions.push((old_state, new_state)),
            pml_common::events::MediaEvent::BatchCompleted { .. } => break,
            _ => {}
        }
    }

    assert!(!transitions.is_empty());
    for (old_state, new_state) in transitions {
        assert!(
            old_state.can_transition_to(new_state),
            "illegal edge observed: {:?} -> {:?}",
            old_state,
            new_state
        );
    }

    for id in ids {
        assert_eq!(
            state.index.get(id).unwrap().state,
            ProcessingState::Processed
        );
    }
}
