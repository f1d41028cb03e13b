//! Smart collection materializer
//!
//! Evaluates a fixed, ordered list of named predicates against one index
//! snapshot and caches the membership sets. Recomputation is idempotent,
//! never mutates item state, and runs after each completed analysis batch
//! or on explicit refresh.

use crate::index::MediaIndex;
use chrono::Utc;
use pml_common::events::{EventBus, MediaEvent};
use pml_common::models::{MediaItem, ProcessingState};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// A named, predicate-defined, auto-recomputed grouping of items
#[derive(Debug, Clone, Serialize)]
pub struct SmartCollection {
    pub name: String,
    pub members: BTreeSet<Uuid>,
    /// Index version the membership was computed against
    pub computed_version: u64,
}

struct CollectionRule {
    name: &'static str,
    predicate: fn(&MediaItem) -> bool,
}

fn has_any_tag(item: &MediaItem, wanted: &[&str]) -> bool {
    item.attrs
        .tags
        .iter()
        .any(|tag| wanted.iter().any(|w| tag.eq_ignore_ascii_case(w)))
}

const RULES: &[CollectionRule] = &[
    CollectionRule {
        name: "Beach & Vacation",
        predicate: |item| has_any_tag(item, &["beach", "vacation"]),
    },
    CollectionRule {
        name: "Family & Friends",
        predicate: |item| !item.attrs.face_clusters.is_empty(),
    },
    CollectionRule {
        name: "Nature & Landscapes",
        predicate: |item| has_any_tag(item, &["nature", "landscape"]),
    },
    CollectionRule {
        name: "Food & Dining",
        predicate: |item| has_any_tag(item, &["food"]),
    },
    CollectionRule {
        name: "Screenshots & Documents",
        predicate: |item| !item.attrs.detected_text.is_empty(),
    },
    CollectionRule {
        name: "Favorites",
        predicate: |item| item.favorite,
    },
];

/// Materializes the built-in smart collections from the index
pub struct CollectionMaterializer {
    index: Arc<MediaIndex>,
    events: EventBus,
    cache: RwLock<Vec<SmartCollection>>,
}

impl CollectionMaterializer {
    pub fn new(index: Arc<MediaIndex>, events: EventBus) -> Self {
        let cache = RULES
            .iter()
            .map(|rule| SmartCollection {
                name: rule.name.to_string(),
                members: BTreeSet::new(),
                computed_version: 0,
            })
            .collect();
        Self {
            index,
            events,
            cache: RwLock::new(cache),
        }
    }

    /// Re-evaluate every predicate against the current index snapshot and
    /// replace the cached membership sets. Idempotent: with no intervening
    /// index change, two calls produce identical membership. Returns the
    /// index version the sets were computed against.
    pub fn recompute(&self) -> u64 {
        let (version, fresh): (u64, Vec<BTreeSet<Uuid>>) = self.index.with_snapshot(|view| {
            let sets = RULES
                .iter()
                .map(|rule| {
                    view.items()
                        // FAILED items carry no committed attrs and are
                        // excluded from attribute-based collections
                        .filter(|item| item.state != ProcessingState::Failed)
                        .filter(|item| (rule.predicate)(item))
                        .map(|item| item.id)
                        .collect()
                })
                .collect();
            (view.version(), sets)
        });

        let mut cache = self.cache.write().unwrap();
        for (collection, members) in cache.iter_mut().zip(fresh) {
            collection.members = members;
            collection.computed_version = version;
        }
        drop(cache);

        tracing::debug!(index_version = version, "Smart collections recomputed");
        self.events.emit_lossy(MediaEvent::CollectionsRecomputed {
            index_version: version,
            timestamp: Utc::now(),
        });
        version
    }

    /// Cached collections in rule order: (name, count, member ids)
    pub fn list(&self) -> Vec<SmartCollection> {
        self.cache.read().unwrap().clone()
    }

    /// Background task recomputing after each completed batch or rebuild
    pub fn spawn_recompute_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let materializer = Arc::clone(self);
        let mut rx = materializer.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(MediaEvent::BatchCompleted { .. })
                    | Ok(MediaEvent::IndexRebuilt { .. }) => {
                        materializer.recompute();
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Collection task lagged behind event bus");
                        materializer.recompute();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
