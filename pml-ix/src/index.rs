//! Concurrent media index
//!
//! Holds every known item plus inverted indices over tags, text/location
//! tokens, creation date, and media kind.
//!
//! Concurrency model: all reads and writes go through one RwLock whose
//! critical sections are short, in-memory, and never held across await
//! points, so analysis throughput is never coupled to a held index lock.
//! Commit exclusivity is per item: a worker takes the item's async commit
//! guard before swapping entries, so commits of unrelated items only contend
//! for the brief swap itself, never for each other's analysis time. Every
//! mutation bumps a monotonically increasing version stamp that snapshot
//! readers can report against.
//!
//! Creation date and media kind are identity attributes and are indexed when
//! an item is registered; tag and token entries exist only for committed
//! analysis results. Readers never observe a half-applied swap.

use chrono::{DateTime, Utc};
use pml_common::models::{Fingerprint, ItemAttrs, MediaItem, MediaKind, ProcessingState};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use uuid::Uuid;

/// Index errors
#[derive(Debug, Error)]
pub enum IndexError {
    /// Item is not in the index
    #[error("item not found: {0}")]
    NotFound(Uuid),

    /// The requested edge is not part of the processing state machine
    #[error("invalid state transition for {item}: {from:?} -> {to:?}")]
    InvalidTransition {
        item: Uuid,
        from: ProcessingState,
        to: ProcessingState,
    },

    /// Internal consistency violation (e.g. a commit applied twice).
    /// Fatal to the index; recovery is a full rebuild from the asset
    /// source plus the stored snapshot.
    #[error("index corruption detected for {0}: committed attributes diverged")]
    Corruption(Uuid),
}

/// Case-insensitive whitespace tokenization used for text and location
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split_whitespace()
        .map(|token| token.trim().to_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

#[derive(Default)]
struct IndexInner {
    items: HashMap<Uuid, MediaItem>,
    by_tag: HashMap<String, BTreeSet<Uuid>>,
    by_token: HashMap<String, BTreeSet<Uuid>>,
    by_date: BTreeSet<(i64, Uuid)>,
    by_kind: HashMap<MediaKind, BTreeSet<Uuid>>,
}

impl IndexInner {
    fn tag_keys(attrs: &ItemAttrs) -> BTreeSet<String> {
        attrs.tags.iter().map(|tag| tag.to_lowercase()).collect()
    }

    fn token_keys(attrs: &ItemAttrs) -> BTreeSet<String> {
        let mut tokens = tokenize(&attrs.detected_text);
        if let Some(location) = &attrs.location {
            tokens.extend(tokenize(location));
        }
        tokens
    }

    fn add_attr_entries(&mut self, id: Uuid, attrs: &ItemAttrs) {
        for key in Self::tag_keys(attrs) {
            self.by_tag.entry(key).or_default().insert(id);
        }
        for key in Self::token_keys(attrs) {
            self.by_token.entry(key).or_default().insert(id);
        }
    }

    fn remove_attr_entries(&mut self, id: Uuid, attrs: &ItemAttrs) {
        for key in Self::tag_keys(attrs) {
            if let Some(set) = self.by_tag.get_mut(&key) {
                set.remove(&id);
                if set.is_empty() {
                    self.by_tag.remove(&key);
                }
            }
        }
        for key in Self::token_keys(attrs) {
            if let Some(set) = self.by_token.get_mut(&key) {
                set.remove(&id);
                if set.is_empty() {
                    self.by_token.remove(&key);
                }
            }
        }
    }

    fn add_identity_entries(&mut self, item: &MediaItem) {
        self.by_date
            .insert((item.created_at.timestamp_millis(), item.id));
        self.by_kind.entry(item.kind).or_default().insert(item.id);
    }

    fn remove_identity_entries(&mut self, item: &MediaItem) {
        self.by_date
            .remove(&(item.created_at.timestamp_millis(), item.id));
        if let Some(set) = self.by_kind.get_mut(&item.kind) {
            set.remove(&item.id);
            if set.is_empty() {
                self.by_kind.remove(&item.kind);
            }
        }
    }
}

/// Consistent point-in-time view for scans and queries.
///
/// Borrowed from the read-locked index; readers see one version for the
/// whole scan without blocking writers beyond the lock itself.
pub struct IndexView<'a> {
    inner: &'a IndexInner,
    version: u64,
}

impl<'a> IndexView<'a> {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.inner.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&MediaItem> {
        self.inner.items.get(&id)
    }

    pub fn items(&self) -> impl Iterator<Item = &MediaItem> {
        self.inner.items.values()
    }
}

/// Concurrent multi-attribute media index
pub struct MediaIndex {
    inner: RwLock<IndexInner>,
    commit_guards: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    version: AtomicU64,
}

impl Default for MediaIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IndexInner::default()),
            commit_guards: Mutex::new(HashMap::new()),
            version: AtomicU64::new(0),
        }
    }

    fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current version stamp; bumped by every mutation
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Raise the version stamp to at least `floor`. Used when loading a
    /// persisted snapshot so stamps stay monotonic across restarts.
    pub fn restore_version(&self, floor: u64) {
        self.version.fetch_max(floor, Ordering::SeqCst);
    }

    /// Register a new item. Identity entries (date, kind) are indexed
    /// immediately; any attrs the item carries (snapshot load) as well.
    /// Returns false if the id is already known.
    pub fn insert_item(&self, item: MediaItem) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.items.contains_key(&item.id) {
            return false;
        }
        inner.add_identity_entries(&item);
        let attrs = item.attrs.clone();
        let id = item.id;
        inner.add_attr_entries(id, &attrs);
        inner.items.insert(id, item);
        drop(inner);
        self.bump_version();
        true
    }

    /// Remove an item and every index entry it contributed
    pub fn remove_item(&self, id: Uuid) -> Option<MediaItem> {
        let mut inner = self.inner.write().unwrap();
        let item = inner.items.remove(&id)?;
        inner.remove_identity_entries(&item);
        let attrs = item.attrs.clone();
        inner.remove_attr_entries(id, &attrs);
        drop(inner);
        self.bump_version();
        Some(item)
    }

    pub fn get(&self, id: Uuid) -> Option<MediaItem> {
        self.inner.read().unwrap().items.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_ids(&self) -> Vec<Uuid> {
        let inner = self.inner.read().unwrap();
        let mut ids: Vec<_> = inner.items.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Clone of every item, for snapshot persistence and rebuilds
    pub fn items_snapshot(&self) -> Vec<MediaItem> {
        let inner = self.inner.read().unwrap();
        let mut items: Vec<_> = inner.items.values().cloned().collect();
        items.sort_by_key(|item| item.id);
        items
    }

    /// Validated state-machine transition. Returns the previous state.
    pub fn transition(&self, id: Uuid, to: ProcessingState) -> Result<ProcessingState, IndexError> {
        let mut inner = self.inner.write().unwrap();
        let item = inner.items.get_mut(&id).ok_or(IndexError::NotFound(id))?;
        let from = item.state;
        if !from.can_transition_to(to) {
            return Err(IndexError::InvalidTransition { item: id, from, to });
        }
        item.state = to;
        drop(inner);
        self.bump_version();
        Ok(from)
    }

    /// Coordinator-only state restore, outside the processing state machine:
    /// cancellation revert and fingerprint-change reset. Returns the
    /// previous state.
    pub fn force_state(&self, id: Uuid, to: ProcessingState) -> Result<ProcessingState, IndexError> {
        let mut inner = self.inner.write().unwrap();
        let item = inner.items.get_mut(&id).ok_or(IndexError::NotFound(id))?;
        let from = item.state;
        item.state = to;
        drop(inner);
        self.bump_version();
        tracing::debug!(item_id = %id, from = ?from, to = ?to, "State restored outside state machine");
        Ok(from)
    }

    /// Record a new source fingerprint for an item (re-analysis pending;
    /// committed attrs stay visible until the next commit)
    pub fn update_fingerprint(&self, id: Uuid, fingerprint: Fingerprint) -> Result<(), IndexError> {
        let mut inner = self.inner.write().unwrap();
        let item = inner.items.get_mut(&id).ok_or(IndexError::NotFound(id))?;
        item.fingerprint = fingerprint;
        drop(inner);
        self.bump_version();
        Ok(())
    }

    /// Per-item commit guard. Holding it serializes commits (and commit
    /// decisions, e.g. cancellation discard) for that single item only.
    pub fn commit_guard(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut guards = self.commit_guards.lock().unwrap();
        guards
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Atomically swap an item's contribution to every inverted index.
    ///
    /// `old_attrs` must match the attrs currently stored for the item; a
    /// mismatch means the commit was applied twice or the index diverged,
    /// which is fatal ([`IndexError::Corruption`]). Old entries are removed
    /// and new entries inserted inside one exclusive section, so no reader
    /// ever observes the gap. Returns the version stamp of the commit.
    pub fn commit(
        &self,
        id: Uuid,
        old_attrs: &ItemAttrs,
        new_attrs: ItemAttrs,
        analyzed: Fingerprint,
    ) -> Result<u64, IndexError> {
        let mut inner = self.inner.write().unwrap();
        let item = inner.items.get(&id).ok_or(IndexError::NotFound(id))?;
        if item.attrs != *old_attrs {
            return Err(IndexError::Corruption(id));
        }

        inner.remove_attr_entries(id, old_attrs);
        inner.add_attr_entries(id, &new_attrs);
        let item = inner
            .items
            .get_mut(&id)
            .expect("item present above under the same write lock");
        item.attrs = new_attrs;
        item.last_analyzed = Some(analyzed);
        drop(inner);
        Ok(self.bump_version())
    }

    /// Direct user edit, independent of analysis state and immediately
    /// index-visible. Returns the new flag value.
    pub fn favorite_toggle(&self, id: Uuid) -> Result<bool, IndexError> {
        let mut inner = self.inner.write().unwrap();
        let item = inner.items.get_mut(&id).ok_or(IndexError::NotFound(id))?;
        item.favorite = !item.favorite;
        let favorite = item.favorite;
        drop(inner);
        self.bump_version();
        Ok(favorite)
    }

    /// Rewrite face-cluster membership after a registry merge. Internal
    /// metadata fix-up, not an analysis commit. Returns affected item count.
    pub fn replace_face_cluster(&self, old: Uuid, new: Uuid) -> usize {
        let mut inner = self.inner.write().unwrap();
        let mut affected = 0;
        for item in inner.items.values_mut() {
            if item.attrs.face_clusters.remove(&old) {
                item.attrs.face_clusters.insert(new);
                affected += 1;
            }
        }
        drop(inner);
        if affected > 0 {
            self.bump_version();
        }
        affected
    }

    /// Items carrying the given tag (case-insensitive), sorted by id
    pub fn lookup_by_tag(&self, tag: &str) -> Vec<Uuid> {
        let inner = self.inner.read().unwrap();
        inner
            .by_tag
            .get(&tag.to_lowercase())
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Items whose detected text or location contains the given token
    /// (exact token, case-insensitive), sorted by id
    pub fn lookup_by_token(&self, token: &str) -> Vec<Uuid> {
        let inner = self.inner.read().unwrap();
        inner
            .by_token
            .get(&token.to_lowercase())
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn lookup_by_kind(&self, kind: MediaKind) -> Vec<Uuid> {
        let inner = self.inner.read().unwrap();
        inner
            .by_kind
            .get(&kind)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Items created within the inclusive range, ascending by (date, id)
    pub fn range_by_date(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Uuid> {
        let inner = self.inner.read().unwrap();
        inner
            .by_date
            .range((start.timestamp_millis(), Uuid::nil())..=(end.timestamp_millis(), Uuid::max()))
            .map(|(_, id)| *id)
            .collect()
    }

    /// Run a closure over a consistent point-in-time view
    pub fn with_snapshot<R>(&self, f: impl FnOnce(&IndexView<'_>) -> R) -> R {
        let inner = self.inner.read().unwrap();
        let view = IndexView {
            inner: &inner,
            version: self.version.load(Ordering::SeqCst),
        };
        f(&view)
    }

    /// Replace the entire index content, re-deriving every inverted entry
    /// from the items' committed attrs. Used on snapshot load and for
    /// corruption recovery. Returns the new version stamp.
    pub fn rebuild(&self, items: Vec<MediaItem>) -> u64 {
        let mut fresh = IndexInner::default();
        for item in items {
            fresh.add_identity_entries(&item);
            let attrs = item.attrs.clone();
            fresh.add_attr_entries(item.id, &attrs);
            fresh.items.insert(item.id, item);
        }
        let count = fresh.items.len();
        let mut inner = self.inner.write().unwrap();
        *inner = fresh;
        drop(inner);
        let version = self.bump_version();
        tracing::info!(item_count = count, version, "Index rebuilt");
        version
    }

    /// Verify that every inverted entry for an item exactly matches its
    /// stored attrs (index–item consistency)
    pub fn verify_item(&self, id: Uuid) -> Result<(), IndexError> {
        let inner = self.inner.read().unwrap();
        let item = inner.items.get(&id).ok_or(IndexError::NotFound(id))?;

        let expected_tags = IndexInner::tag_keys(&item.attrs);
        let expected_tokens = IndexInner::token_keys(&item.attrs);

        for (key, set) in &inner.by_tag {
            if set.contains(&id) != expected_tags.contains(key) {
                return Err(IndexError::Corruption(id));
            }
        }
        for key in &expected_tags {
            if !inner.by_tag.get(key).is_some_and(|set| set.contains(&id)) {
                return Err(IndexError::Corruption(id));
            }
        }
        for (key, set) in &inner.by_token {
            if set.contains(&id) != expected_tokens.contains(key) {
                return Err(IndexError::Corruption(id));
            }
        }
        for key in &expected_tokens {
            if !inner.by_token.get(key).is_some_and(|set| set.contains(&id)) {
                return Err(IndexError::Corruption(id));
            }
        }
        if !inner
            .by_date
            .contains(&(item.created_at.timestamp_millis(), id))
        {
            return Err(IndexError::Corruption(id));
        }
        if !inner.by_kind.get(&item.kind).is_some_and(|set| set.contains(&id)) {
            return Err(IndexError::Corruption(id));
        }
        Ok(())
    }
}
