//! Shared test fixtures: in-memory asset source and scripted analyzer
//! capabilities.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pml_common::config::ServiceConfig;
use pml_common::events::{EventBus, MediaEvent};
use pml_common::models::{Fingerprint, MediaKind};
use pml_ix::analyzer::{
    AnalysisError, AnalyzerSet, FaceCapability, GeoCapability, TagCapability, TextCapability,
};
use pml_ix::ingest::SchedulerConfig;
use pml_ix::source::{AssetEntry, AssetSource, SourceError};
use pml_ix::AppState;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Content payload understood by the scripted capabilities
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestAsset {
    pub tags: Vec<String>,
    pub text: String,
    pub faces: Vec<String>,
    pub location: Option<String>,
}

impl TestAsset {
    pub fn with_tags(tags: &[&str]) -> Self {
        Self {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }
}

fn parse_asset(content: &[u8]) -> Result<TestAsset, AnalysisError> {
    serde_json::from_slice(content)
        .map_err(|e| AnalysisError::Permanent(format!("unreadable content: {}", e)))
}

struct StoredAsset {
    entry: AssetEntry,
    content: Option<Vec<u8>>,
}

/// In-memory asset source with controllable availability and fingerprints
#[derive(Default)]
pub struct MemorySource {
    assets: Mutex<Vec<StoredAsset>>,
    clock: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_asset(&self, created_at: DateTime<Utc>, asset: &TestAsset) -> Uuid {
        let id = Uuid::new_v4();
        let bytes = asset.to_bytes();
        let modified = self.clock.fetch_add(1, Ordering::SeqCst) as i64;
        let fingerprint = Fingerprint::new(format!("{:x}", Sha256::digest(&bytes)), modified);
        self.assets.lock().unwrap().push(StoredAsset {
            entry: AssetEntry {
                id,
                fingerprint,
                created_at,
                kind: MediaKind::Photo,
            },
            content: Some(bytes),
        });
        id
    }

    /// Replace content (and therefore the fingerprint) of an item
    pub fn update_asset(&self, id: Uuid, asset: &TestAsset) {
        let bytes = asset.to_bytes();
        let modified = self.clock.fetch_add(1, Ordering::SeqCst) as i64;
        let mut assets = self.assets.lock().unwrap();
        let stored = assets
            .iter_mut()
            .find(|stored| stored.entry.id == id)
            .expect("unknown asset id");
        stored.entry.fingerprint =
            Fingerprint::new(format!("{:x}", Sha256::digest(&bytes)), modified);
        stored.content = Some(bytes);
    }

    /// Keep the item listed but make its content unavailable
    pub fn set_unavailable(&self, id: Uuid) {
        let mut assets = self.assets.lock().unwrap();
        if let Some(stored) = assets.iter_mut().find(|stored| stored.entry.id == id) {
            stored.content = None;
        }
    }

    /// Drop the item from the listing entirely
    pub fn remove_asset(&self, id: Uuid) {
        self.assets
            .lock()
            .unwrap()
            .retain(|stored| stored.entry.id != id);
    }
}

#[async_trait]
impl AssetSource for MemorySource {
    async fn list_items(&self) -> Result<Vec<AssetEntry>, SourceError> {
        Ok(self
            .assets
            .lock()
            .unwrap()
            .iter()
            .map(|stored| stored.entry.clone())
            .collect())
    }

    async fn fetch_content(&self, id: Uuid) -> Result<Vec<u8>, SourceError> {
        let assets = self.assets.lock().unwrap();
        match assets.iter().find(|stored| stored.entry.id == id) {
            Some(StoredAsset {
                content: Some(bytes),
                ..
            }) => Ok(bytes.clone()),
            _ => Err(SourceError::AssetUnavailable(id)),
        }
    }
}

/// Tag capability reading the JSON payload; counts invocations
#[derive(Default)]
pub struct ScriptedTags {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TagCapability for ScriptedTags {
    async fn tags(&self, content: &[u8]) -> Result<Vec<String>, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(parse_asset(content)?.tags)
    }
}

/// Tag capability that blocks until the test opens its gate
pub struct GatedTags {
    pub gate: Arc<tokio::sync::Semaphore>,
    pub calls: AtomicUsize,
}

impl GatedTags {
    pub fn new() -> (Arc<Self>, Arc<tokio::sync::Semaphore>) {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        (
            Arc::new(Self {
                gate: Arc::clone(&gate),
                calls: AtomicUsize::new(0),
            }),
            gate,
        )
    }
}

#[async_trait]
impl TagCapability for GatedTags {
    async fn tags(&self, content: &[u8]) -> Result<Vec<String>, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| AnalysisError::Transient("gate closed".to_string()))?;
        permit.forget();
        Ok(parse_asset(content)?.tags)
    }
}

pub struct ScriptedText;

#[async_trait]
impl TextCapability for ScriptedText {
    async fn recognize_text(&self, content: &[u8]) -> Result<String, AnalysisError> {
        Ok(parse_asset(content)?.text)
    }
}

/// Text capability that times out (transient) on every attempt
#[derive(Default)]
pub struct AlwaysTransientText {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TextCapability for AlwaysTransientText {
    async fn recognize_text(&self, _content: &[u8]) -> Result<String, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AnalysisError::Transient("recognizer timed out".to_string()))
    }
}

/// Tag capability failing permanently (structurally unreadable content)
pub struct PermanentTags;

#[async_trait]
impl TagCapability for PermanentTags {
    async fn tags(&self, _content: &[u8]) -> Result<Vec<String>, AnalysisError> {
        Err(AnalysisError::Permanent("corrupt container".to_string()))
    }
}

pub struct ScriptedFaces;

#[async_trait]
impl FaceCapability for ScriptedFaces {
    async fn face_signatures(&self, content: &[u8]) -> Result<Vec<String>, AnalysisError> {
        Ok(parse_asset(content)?.faces)
    }
}

pub struct ScriptedGeo;

#[async_trait]
impl GeoCapability for ScriptedGeo {
    async fn locate(&self, content: &[u8]) -> Result<Option<String>, AnalysisError> {
        Ok(parse_asset(content)?.location)
    }
}

/// Fast scheduler config for tests
pub fn test_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        workers: 2,
        max_attempts: 3,
        retry_base: Duration::from_millis(1),
        retry_cap: Duration::from_millis(5),
        // Generous ceiling: gated capabilities wait on the test, and a
        // spurious timeout would turn a scripted success into a retry
        capability_timeout: Duration::from_secs(30),
    }
}

/// Full analyzer set reading the JSON payload
pub fn scripted_analyzers() -> (AnalyzerSet, Arc<ScriptedTags>) {
    let tags = Arc::new(ScriptedTags::default());
    let analyzers = AnalyzerSet::new()
        .with_tags(Arc::clone(&tags) as Arc<dyn TagCapability>)
        .with_text(Arc::new(ScriptedText))
        .with_faces(Arc::new(ScriptedFaces))
        .with_geo(Arc::new(ScriptedGeo));
    (analyzers, tags)
}

/// Wire an AppState around the given source and analyzers with an
/// in-memory snapshot database.
pub async fn test_state(source: Arc<MemorySource>, analyzers: AnalyzerSet) -> AppState {
    let db = pml_ix::db::init_memory_pool().await.unwrap();
    let event_bus = EventBus::new(ServiceConfig::default().event_capacity);
    AppState::new(db, event_bus, source, analyzers, test_scheduler_config())
}

/// Await the next BatchCompleted event (subscribe before enqueueing)
pub async fn wait_for_batch_completed(rx: &mut tokio::sync::broadcast::Receiver<MediaEvent>) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(MediaEvent::BatchCompleted { .. }) => break,
                Ok(_) => {}
                Err(e) => panic!("event bus closed while waiting for batch: {}", e),
            }
        }
    })
    .await
    .expect("batch did not complete in time");
}

/// Poll until the predicate holds (5s ceiling)
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
