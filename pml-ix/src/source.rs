//! Asset source: enumerates library items with stable identity and content
//! fingerprints, and supplies raw content on demand.
//!
//! The pipeline depends on the [`AssetSource`] trait only; [`FsAssetSource`]
//! is the filesystem-backed implementation used by the binary. Tests use
//! in-memory implementations.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pml_common::models::{Fingerprint, MediaKind};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

/// Asset source errors
#[derive(Debug, Error)]
pub enum SourceError {
    /// Item vanished between listing and fetch; dropped silently by the
    /// pipeline, never retried
    #[error("asset unavailable: {0}")]
    AssetUnavailable(Uuid),

    /// Listing or read failure
    #[error("source I/O error: {0}")]
    Io(String),
}

/// One listed item: identity and fingerprint, no content
#[derive(Debug, Clone)]
pub struct AssetEntry {
    pub id: Uuid,
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    pub kind: MediaKind,
}

/// External collaborator supplying items and their content
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Enumerate all current items with stable ids and fingerprints
    async fn list_items(&self) -> Result<Vec<AssetEntry>, SourceError>;

    /// Fetch raw content of one item
    async fn fetch_content(&self, id: Uuid) -> Result<Vec<u8>, SourceError>;
}

/// Namespace for deriving stable item ids from relative paths
const PATH_ID_NAMESPACE: Uuid = Uuid::from_u128(0x7b1f_a2c4_9d3e_4f50_8a61_c2d4_e6f8_0a1c);

/// Filesystem-backed asset source
///
/// Ids are derived from the path relative to the library root (uuid v5), so
/// they are stable across restarts as long as the file does not move.
pub struct FsAssetSource {
    root: PathBuf,
    ignore_patterns: Vec<String>,
}

impl FsAssetSource {
    /// Create a source rooted at `root` with default ignore patterns
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ignore_patterns: vec![
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                ".git".to_string(),
                ".svn".to_string(),
            ],
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn should_process_entry(&self, entry: &DirEntry) -> bool {
        let file_name = entry.file_name().to_string_lossy();
        !self
            .ignore_patterns
            .iter()
            .any(|pattern| file_name.contains(pattern))
    }

    /// Derive the stable id for a library-relative path
    pub fn id_for_path(&self, relative: &Path) -> Uuid {
        Uuid::new_v5(
            &PATH_ID_NAMESPACE,
            relative.to_string_lossy().as_bytes(),
        )
    }

    fn path_for_id(&self, id: Uuid) -> Result<PathBuf, SourceError> {
        // Reverse lookup by rescanning: ids are path-derived, so walk until
        // the id matches. Library listings are cheap relative to analysis.
        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| self.should_process_entry(e))
            .flatten()
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                if self.id_for_path(relative) == id {
                    return Ok(entry.path().to_path_buf());
                }
            }
        }
        Err(SourceError::AssetUnavailable(id))
    }

    fn classify(path: &Path) -> Option<MediaKind> {
        let kind = infer::get_from_path(path).ok().flatten()?;
        match kind.matcher_type() {
            infer::MatcherType::Image => Some(MediaKind::Photo),
            infer::MatcherType::Video => Some(MediaKind::Video),
            _ => None,
        }
    }

    fn fingerprint(path: &Path) -> Result<(Fingerprint, DateTime<Utc>), SourceError> {
        let bytes = std::fs::read(path)
            .map_err(|e| SourceError::Io(format!("{}: {}", path.display(), e)))?;
        let hash = format!("{:x}", Sha256::digest(&bytes));

        let metadata = std::fs::metadata(path)
            .map_err(|e| SourceError::Io(format!("{}: {}", path.display(), e)))?;
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let created_at = metadata
            .created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(modified_ms);

        let created_at = Utc
            .timestamp_millis_opt(created_at)
            .single()
            .unwrap_or_else(Utc::now);

        Ok((Fingerprint::new(hash, modified_ms), created_at))
    }

    fn list_blocking(&self) -> Result<Vec<AssetEntry>, SourceError> {
        if !self.root.exists() {
            return Err(SourceError::Io(format!(
                "library root not found: {}",
                self.root.display()
            )));
        }

        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| self.should_process_entry(e))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Error accessing entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let Some(kind) = Self::classify(entry.path()) else {
                continue;
            };
            let relative = match entry.path().strip_prefix(&self.root) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => continue,
            };

            let id = self.id_for_path(&relative);
            if !seen.insert(id) {
                tracing::warn!(path = %relative.display(), "Duplicate item id, skipping");
                continue;
            }

            match Self::fingerprint(entry.path()) {
                Ok((fingerprint, created_at)) => entries.push(AssetEntry {
                    id,
                    fingerprint,
                    created_at,
                    kind,
                }),
                Err(e) => {
                    tracing::warn!(path = %relative.display(), error = %e, "Skipping unreadable item");
                }
            }
        }

        tracing::debug!(count = entries.len(), "Asset source listing complete");
        Ok(entries)
    }
}

#[async_trait]
impl AssetSource for FsAssetSource {
    async fn list_items(&self) -> Result<Vec<AssetEntry>, SourceError> {
        let source = Self {
            root: self.root.clone(),
            ignore_patterns: self.ignore_patterns.clone(),
        };
        tokio::task::spawn_blocking(move || source.list_blocking())
            .await
            .map_err(|e| SourceError::Io(format!("listing task failed: {}", e)))?
    }

    async fn fetch_content(&self, id: Uuid) -> Result<Vec<u8>, SourceError> {
        let source = Self {
            root: self.root.clone(),
            ignore_patterns: self.ignore_patterns.clone(),
        };
        tokio::task::spawn_blocking(move || {
            let path = source.path_for_id(id)?;
            std::fs::read(&path).map_err(|_| SourceError::AssetUnavailable(id))
        })
        .await
        .map_err(|e| SourceError::Io(format!("fetch task failed: {}", e)))?
    }
}
