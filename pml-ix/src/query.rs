//! Query engine
//!
//! Evaluates a free-text query plus structured filters against the media
//! index. Matching is OR across fields (tag, detected text, location) and
//! AND across filters. Results are fully deterministic: ranked by distinct
//! matched-token count descending, then creation timestamp descending, then
//! id ascending.

use crate::index::{tokenize, MediaIndex};
use chrono::{DateTime, Utc};
use pml_common::models::{MediaItem, MediaKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Query errors
#[derive(Debug, Error)]
pub enum QueryError {
    /// Invalid filter combination; rejected to the caller, never silently
    /// corrected
    #[error("malformed filter: {0}")]
    MalformedFilter(String),
}

/// Inclusive creation-date constraint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Structured search filters. Absent fields are unconstrained; there are no
/// sentinel values in the domain value space.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSet {
    /// Inclusive membership test against the creation timestamp
    pub date_range: Option<DateRange>,
    /// Exact media kind; None matches any
    pub kind: Option<MediaKind>,
    /// Case-insensitive location substring
    pub location: Option<String>,
    /// Item must carry all listed tags
    pub tags: Vec<String>,
}

impl FilterSet {
    fn validate(&self) -> Result<(), QueryError> {
        if let Some(range) = &self.date_range {
            if range.start > range.end {
                return Err(QueryError::MalformedFilter(format!(
                    "inverted date range: {} > {}",
                    range.start, range.end
                )));
            }
        }
        Ok(())
    }

    fn matches(&self, item: &MediaItem) -> bool {
        if let Some(range) = &self.date_range {
            if item.created_at < range.start || item.created_at > range.end {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if item.kind != kind {
                return false;
            }
        }
        if let Some(location) = &self.location {
            let needle = location.to_lowercase();
            let found = item
                .attrs
                .location
                .as_ref()
                .is_some_and(|loc| loc.to_lowercase().contains(&needle));
            if !found {
                return false;
            }
        }
        if !self.tags.is_empty() {
            let item_tags: Vec<String> =
                item.attrs.tags.iter().map(|tag| tag.to_lowercase()).collect();
            for wanted in &self.tags {
                if !item_tags.contains(&wanted.to_lowercase()) {
                    return false;
                }
            }
        }
        true
    }
}

/// Free-text + filter search over the media index
pub struct QueryEngine {
    index: Arc<MediaIndex>,
}

impl QueryEngine {
    pub fn new(index: Arc<MediaIndex>) -> Self {
        Self { index }
    }

    /// Search the index. Empty (whitespace-only) text yields the empty
    /// sequence regardless of index content; browsing is not a query.
    pub fn search(&self, text: &str, filters: &FilterSet) -> Result<Vec<Uuid>, QueryError> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        filters.validate()?;

        self.index.with_snapshot(|view| {
            let mut scored: Vec<(usize, i64, Uuid)> = Vec::new();
            for item in view.items() {
                if !filters.matches(item) {
                    continue;
                }
                let matched = Self::matched_token_count(item, &tokens);
                if matched > 0 {
                    scored.push((matched, item.created_at.timestamp_millis(), item.id));
                }
            }

            scored.sort_by(|a, b| {
                b.0.cmp(&a.0)
                    .then_with(|| b.1.cmp(&a.1))
                    .then_with(|| a.2.cmp(&b.2))
            });

            Ok(scored.into_iter().map(|(_, _, id)| id).collect())
        })
    }

    /// Count distinct query tokens matched across tag/text/location fields
    fn matched_token_count(
        item: &MediaItem,
        tokens: &std::collections::BTreeSet<String>,
    ) -> usize {
        let tags_lower: Vec<String> = item.attrs.tags.iter().map(|t| t.to_lowercase()).collect();
        let text_lower = item.attrs.detected_text.to_lowercase();
        let location_lower = item
            .attrs
            .location
            .as_ref()
            .map(|loc| loc.to_lowercase())
            .unwrap_or_default();

        tokens
            .iter()
            .filter(|token| {
                tags_lower.iter().any(|tag| tag == *token)
                    || (!text_lower.is_empty() && text_lower.contains(token.as_str()))
                    || (!location_lower.is_empty() && location_lower.contains(token.as_str()))
            })
            .count()
    }
}
