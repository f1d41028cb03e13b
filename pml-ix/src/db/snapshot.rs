//! Persisted snapshot of the media item set
//!
//! A serialized list of item records plus a monotonically increasing
//! version stamp, written after each completed batch. On startup the
//! coordinator loads the snapshot and reconciles it against the source
//! listing instead of rebuilding the library from zero.

use chrono::{TimeZone, Utc};
use pml_common::models::{Fingerprint, ItemAttrs, MediaItem, MediaKind, ProcessingState};
use pml_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Replace the stored item set and raise the version stamp.
///
/// The stamp never decreases, even if a caller passes a stale version.
pub async fn save_snapshot(pool: &SqlitePool, items: &[MediaItem], version: u64) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM media_items")
        .execute(&mut *tx)
        .await?;

    for item in items {
        let tags = serde_json::to_string(&item.attrs.tags)
            .map_err(|e| Error::Internal(format!("tag serialization failed: {}", e)))?;
        let face_clusters = serde_json::to_string(&item.attrs.face_clusters)
            .map_err(|e| Error::Internal(format!("face serialization failed: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO media_items
                (id, content_hash, modified_ms, created_ms, kind, tags,
                 detected_text, face_clusters, location, favorite, state,
                 analyzed_hash, analyzed_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.id.to_string())
        .bind(&item.fingerprint.content_hash)
        .bind(item.fingerprint.modified_ms)
        .bind(item.created_at.timestamp_millis())
        .bind(item.kind.as_str())
        .bind(tags)
        .bind(&item.attrs.detected_text)
        .bind(face_clusters)
        .bind(item.attrs.location.as_deref())
        .bind(item.favorite as i64)
        .bind(item.state.as_str())
        .bind(item.last_analyzed.as_ref().map(|fp| fp.content_hash.clone()))
        .bind(item.last_analyzed.as_ref().map(|fp| fp.modified_ms))
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO snapshot_meta (id, version) VALUES (1, ?)
        ON CONFLICT(id) DO UPDATE SET version = MAX(version, excluded.version)
        "#,
    )
    .bind(version as i64)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Load the stored item set and version stamp.
///
/// Transient states (QUEUED, PROCESSING) collapse to UNPROCESSED: they
/// described in-flight work of a previous run that no longer exists.
pub async fn load_snapshot(pool: &SqlitePool) -> Result<(Vec<MediaItem>, u64)> {
    let rows = sqlx::query("SELECT * FROM media_items")
        .fetch_all(pool)
        .await?;

    let mut items = Vec::with_capacity(rows.len());
    for row in &rows {
        items.push(item_from_row(row)?);
    }

    let version: i64 = sqlx::query("SELECT version FROM snapshot_meta WHERE id = 1")
        .fetch_optional(pool)
        .await?
        .map(|row| row.try_get("version"))
        .transpose()?
        .unwrap_or(0);

    Ok((items, version as u64))
}

fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<MediaItem> {
    let id_text: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id_text)
        .map_err(|e| Error::Internal(format!("invalid item id {}: {}", id_text, e)))?;

    let kind_text: String = row.try_get("kind")?;
    let kind = MediaKind::parse(&kind_text)
        .ok_or_else(|| Error::Internal(format!("unknown media kind: {}", kind_text)))?;

    let state_text: String = row.try_get("state")?;
    let state = ProcessingState::parse(&state_text)
        .ok_or_else(|| Error::Internal(format!("unknown state: {}", state_text)))?;
    let state = match state {
        ProcessingState::Queued | ProcessingState::Processing => ProcessingState::Unprocessed,
        other => other,
    };

    let tags_json: String = row.try_get("tags")?;
    let tags: BTreeSet<String> = serde_json::from_str(&tags_json)
        .map_err(|e| Error::Internal(format!("invalid tags column: {}", e)))?;

    let faces_json: String = row.try_get("face_clusters")?;
    let face_clusters: BTreeSet<Uuid> = serde_json::from_str(&faces_json)
        .map_err(|e| Error::Internal(format!("invalid face_clusters column: {}", e)))?;

    let created_ms: i64 = row.try_get("created_ms")?;
    let created_at = Utc
        .timestamp_millis_opt(created_ms)
        .single()
        .ok_or_else(|| Error::Internal(format!("invalid created_ms: {}", created_ms)))?;

    let analyzed_hash: Option<String> = row.try_get("analyzed_hash")?;
    let analyzed_ms: Option<i64> = row.try_get("analyzed_ms")?;
    let last_analyzed = match (analyzed_hash, analyzed_ms) {
        (Some(hash), Some(ms)) => Some(Fingerprint::new(hash, ms)),
        _ => None,
    };

    let favorite: i64 = row.try_get("favorite")?;

    Ok(MediaItem {
        id,
        fingerprint: Fingerprint::new(
            row.try_get::<String, _>("content_hash")?,
            row.try_get::<i64, _>("modified_ms")?,
        ),
        created_at,
        kind,
        attrs: ItemAttrs {
            tags,
            detected_text: row.try_get("detected_text")?,
            face_clusters,
            location: row.try_get("location")?,
        },
        favorite: favorite != 0,
        state,
        last_analyzed,
    })
}
