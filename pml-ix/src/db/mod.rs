//! Snapshot database: pool initialization and schema

pub mod snapshot;

use pml_common::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;

/// Open (or create) the snapshot database and ensure the schema exists
pub async fn init_db_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// In-memory pool for tests. One connection so every query sees the same
/// database.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await?;
    create_schema(&pool).await?;
    Ok(pool)
}

async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS media_items (
            id TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            modified_ms INTEGER NOT NULL,
            created_ms INTEGER NOT NULL,
            kind TEXT NOT NULL,
            tags TEXT NOT NULL,
            detected_text TEXT NOT NULL,
            face_clusters TEXT NOT NULL,
            location TEXT,
            favorite INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL,
            analyzed_hash TEXT,
            analyzed_ms INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshot_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
