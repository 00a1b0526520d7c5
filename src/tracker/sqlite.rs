use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::Tracker;
use crate::db;
use crate::error::TrackerError;
use crate::models::TrackerEntry;

/// Tracker persisted in a SQLite table.
pub struct SqliteTracker {
    pool: SqlitePool,
}

impl SqliteTracker {
    /// Connect and create the `tracker_entries` table if needed.
    pub async fn connect(connection_string: &str) -> Result<Self, TrackerError> {
        let pool = db::connect(connection_string)
            .await
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?;
        let tracker = Self { pool };
        tracker.migrate().await?;
        Ok(tracker)
    }

    async fn migrate(&self) -> Result<(), TrackerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracker_entries (
                document_id TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                last_processed_at TEXT NOT NULL,
                chunk_ids_json TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn entry_from_row(row: &SqliteRow) -> Result<TrackerEntry, TrackerError> {
        let document_id: String = row.get("document_id");
        let processed: String = row.get("last_processed_at");
        let chunk_ids_json: String = row.get("chunk_ids_json");

        let last_processed_at = DateTime::parse_from_rfc3339(&processed)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| TrackerError::Corrupt {
                document_id: document_id.clone(),
                message: format!("bad timestamp '{}': {}", processed, e),
            })?;
        let chunk_ids: BTreeSet<String> =
            serde_json::from_str(&chunk_ids_json).map_err(|e| TrackerError::Corrupt {
                document_id: document_id.clone(),
                message: format!("bad chunk id list: {}", e),
            })?;

        Ok(TrackerEntry {
            content_hash: row.get("content_hash"),
            document_id,
            last_processed_at,
            chunk_ids,
        })
    }
}

#[async_trait]
impl Tracker for SqliteTracker {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn lookup(&self, document_id: &str) -> Result<Option<TrackerEntry>, TrackerError> {
        let row = sqlx::query(
            "SELECT document_id, content_hash, last_processed_at, chunk_ids_json
             FROM tracker_entries WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn upsert(&self, entry: &TrackerEntry) -> Result<(), TrackerError> {
        let chunk_ids_json = serde_json::to_string(&entry.chunk_ids)
            .map_err(|e| TrackerError::Backend(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO tracker_entries (document_id, content_hash, last_processed_at, chunk_ids_json)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                content_hash = excluded.content_hash,
                last_processed_at = excluded.last_processed_at,
                chunk_ids_json = excluded.chunk_ids_json
            "#,
        )
        .bind(&entry.document_id)
        .bind(&entry.content_hash)
        .bind(entry.last_processed_at.to_rfc3339())
        .bind(&chunk_ids_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, document_id: &str) -> Result<Option<TrackerEntry>, TrackerError> {
        let existing = self.lookup(document_id).await?;
        if existing.is_some() {
            sqlx::query("DELETE FROM tracker_entries WHERE document_id = ?")
                .bind(document_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(existing)
    }

    async fn list_stale(&self, seen: &BTreeSet<String>) -> Result<Vec<TrackerEntry>, TrackerError> {
        let rows = sqlx::query(
            "SELECT document_id, content_hash, last_processed_at, chunk_ids_json
             FROM tracker_entries ORDER BY document_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stale = Vec::new();
        for row in &rows {
            let id: String = row.get("document_id");
            if !seen.contains(&id) {
                stale.push(Self::entry_from_row(row)?);
            }
        }
        Ok(stale)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
