use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::OnceCell;

use super::{Contract, Shape, SkillKind, Sink};
use crate::config::{SkillDefinition, SkillParams, VectorStoreParams};
use crate::db;
use crate::error::StageError;
use crate::models::{FieldMapping, IndexRecord, Item};

const DEFAULT_TABLE: &str = "index_records";

/// Vector store backed by a SQLite table keyed by `chunk_id`.
///
/// Embeddings are stored as little-endian `f32` BLOBs. The full record,
/// with field names remapped through `field_mapping`, is kept alongside
/// as JSON for consumers that expect their own schema.
pub struct SqliteVectorStore {
    pool: SqlitePool,
    table: String,
    mapping: FieldMapping,
    batch_size: usize,
    ready: OnceCell<()>,
}

pub fn build(def: &SkillDefinition) -> Result<SkillKind> {
    let SkillParams::VectorStore(params) = &def.params else {
        bail!("expected vector-store params");
    };
    Ok(SkillKind::sink(SqliteVectorStore::new(params)?))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Encode a float vector as little-endian bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn classify(err: sqlx::Error) -> StageError {
    let retryable = match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => db.message().contains("locked") || db.message().contains("busy"),
        _ => false,
    };
    if retryable {
        StageError::transient(err)
    } else {
        StageError::permanent(err)
    }
}

impl SqliteVectorStore {
    /// The pool connects on first write; construction only checks params.
    pub fn new(params: &VectorStoreParams) -> Result<Self> {
        let table = params.table.clone().unwrap_or_else(|| DEFAULT_TABLE.to_string());
        if !is_identifier(&table) {
            bail!("table '{}' is not a valid SQL identifier", table);
        }
        if !params.connection_string.starts_with("sqlite:") {
            bail!(
                "connection_string must start with 'sqlite:', got '{}'",
                params.connection_string
            );
        }
        Ok(Self {
            pool: db::connect_lazy(&params.connection_string)?,
            table,
            mapping: FieldMapping::from_map(&params.field_mapping),
            batch_size: params.batch_size.max(1),
            ready: OnceCell::new(),
        })
    }

    /// Create the table on first use. Failing here means the store is
    /// unreachable, which stops the run.
    async fn ensure_table(&self) -> Result<(), StageError> {
        self.ready
            .get_or_try_init(|| async {
                let ddl = format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        chunk_id TEXT PRIMARY KEY,
                        document_id TEXT NOT NULL,
                        content TEXT NOT NULL,
                        embedding BLOB NOT NULL,
                        record_json TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    )",
                    self.table
                );
                sqlx::query(&ddl)
                    .execute(&self.pool)
                    .await
                    .map(|_| ())
                    .map_err(|e| StageError::fatal(format!("vector store unavailable: {}", e)))
            })
            .await
            .map(|_| ())
    }

    async fn upsert(&self, records: &[IndexRecord]) -> Result<(), sqlx::Error> {
        let sql = format!(
            "INSERT INTO {} (chunk_id, document_id, content, embedding, record_json, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(chunk_id) DO UPDATE SET
                document_id = excluded.document_id,
                content = excluded.content,
                embedding = excluded.embedding,
                record_json = excluded.record_json,
                updated_at = excluded.updated_at",
            self.table
        );
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        for record in records {
            let json = serde_json::Value::Object(record.to_mapped_json(&self.mapping)).to_string();
            sqlx::query(&sql)
                .bind(&record.chunk_id)
                .bind(&record.document_id)
                .bind(&record.content)
                .bind(vec_to_blob(&record.embedding))
                .bind(&json)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl Sink for SqliteVectorStore {
    fn contract(&self) -> Contract {
        Contract::sink(&[Shape::EmbeddedChunk])
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn write(&self, batch: &[Item]) -> Result<(), StageError> {
        self.ensure_table().await?;

        let mut records = Vec::with_capacity(batch.len());
        for item in batch {
            match item {
                Item::Chunk(chunk) if chunk.embedding.is_some() => {
                    records.push(IndexRecord::from_chunk(chunk))
                }
                other => {
                    return Err(StageError::permanent(format!(
                        "vector store cannot store a {}",
                        other.kind()
                    )))
                }
            }
        }

        self.upsert(&records).await.map_err(classify)?;
        tracing::debug!(table = %self.table, records = records.len(), "upserted records");
        Ok(())
    }

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), StageError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        self.ensure_table().await?;
        let sql = format!("DELETE FROM {} WHERE chunk_id = ?", self.table);
        let mut tx = self.pool.begin().await.map_err(classify)?;
        for id in chunk_ids {
            sqlx::query(&sql)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }
        tx.commit().await.map_err(classify)?;
        tracing::debug!(table = %self.table, deleted = chunk_ids.len(), "deleted superseded records");
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, Document};
    use sqlx::Row;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn params(conn: String, mapping: &[(&str, &str)]) -> VectorStoreParams {
        VectorStoreParams {
            connection_string: conn,
            table: None,
            field_mapping: mapping
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            batch_size: 2,
        }
    }

    fn embedded(doc_id: &str, position: usize, text: &str) -> Item {
        let doc = Document::new(doc_id, format!("file:///{}", doc_id), text);
        Item::Chunk(Chunk::from_document(&doc, position, text).with_embedding(vec![1.0, -0.5]))
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn rejects_bad_table_and_scheme() {
        let mut p = params("sqlite::memory:".into(), &[]);
        p.table = Some("drop table;".into());
        assert!(SqliteVectorStore::new(&p).is_err());
        let p = params("postgres://localhost/db".into(), &[]);
        assert!(SqliteVectorStore::new(&p).is_err());
    }

    #[tokio::test]
    async fn upserts_and_deletes_by_chunk_id() {
        let tmp = TempDir::new().unwrap();
        let conn = format!("sqlite:{}", tmp.path().join("store.db").display());
        let store = SqliteVectorStore::new(&params(conn.clone(), &[("content", "text")])).unwrap();

        let a = embedded("a", 0, "alpha");
        let b = embedded("b", 0, "beta");
        store.write(&[a.clone(), b]).await.unwrap();
        // Writing the same chunk again replaces it.
        store.write(&[a.clone()]).await.unwrap();

        let pool = db::connect(&conn).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);

        let row = sqlx::query("SELECT embedding, record_json FROM index_records WHERE chunk_id = ?")
            .bind(a.id())
            .fetch_one(&pool)
            .await
            .unwrap();
        let blob: Vec<u8> = row.get("embedding");
        assert_eq!(blob_to_vec(&blob), vec![1.0, -0.5]);
        let json: serde_json::Value = serde_json::from_str(row.get("record_json")).unwrap();
        assert_eq!(json["text"], "alpha");

        store.delete(&[a.id().to_string()]).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn unembedded_chunk_is_permanent() {
        let store = SqliteVectorStore::new(&params("sqlite::memory:".into(), &[])).unwrap();
        let doc = Document::new("d", "u", "x");
        let bare = Item::Chunk(Chunk::from_document(&doc, 0, "x"));
        assert!(matches!(store.write(&[bare]).await, Err(StageError::Permanent(_))));
    }

    #[tokio::test]
    async fn unreachable_store_is_fatal() {
        let tmp = TempDir::new().unwrap();
        // A directory cannot be opened as a database file.
        let conn = format!("sqlite:{}", tmp.path().display());
        let store = SqliteVectorStore::new(&params(conn, &[])).unwrap();
        assert!(matches!(
            store.write(&[embedded("a", 0, "x")]).await,
            Err(StageError::Fatal(_))
        ));
    }
}
