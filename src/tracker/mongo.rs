use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::doc;
use mongodb::error::ErrorKind;
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};

use super::Tracker;
use crate::error::TrackerError;
use crate::models::TrackerEntry;

const DEFAULT_DATABASE: &str = "skillforge";
const COLLECTION: &str = "tracker";

/// Tracker persisted in a MongoDB collection, one document per tracked
/// document keyed by `_id`. The database comes from the connection string
/// path, falling back to `skillforge`.
pub struct MongoTracker {
    entries: Collection<MongoEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MongoEntry {
    #[serde(rename = "_id")]
    document_id: String,
    content_hash: String,
    /// RFC 3339.
    last_processed_at: String,
    chunk_ids: Vec<String>,
}

impl From<&TrackerEntry> for MongoEntry {
    fn from(entry: &TrackerEntry) -> Self {
        Self {
            document_id: entry.document_id.clone(),
            content_hash: entry.content_hash.clone(),
            last_processed_at: entry.last_processed_at.to_rfc3339(),
            chunk_ids: entry.chunk_ids.iter().cloned().collect(),
        }
    }
}

impl MongoEntry {
    fn into_entry(self) -> Result<TrackerEntry, TrackerError> {
        let last_processed_at = DateTime::parse_from_rfc3339(&self.last_processed_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| TrackerError::Corrupt {
                document_id: self.document_id.clone(),
                message: format!("bad timestamp '{}': {}", self.last_processed_at, e),
            })?;
        Ok(TrackerEntry {
            document_id: self.document_id,
            content_hash: self.content_hash,
            last_processed_at,
            chunk_ids: self.chunk_ids.into_iter().collect(),
        })
    }
}

fn mongo_error(e: mongodb::error::Error) -> TrackerError {
    match *e.kind {
        ErrorKind::ServerSelection { .. } | ErrorKind::DnsResolve { .. } => {
            TrackerError::Unavailable(e.to_string())
        }
        _ => TrackerError::Backend(e.to_string()),
    }
}

impl MongoTracker {
    /// Parse the connection string and ping the server.
    pub async fn connect(connection_string: &str) -> Result<Self, TrackerError> {
        let options = ClientOptions::parse(connection_string)
            .await
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?;
        let client = Client::with_options(options).map_err(mongo_error)?;
        let db = client
            .default_database()
            .unwrap_or_else(|| client.database(DEFAULT_DATABASE));
        db.run_command(doc! { "ping": 1 }).await.map_err(mongo_error)?;
        tracing::debug!(database = %db.name(), "connected to mongodb tracker");

        Ok(Self {
            entries: db.collection(COLLECTION),
        })
    }
}

#[async_trait]
impl Tracker for MongoTracker {
    fn name(&self) -> &str {
        "mongodb"
    }

    async fn lookup(&self, document_id: &str) -> Result<Option<TrackerEntry>, TrackerError> {
        self.entries
            .find_one(doc! { "_id": document_id })
            .await
            .map_err(mongo_error)?
            .map(MongoEntry::into_entry)
            .transpose()
    }

    async fn upsert(&self, entry: &TrackerEntry) -> Result<(), TrackerError> {
        self.entries
            .replace_one(doc! { "_id": entry.document_id.as_str() }, MongoEntry::from(entry))
            .upsert(true)
            .await
            .map_err(mongo_error)?;
        Ok(())
    }

    async fn delete(&self, document_id: &str) -> Result<Option<TrackerEntry>, TrackerError> {
        self.entries
            .find_one_and_delete(doc! { "_id": document_id })
            .await
            .map_err(mongo_error)?
            .map(MongoEntry::into_entry)
            .transpose()
    }

    async fn list_stale(&self, seen: &BTreeSet<String>) -> Result<Vec<TrackerEntry>, TrackerError> {
        let seen: Vec<String> = seen.iter().cloned().collect();
        let mut cursor = self
            .entries
            .find(doc! { "_id": { "$nin": seen } })
            .sort(doc! { "_id": 1 })
            .await
            .map_err(mongo_error)?;

        let mut stale = Vec::new();
        while cursor.advance().await.map_err(mongo_error)? {
            let raw = cursor.deserialize_current().map_err(mongo_error)?;
            stale.push(raw.into_entry()?);
        }
        Ok(stale)
    }
}
