//! Change tracking across runs.
//!
//! A tracker remembers, per document id, the content hash and chunk ids of
//! the last successful processing. The engine consults it before a
//! document enters the pipeline and updates it once every record derived
//! from the document has been persisted.
//!
//! Backends are chosen by connection-string scheme:
//!
//! | Scheme | Backend |
//! |--------|---------|
//! | `memory:` | [`InMemoryTracker`], process lifetime only |
//! | `sqlite:` | [`SqliteTracker`], one row per document |
//! | `mongodb://`, `mongodb+srv://` | [`MongoTracker`], one document per tracked document |

mod memory;
mod mongo;
mod sqlite;

pub use memory::InMemoryTracker;
pub use mongo::MongoTracker;
pub use sqlite::SqliteTracker;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TrackerError;
use crate::models::TrackerEntry;

#[async_trait]
pub trait Tracker: Send + Sync {
    /// Backend name for logs, e.g. `"sqlite"`.
    fn name(&self) -> &str;

    async fn lookup(&self, document_id: &str) -> Result<Option<TrackerEntry>, TrackerError>;

    /// Insert or replace the entry for `entry.document_id`.
    async fn upsert(&self, entry: &TrackerEntry) -> Result<(), TrackerError>;

    /// Remove an entry, returning it if it existed.
    async fn delete(&self, document_id: &str) -> Result<Option<TrackerEntry>, TrackerError>;

    /// Entries whose document id is not in `seen`, ordered by id.
    async fn list_stale(&self, seen: &BTreeSet<String>) -> Result<Vec<TrackerEntry>, TrackerError>;

    async fn close(&self) {}
}

/// Open the tracker named by `connection_string`.
pub async fn open(connection_string: &str) -> Result<Arc<dyn Tracker>, TrackerError> {
    if connection_string.starts_with("memory:") {
        return Ok(Arc::new(InMemoryTracker::new()));
    }
    if connection_string.starts_with("sqlite:") {
        let tracker = SqliteTracker::connect(connection_string).await?;
        return Ok(Arc::new(tracker));
    }
    if connection_string.starts_with("mongodb://") || connection_string.starts_with("mongodb+srv://") {
        let tracker = MongoTracker::connect(connection_string).await?;
        return Ok(Arc::new(tracker));
    }
    Err(TrackerError::Unavailable(format!(
        "unsupported tracker connection string '{}'",
        connection_string
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_picks_backend_by_scheme() {
        assert_eq!(open("memory:").await.unwrap().name(), "memory");
        assert_eq!(open("sqlite::memory:").await.unwrap().name(), "sqlite");
        assert!(matches!(
            open("postgres://localhost/tracker").await,
            Err(TrackerError::Unavailable(_))
        ));
        // Routed to the mongodb backend, which cannot reach a server here.
        let err = open("mongodb://127.0.0.1:1/?serverSelectionTimeoutMS=200&directConnection=true")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("unavailable"), "{}", err);
    }
}
