use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::Tracker;
use crate::error::TrackerError;
use crate::models::TrackerEntry;

/// Tracker held in process memory. Useful for tests and one-shot runs
/// where re-runs happen inside the same process.
#[derive(Debug, Default)]
pub struct InMemoryTracker {
    entries: RwLock<BTreeMap<String, TrackerEntry>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Tracker for InMemoryTracker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn lookup(&self, document_id: &str) -> Result<Option<TrackerEntry>, TrackerError> {
        Ok(self.entries.read().await.get(document_id).cloned())
    }

    async fn upsert(&self, entry: &TrackerEntry) -> Result<(), TrackerError> {
        self.entries
            .write()
            .await
            .insert(entry.document_id.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, document_id: &str) -> Result<Option<TrackerEntry>, TrackerError> {
        Ok(self.entries.write().await.remove(document_id))
    }

    async fn list_stale(&self, seen: &BTreeSet<String>) -> Result<Vec<TrackerEntry>, TrackerError> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|e| !seen.contains(&e.document_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: &str, hash: &str) -> TrackerEntry {
        TrackerEntry {
            document_id: id.to_string(),
            content_hash: hash.to_string(),
            last_processed_at: Utc::now(),
            chunk_ids: [format!("{id}-0")].into(),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_and_delete_returns_entry() {
        let t = InMemoryTracker::new();
        t.upsert(&entry("a", "h1")).await.unwrap();
        t.upsert(&entry("a", "h2")).await.unwrap();
        assert_eq!(t.len().await, 1);
        assert_eq!(t.lookup("a").await.unwrap().unwrap().content_hash, "h2");

        let removed = t.delete("a").await.unwrap().unwrap();
        assert_eq!(removed.chunk_ids.len(), 1);
        assert!(t.delete("a").await.unwrap().is_none());
        assert!(t.is_empty().await);
    }

    #[tokio::test]
    async fn stale_entries_are_those_not_seen() {
        let t = InMemoryTracker::new();
        for id in ["a", "b", "c"] {
            t.upsert(&entry(id, "h")).await.unwrap();
        }
        let seen: BTreeSet<String> = ["b".to_string()].into();
        let stale: Vec<String> = t
            .list_stale(&seen)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.document_id)
            .collect();
        assert_eq!(stale, vec!["a", "c"]);
    }
}
