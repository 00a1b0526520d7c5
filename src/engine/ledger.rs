//! Per-document bookkeeping for a single run.
//!
//! A document is admitted once, at the tracker gate, with one open item.
//! Every stage adjusts the open count by `outputs - 1`; a sink decrements
//! it once per persisted record. When the count reaches zero and nothing
//! derived from the document failed, the document is complete and its
//! tracker entry may be written.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

/// A document whose every derived record has been persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub document_id: String,
    pub content_hash: String,
    pub chunk_ids: BTreeSet<String>,
    /// Chunk ids recorded for an older version that this version no longer
    /// produces.
    pub superseded: Vec<String>,
}

#[derive(Debug)]
struct DocState {
    content_hash: String,
    open: i64,
    failed: bool,
    chunk_ids: BTreeSet<String>,
    previous: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    docs: HashMap<String, DocState>,
    seen: BTreeSet<String>,
    chunks: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct DocumentLedger {
    inner: Mutex<Inner>,
}

impl DocumentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking a document. Returns `false` if a document with the
    /// same id already reached the gate in this run.
    pub fn admit(&self, document_id: &str, content_hash: &str, previous: BTreeSet<String>) -> bool {
        let mut inner = self.lock();
        if !inner.seen.insert(document_id.to_string()) {
            return false;
        }
        inner.docs.insert(
            document_id.to_string(),
            DocState {
                content_hash: content_hash.to_string(),
                open: 1,
                failed: false,
                chunk_ids: BTreeSet::new(),
                previous,
            },
        );
        true
    }

    /// Record a document the gate skipped. Returns `false` on a duplicate id.
    pub fn note_skipped(&self, document_id: &str) -> bool {
        self.lock().seen.insert(document_id.to_string())
    }

    pub fn is_admitted(&self, document_id: &str) -> bool {
        self.lock().docs.contains_key(document_id)
    }

    /// One item of `document_id` turned into `outputs` items.
    pub fn fan_out(&self, document_id: &str, outputs: usize) -> Option<Completed> {
        let mut inner = self.lock();
        let state = inner.docs.get_mut(document_id)?;
        state.open += outputs as i64 - 1;
        Self::settle(&mut inner, document_id)
    }

    /// One item of `document_id` failed for good.
    pub fn fail(&self, document_id: &str) {
        let mut inner = self.lock();
        if let Some(state) = inner.docs.get_mut(document_id) {
            state.failed = true;
            state.open -= 1;
        }
        let _ = Self::settle(&mut inner, document_id);
    }

    /// One item of `document_id` was written by the sink.
    pub fn persisted(&self, document_id: &str, chunk_id: Option<&str>) -> Option<Completed> {
        let mut inner = self.lock();
        let state = inner.docs.get_mut(document_id)?;
        if let Some(id) = chunk_id {
            state.chunk_ids.insert(id.to_string());
        }
        state.open -= 1;
        Self::settle(&mut inner, document_id)
    }

    /// Claim a chunk id for this run. Returns `false` if it was already
    /// claimed by another chunk.
    pub fn claim_chunk(&self, chunk_id: &str) -> bool {
        self.lock().chunks.insert(chunk_id.to_string())
    }

    /// Every document id that reached the gate, admitted or skipped.
    pub fn seen_documents(&self) -> BTreeSet<String> {
        self.lock().seen.clone()
    }

    /// Documents still in flight.
    pub fn open_documents(&self) -> usize {
        self.lock().docs.len()
    }

    fn settle(inner: &mut Inner, document_id: &str) -> Option<Completed> {
        let done = inner.docs.get(document_id).is_some_and(|s| s.open <= 0);
        if !done {
            return None;
        }
        let state = inner.docs.remove(document_id)?;
        if state.failed {
            return None;
        }
        let superseded = state
            .previous
            .difference(&state.chunk_ids)
            .cloned()
            .collect();
        Some(Completed {
            document_id: document_id.to_string(),
            content_hash: state.content_hash,
            chunk_ids: state.chunk_ids,
            superseded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_after_all_chunks_persist() {
        let ledger = DocumentLedger::new();
        assert!(ledger.admit("d", "h", BTreeSet::new()));
        assert!(ledger.fan_out("d", 1).is_none()); // gate
        assert!(ledger.fan_out("d", 3).is_none()); // splitter
        assert!(ledger.persisted("d", Some("c1")).is_none());
        assert!(ledger.persisted("d", Some("c2")).is_none());
        let done = ledger.persisted("d", Some("c3")).unwrap();
        assert_eq!(done.chunk_ids.len(), 3);
        assert_eq!(done.content_hash, "h");
        assert_eq!(ledger.open_documents(), 0);
    }

    #[test]
    fn failure_of_any_chunk_blocks_completion() {
        let ledger = DocumentLedger::new();
        ledger.admit("d", "h", BTreeSet::new());
        ledger.fan_out("d", 2);
        ledger.fail("d");
        assert!(ledger.persisted("d", Some("c1")).is_none());
        assert_eq!(ledger.open_documents(), 0);
    }

    #[test]
    fn document_with_no_chunks_completes_immediately() {
        let ledger = DocumentLedger::new();
        ledger.admit("empty", "h", BTreeSet::new());
        let done = ledger.fan_out("empty", 0).unwrap();
        assert!(done.chunk_ids.is_empty());
    }

    #[test]
    fn superseded_chunks_are_reported() {
        let ledger = DocumentLedger::new();
        let previous: BTreeSet<String> = ["old".to_string(), "kept".to_string()].into();
        ledger.admit("d", "h2", previous);
        ledger.fan_out("d", 1);
        let done = ledger.persisted("d", Some("kept")).unwrap();
        assert_eq!(done.superseded, vec!["old".to_string()]);
    }

    #[test]
    fn duplicates_are_rejected() {
        let ledger = DocumentLedger::new();
        assert!(ledger.admit("d", "h", BTreeSet::new()));
        assert!(!ledger.admit("d", "h", BTreeSet::new()));
        assert!(!ledger.note_skipped("d"));
        assert!(ledger.claim_chunk("c"));
        assert!(!ledger.claim_chunk("c"));
        assert_eq!(ledger.seen_documents().len(), 1);
    }

    #[test]
    fn unknown_documents_are_ignored() {
        let ledger = DocumentLedger::new();
        assert!(ledger.fan_out("ghost", 0).is_none());
        assert!(ledger.persisted("ghost", None).is_none());
        ledger.fail("ghost");
        assert!(!ledger.is_admitted("ghost"));
    }
}
