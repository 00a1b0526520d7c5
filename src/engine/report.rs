//! Run reports.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{FailureKind, StageError};

/// One item that did not make it through a stage.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ItemFailure {
    /// Position of the failing skill within its skillset.
    pub stage: usize,
    pub skill: String,
    pub item_id: String,
    pub kind: FailureKind,
    pub attempts: u32,
    pub message: String,
}

impl ItemFailure {
    pub fn new(stage: usize, skill: &str, item_id: &str, error: &StageError, attempts: u32) -> Self {
        let kind = if error.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::Permanent
        };
        Self {
            stage,
            skill: skill.to_string(),
            item_id: item_id.to_string(),
            kind,
            attempts,
            message: error.message().to_string(),
        }
    }
}

/// Outcome of running one skillset.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub skillset: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Documents whose every derived record was persisted.
    pub processed: u64,
    /// Documents skipped because the tracker saw identical content.
    pub skipped: u64,
    /// Items that failed at some stage.
    pub failed: u64,
    pub records_written: u64,
    /// Chunk ids carried over from the tracker for skipped documents.
    pub reused_chunk_ids: Vec<String>,
    pub failures: Vec<ItemFailure>,
    pub cancelled: bool,
    /// Whether the source finished enumerating.
    pub source_complete: bool,
    #[serde(skip)]
    pub seen_document_ids: BTreeSet<String>,
}

impl RunReport {
    pub fn new(skillset: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            skillset: skillset.to_string(),
            started_at: now,
            finished_at: now,
            processed: 0,
            skipped: 0,
            failed: 0,
            records_written: 0,
            reused_chunk_ids: Vec::new(),
            failures: Vec::new(),
            cancelled: false,
            source_complete: false,
            seen_document_ids: BTreeSet::new(),
        }
    }

    pub fn record_failure(&mut self, failure: ItemFailure) {
        self.failed += 1;
        self.failures.push(failure);
    }

    /// Number of failures attributed to `stage`.
    pub fn failures_at(&self, stage: usize) -> usize {
        self.failures.iter().filter(|f| f.stage == stage).count()
    }

    /// No failures, not cancelled, and the source was fully enumerated.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.cancelled && self.source_complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_counted_per_stage() {
        let mut r = RunReport::new("docs");
        r.record_failure(ItemFailure::new(2, "embedding/openai", "c1", &StageError::permanent("bad"), 1));
        r.record_failure(ItemFailure::new(2, "embedding/openai", "c2", &StageError::transient("429"), 3));
        r.record_failure(ItemFailure::new(1, "splitter/faq", "d1", &StageError::permanent("x"), 1));
        assert_eq!(r.failed, 3);
        assert_eq!(r.failures_at(2), 2);
        assert_eq!(r.failures_at(1), 1);
        assert_eq!(r.failures[1].kind, FailureKind::Transient);
        assert!(!r.is_clean());
    }

    #[test]
    fn serializes_without_seen_ids() {
        let mut r = RunReport::new("docs");
        r.seen_document_ids.insert("a".into());
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("seen_document_ids").is_none());
        assert_eq!(json["skillset"], "docs");
        assert_eq!(json["run_id"].as_str().unwrap().len(), 36);
    }
}
