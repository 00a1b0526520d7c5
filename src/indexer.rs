//! Top-level orchestration: open the tracker, run each skillset of the
//! indexer in order, then reconcile the tracker against what the sources
//! enumerated.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use crate::assemble::assemble;
use crate::config::{IndexerDecl, TrackerDecl, ValidatedConfig};
use crate::engine::{Engine, RunControl, RunReport};
use crate::error::{IndexerError, Result};
use crate::progress::{NoProgress, RunProgressReporter};
use crate::registry::SkillRegistry;
use crate::tracker::{self, Tracker};

/// Aggregate outcome of one indexer invocation.
#[derive(Debug, Clone, Serialize)]
pub struct IndexerReport {
    pub indexer: String,
    pub runs: Vec<RunReport>,
    /// Tracked documents that no source enumerated this time.
    pub stale_documents: Vec<String>,
    /// Chunk ids of stale documents removed from the tracker.
    pub purged_chunk_ids: Vec<String>,
}

impl IndexerReport {
    fn new(indexer: &str) -> Self {
        Self {
            indexer: indexer.to_string(),
            runs: Vec::new(),
            stale_documents: Vec::new(),
            purged_chunk_ids: Vec::new(),
        }
    }

    /// Report for an indexer that stopped on a fatal error, holding the
    /// runs carried by that error.
    pub fn from_aborted(indexer: &str, err: &IndexerError) -> Self {
        Self {
            runs: err.partial_runs().to_vec(),
            ..Self::new(indexer)
        }
    }

    /// Every skillset ran to completion without item failures.
    pub fn succeeded(&self) -> bool {
        self.runs.iter().all(RunReport::is_clean)
    }

    pub fn cancelled(&self) -> bool {
        self.runs.iter().any(|r| r.cancelled)
    }

    pub fn total_failed(&self) -> u64 {
        self.runs.iter().map(|r| r.failed).sum()
    }
}

pub struct Indexer {
    registry: Arc<SkillRegistry>,
    progress: Arc<dyn RunProgressReporter>,
}

impl Indexer {
    pub fn new(registry: Arc<SkillRegistry>) -> Self {
        Self {
            registry,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn RunProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Run every skillset declared by `config.indexer`.
    pub async fn run(&self, config: &ValidatedConfig, control: &RunControl) -> Result<IndexerReport> {
        let decl = &config.indexer;
        let tracker = match &decl.tracker {
            Some(t) => open_tracker(t).await?,
            None => None,
        };

        let result = self.run_skillsets(decl, tracker.clone(), control).await;
        if let Some(t) = &tracker {
            t.close().await;
        }
        result
    }

    async fn run_skillsets(
        &self,
        decl: &IndexerDecl,
        tracker: Option<Arc<dyn Tracker>>,
        control: &RunControl,
    ) -> Result<IndexerReport> {
        let tolerate = decl.tracker.as_ref().is_some_and(|t| t.tolerate_unavailable);
        let engine = Engine::new()
            .with_channel_capacity(decl.channel_capacity)
            .with_grace_period(decl.grace_period)
            .with_tracker_tolerance(tolerate)
            .with_progress(self.progress.clone());

        let mut report = IndexerReport::new(&decl.id);
        let mut seen = BTreeSet::new();
        let mut every_source_tracked = true;

        for skillset in &decl.skillsets {
            if control.is_cancelled() {
                break;
            }
            let pipeline = match assemble(skillset, &self.registry).await {
                Ok(p) => p,
                Err(e) => return Err(e.with_runs(report.runs)),
            };
            every_source_tracked &= pipeline.tracks_documents();

            let run = match engine.run(pipeline, tracker.clone(), control).await {
                Ok(run) => run,
                Err(e) => return Err(e.with_runs(report.runs)),
            };
            every_source_tracked &= run.source_complete;
            seen.extend(run.seen_document_ids.iter().cloned());
            let cancelled = run.cancelled;
            report.runs.push(run);
            if cancelled {
                break;
            }
        }

        let Some(tracker) = tracker else {
            return Ok(report);
        };
        if report.cancelled() || !every_source_tracked {
            tracing::debug!(indexer = %decl.id, "skipping stale detection");
            return Ok(report);
        }

        let purge = decl.tracker.as_ref().is_some_and(|t| t.purge_stale);
        match reconcile(tracker.as_ref(), &seen, purge, &mut report).await {
            Ok(()) => Ok(report),
            Err(e) if tolerate => {
                tracing::warn!(indexer = %decl.id, error = %e, "stale detection failed");
                Ok(report)
            }
            Err(e) => Err(e.with_runs(report.runs)),
        }
    }
}

/// Open the declared tracker. An unusable tracker is fatal unless the
/// declaration tolerates it, in which case the run reprocesses everything.
async fn open_tracker(decl: &TrackerDecl) -> Result<Option<Arc<dyn Tracker>>> {
    match tracker::open(&decl.connection_string).await {
        Ok(t) => {
            tracing::info!(backend = t.name(), "tracker opened");
            Ok(Some(t))
        }
        Err(e) if decl.tolerate_unavailable => {
            tracing::warn!(error = %e, "tracker unavailable, reprocessing every document");
            Ok(None)
        }
        Err(e) => Err(IndexerError::Tracker(e)),
    }
}

async fn reconcile(
    tracker: &dyn Tracker,
    seen: &BTreeSet<String>,
    purge: bool,
    report: &mut IndexerReport,
) -> Result<()> {
    let stale = tracker.list_stale(seen).await?;
    if stale.is_empty() {
        return Ok(());
    }
    tracing::info!(stale = stale.len(), purge, "documents no longer present at the source");

    for entry in stale {
        if purge {
            if let Some(removed) = tracker.delete(&entry.document_id).await? {
                report.purged_chunk_ids.extend(removed.chunk_ids);
            }
        }
        report.stale_documents.push(entry.document_id);
    }
    Ok(())
}
