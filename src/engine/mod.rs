//! Pipeline execution.
//!
//! Runs an assembled [`Pipeline`] as a chain of concurrent stages joined by
//! bounded channels:
//!
//! ```text
//! source ──▶ [reader] ──▶ gate ──▶ splitter ──▶ embedder ──▶ sink
//!                          │                                  │
//!                          ▼                                  ▼
//!                       tracker ◀────── document complete ── ledger
//! ```
//!
//! - Each stage is a tokio task. A semaphore bounds how many items a stage
//!   works on at once (`concurrency`); channel capacity bounds how far a
//!   fast stage can run ahead of a slow one.
//! - Transient failures are retried per the stage's [`RetryPolicy`]. Items
//!   that still fail are recorded in the [`RunReport`] and the run goes on.
//!   A [`StageError::Fatal`] stops the whole run.
//! - The gate sits in front of the first stage that receives documents.
//!   It skips documents whose content hash matches the tracker and admits
//!   the rest into the [`DocumentLedger`]. Transforms hear about skipped
//!   documents through [`Transform::unchanged`].
//! - Once input is exhausted every transform is [finished](Transform::finish)
//!   before skills are closed.
//! - Cancellation stops every stage from pulling new input. In-flight work
//!   gets a grace period, after which it is aborted.

mod control;
mod ledger;
mod report;
mod retry;

pub use control::{ChildLink, RunControl};
pub use ledger::{Completed, DocumentLedger};
pub use report::{ItemFailure, RunReport};
pub use retry::RetryPolicy;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};

use crate::assemble::Pipeline;
use crate::config::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_GRACE_PERIOD_MS};
use crate::error::{IndexerError, Result, StageError};
use crate::models::{Item, TrackerEntry};
use crate::progress::{NoProgress, RunProgressEvent, RunProgressReporter};
use crate::skills::{Emitter, Shape, Sink, SkillKind, Source, Transform};
use crate::tracker::Tracker;

const TRACKER_LABEL: &str = "tracker";

/// Executes pipelines. One engine may run many pipelines in sequence.
pub struct Engine {
    channel_capacity: usize,
    grace_period: Duration,
    tolerate_tracker_errors: bool,
    progress: Arc<dyn RunProgressReporter>,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            tolerate_tracker_errors: false,
            progress: Arc::new(NoProgress),
        }
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Log tracker failures and carry on as if the document were new,
    /// instead of failing the run.
    pub fn with_tracker_tolerance(mut self, tolerate: bool) -> Self {
        self.tolerate_tracker_errors = tolerate;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn RunProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Run `pipeline` to completion, cancellation, or a fatal error.
    ///
    /// Skill resources are released before this returns, whatever the
    /// outcome. Item-level failures are reported in the returned
    /// [`RunReport`]; only fatal failures produce an `Err`, which is an
    /// [`IndexerError::RunAborted`] carrying the report so far.
    pub async fn run(
        &self,
        pipeline: Pipeline,
        tracker: Option<Arc<dyn Tracker>>,
        control: &RunControl,
    ) -> Result<RunReport> {
        let (internal, _link) = control.child();
        let gate_at = gate_position(&pipeline);
        let sink = pipeline.stages.last().and_then(|s| match &s.kind {
            SkillKind::Sink(sink) => Some(sink.clone()),
            _ => None,
        });
        let transforms = pipeline
            .stages
            .iter()
            .filter_map(|s| match &s.kind {
                SkillKind::Transform(t) => Some(t.clone()),
                _ => None,
            })
            .collect();

        let ctx = Arc::new(RunContext {
            skillset: pipeline.skillset.clone(),
            control: internal,
            ledger: DocumentLedger::new(),
            tracker,
            tolerate_tracker_errors: self.tolerate_tracker_errors,
            sink,
            transforms,
            gate_at,
            report: Mutex::new(RunReport::new(&pipeline.skillset)),
            fatal: Mutex::new(None),
            progress: self.progress.clone(),
        });

        tracing::info!(
            skillset = %pipeline.skillset,
            stages = pipeline.stages.len(),
            gate = ?gate_at,
            tracker = ctx.tracker.as_ref().map(|t| t.name()).unwrap_or("none"),
            "starting run"
        );
        self.progress.report(RunProgressEvent::Discovering {
            skillset: pipeline.skillset.clone(),
            stages: pipeline.stages.len(),
        });

        let mut tasks = self.spawn_stages(&pipeline, &ctx);

        tokio::select! {
            _ = join_stages(&mut tasks, &ctx) => {}
            _ = ctx.control.cancelled() => {
                let drained = tokio::time::timeout(self.grace_period, join_stages(&mut tasks, &ctx)).await;
                if drained.is_err() {
                    tracing::warn!(
                        skillset = %ctx.skillset,
                        grace_ms = self.grace_period.as_millis() as u64,
                        "grace period elapsed, aborting in-flight work"
                    );
                    tasks.abort_all();
                    join_stages(&mut tasks, &ctx).await;
                }
            }
        }

        if !ctx.has_fatal() {
            let complete = ctx.report().source_complete && !control.is_cancelled();
            finish_transforms(&pipeline, &ctx, complete).await;
        }
        pipeline.close_all().await;

        let mut report = std::mem::replace(&mut *ctx.report(), RunReport::new(&ctx.skillset));
        report.finished_at = Utc::now();
        report.cancelled = control.is_cancelled();
        report.seen_document_ids = ctx.ledger.seen_documents();

        self.progress.report(RunProgressEvent::Finished {
            skillset: report.skillset.clone(),
            processed: report.processed,
            skipped: report.skipped,
            failed: report.failed,
            cancelled: report.cancelled,
        });

        if let Some(err) = ctx.take_fatal() {
            tracing::error!(skillset = %report.skillset, error = %err, "run aborted");
            return Err(IndexerError::RunAborted {
                cause: Box::new(err),
                runs: vec![report],
            });
        }

        tracing::info!(
            skillset = %report.skillset,
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            records_written = report.records_written,
            cancelled = report.cancelled,
            "run finished"
        );
        Ok(report)
    }

    fn spawn_stages(&self, pipeline: &Pipeline, ctx: &Arc<RunContext>) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        let mut rx: Option<mpsc::Receiver<Item>> = None;
        let mut consumed = false;

        for (index, skill) in pipeline.stages.iter().enumerate() {
            let stage = StageInfo {
                index,
                label: skill.label(),
                retry: RetryPolicy::from(&skill.definition.common.retry),
                concurrency: skill.definition.common.concurrency.max(1),
                tracks_documents: ctx.gate_at.is_some_and(|g| index >= g),
            };

            if ctx.gate_at == Some(index) {
                if let Some(input) = rx.take() {
                    let (tx, next) = mpsc::channel(self.channel_capacity);
                    tasks.spawn(run_gate(ctx.clone(), index, input, tx));
                    rx = Some(next);
                }
            }

            match (&skill.kind, rx.take()) {
                (SkillKind::Source(source), None) => {
                    let (tx, next) = mpsc::channel(self.channel_capacity);
                    tasks.spawn(run_source(ctx.clone(), stage, source.clone(), tx));
                    rx = Some(next);
                }
                (SkillKind::Transform(transform), Some(input)) => {
                    let (tx, next) = mpsc::channel(self.channel_capacity);
                    tasks.spawn(run_transform(ctx.clone(), stage, transform.clone(), input, tx));
                    rx = Some(next);
                }
                (SkillKind::Sink(sink), Some(input)) => {
                    tasks.spawn(run_sink(ctx.clone(), stage, sink.clone(), input));
                    consumed = true;
                    break;
                }
                (kind, _) => {
                    ctx.fatal(
                        index,
                        &stage.label,
                        format!("a {} cannot appear at this position", kind.role()),
                    );
                    return tasks;
                }
            }
        }

        if !consumed {
            if let Some(input) = rx.take() {
                tasks.spawn(run_drain(ctx.clone(), input));
            }
        }
        tasks
    }
}

/// Index of the first stage that receives documents, if any.
fn gate_position(pipeline: &Pipeline) -> Option<usize> {
    pipeline
        .input_shapes()
        .iter()
        .position(|shape| *shape == Some(Shape::Document))
}

async fn finish_transforms(pipeline: &Pipeline, ctx: &RunContext, complete: bool) {
    for (index, stage) in pipeline.stages.iter().enumerate() {
        let SkillKind::Transform(transform) = &stage.kind else {
            continue;
        };
        if let Err(e) = transform.finish(complete).await {
            ctx.fatal(index, &stage.label(), e.message());
            return;
        }
    }
}

async fn join_stages(tasks: &mut JoinSet<()>, ctx: &RunContext) {
    while let Some(res) = tasks.join_next().await {
        ctx.reap(None, res);
    }
}

#[derive(Clone)]
struct StageInfo {
    index: usize,
    label: String,
    retry: RetryPolicy,
    concurrency: usize,
    tracks_documents: bool,
}

/// State shared by every stage of one run.
struct RunContext {
    skillset: String,
    control: RunControl,
    ledger: DocumentLedger,
    tracker: Option<Arc<dyn Tracker>>,
    tolerate_tracker_errors: bool,
    sink: Option<Arc<dyn Sink>>,
    transforms: Vec<Arc<dyn Transform>>,
    gate_at: Option<usize>,
    report: Mutex<RunReport>,
    fatal: Mutex<Option<IndexerError>>,
    progress: Arc<dyn RunProgressReporter>,
}

impl RunContext {
    fn report(&self) -> MutexGuard<'_, RunReport> {
        self.report.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_failure(&self, stage: usize, skill: &str, item_id: &str, error: &StageError, attempts: u32) {
        tracing::warn!(
            skillset = %self.skillset,
            stage,
            skill,
            item = item_id,
            attempts,
            error = %error,
            "item failed"
        );
        self.report()
            .record_failure(ItemFailure::new(stage, skill, item_id, error, attempts));
        self.advance();
    }

    /// Record the first fatal error and cancel the run.
    fn fatal(&self, stage: usize, skill: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(skillset = %self.skillset, stage, skill, %message, "fatal stage failure");
        {
            let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
            if fatal.is_none() {
                *fatal = Some(IndexerError::StageFatal {
                    stage,
                    skill: skill.to_string(),
                    message,
                });
            }
        }
        self.control.cancel();
    }

    fn has_fatal(&self) -> bool {
        self.fatal
            .lock()
            .map(|f| f.is_some())
            .unwrap_or(true)
    }

    fn take_fatal(&self) -> Option<IndexerError> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn reap(&self, stage: Option<&StageInfo>, res: std::result::Result<(), JoinError>) {
        if let Err(e) = res {
            if e.is_panic() {
                let (index, label) = stage
                    .map(|s| (s.index, s.label.as_str()))
                    .unwrap_or((0, "engine"));
                self.fatal(index, label, "stage task panicked");
            }
        }
    }

    fn advance(&self) {
        let (processed, skipped, failed) = {
            let r = self.report();
            (r.processed, r.skipped, r.failed)
        };
        self.progress.report(RunProgressEvent::Processing {
            skillset: self.skillset.clone(),
            processed,
            skipped,
            failed,
        });
    }

    fn tracker_failure(&self, document_id: &str, error: &crate::error::TrackerError) -> bool {
        if self.tolerate_tracker_errors {
            tracing::warn!(
                skillset = %self.skillset,
                document = document_id,
                %error,
                "tracker unavailable, treating document as new"
            );
            true
        } else {
            self.fatal(self.gate_at.unwrap_or(0), TRACKER_LABEL, error.to_string());
            false
        }
    }

    /// Every record derived from a document is persisted: update the
    /// tracker and drop chunks the previous version had but this one lacks.
    async fn complete(&self, done: Completed) {
        if let Some(tracker) = &self.tracker {
            let entry = TrackerEntry {
                document_id: done.document_id.clone(),
                content_hash: done.content_hash.clone(),
                last_processed_at: Utc::now(),
                chunk_ids: done.chunk_ids.clone(),
            };
            if let Err(e) = tracker.upsert(&entry).await {
                if !self.tracker_failure(&done.document_id, &e) {
                    return;
                }
            }
        }

        if !done.superseded.is_empty() {
            if let Some(sink) = &self.sink {
                if let Err(e) = sink.delete(&done.superseded).await {
                    tracing::warn!(
                        document = %done.document_id,
                        chunks = done.superseded.len(),
                        error = %e,
                        "failed to delete superseded chunks"
                    );
                }
            }
        }

        tracing::debug!(document = %done.document_id, chunks = done.chunk_ids.len(), "document complete");
        self.report().processed += 1;
        self.advance();
    }
}

async fn next_item(control: &RunControl, rx: &mut mpsc::Receiver<Item>) -> Option<Item> {
    if control.is_cancelled() {
        return None;
    }
    tokio::select! {
        biased;
        _ = control.cancelled() => None,
        item = rx.recv() => item,
    }
}

async fn forward(control: &RunControl, tx: &mpsc::Sender<Item>, item: Item) -> bool {
    tokio::select! {
        biased;
        _ = control.cancelled() => false,
        res = tx.send(item) => res.is_ok(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Source
// ═══════════════════════════════════════════════════════════════════════

async fn run_source(ctx: Arc<RunContext>, stage: StageInfo, source: Arc<dyn Source>, tx: mpsc::Sender<Item>) {
    let emitter = Emitter::new(tx, ctx.control.clone(), stage.retry.clone());

    // Once something was emitted a retry would emit it twice.
    let (outcome, _) = {
        let source = &source;
        let emitter = &emitter;
        stage
            .retry
            .run(&ctx.control, move || async move {
                match source.produce(emitter).await {
                    Err(StageError::Transient(m)) if emitter.emitted() > 0 => Err(StageError::Permanent(m)),
                    other => other,
                }
            })
            .await
    };

    for failure in emitter.take_failures() {
        match &failure.error {
            StageError::Fatal(m) => ctx.fatal(stage.index, &stage.label, m.clone()),
            err => ctx.record_failure(stage.index, &stage.label, &failure.item_id, err, failure.attempts),
        }
    }

    match outcome {
        Ok(()) => {
            if !ctx.control.is_cancelled() {
                ctx.report().source_complete = true;
            }
            tracing::debug!(skill = %stage.label, emitted = emitter.emitted(), "source finished");
        }
        Err(e) => ctx.fatal(stage.index, &stage.label, e.message()),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Tracker gate
// ═══════════════════════════════════════════════════════════════════════

async fn run_gate(ctx: Arc<RunContext>, index: usize, mut rx: mpsc::Receiver<Item>, tx: mpsc::Sender<Item>) {
    while let Some(item) = next_item(&ctx.control, &mut rx).await {
        if admit(&ctx, index, &item).await && !forward(&ctx.control, &tx, item).await {
            break;
        }
    }
}

/// Decide whether a document enters the pipeline.
async fn admit(ctx: &RunContext, index: usize, item: &Item) -> bool {
    let Item::Document(doc) = item else {
        return true;
    };
    let hash = doc.content_hash();

    let previous = match &ctx.tracker {
        None => None,
        Some(tracker) => match tracker.lookup(&doc.id).await {
            Ok(entry) => entry,
            Err(e) => {
                if !ctx.tracker_failure(&doc.id, &e) {
                    return false;
                }
                None
            }
        },
    };

    if let Some(entry) = previous.as_ref().filter(|e| e.content_hash == hash) {
        if ctx.ledger.note_skipped(&doc.id) {
            tracing::debug!(document = %doc.id, "unchanged since last run, skipping");
            {
                let mut report = ctx.report();
                report.skipped += 1;
                report.reused_chunk_ids.extend(entry.chunk_ids.iter().cloned());
            }
            for transform in &ctx.transforms {
                transform.unchanged(&doc.id).await;
            }
            ctx.advance();
        } else {
            ctx.record_failure(
                index,
                TRACKER_LABEL,
                &doc.id,
                &StageError::permanent("document id emitted more than once in this run"),
                1,
            );
        }
        return false;
    }

    let previous_chunks = previous.map(|e| e.chunk_ids).unwrap_or_else(BTreeSet::new);
    if !ctx.ledger.admit(&doc.id, &hash, previous_chunks) {
        ctx.record_failure(
            index,
            TRACKER_LABEL,
            &doc.id,
            &StageError::permanent("document id emitted more than once in this run"),
            1,
        );
        return false;
    }
    true
}

// ═══════════════════════════════════════════════════════════════════════
// Transforms
// ═══════════════════════════════════════════════════════════════════════

async fn run_transform(
    ctx: Arc<RunContext>,
    stage: StageInfo,
    transform: Arc<dyn Transform>,
    mut rx: mpsc::Receiver<Item>,
    tx: mpsc::Sender<Item>,
) {
    let semaphore = Arc::new(Semaphore::new(stage.concurrency));
    let mut inflight = JoinSet::new();

    while let Some(item) = next_item(&ctx.control, &mut rx).await {
        let permit = tokio::select! {
            biased;
            _ = ctx.control.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let task_ctx = ctx.clone();
        let task_stage = stage.clone();
        let transform = transform.clone();
        let tx = tx.clone();
        inflight.spawn(async move {
            let _permit = permit;
            apply_one(&task_ctx, &task_stage, &transform, item, &tx).await;
        });
        while let Some(res) = inflight.try_join_next() {
            ctx.reap(Some(&stage), res);
        }
    }

    while let Some(res) = inflight.join_next().await {
        ctx.reap(Some(&stage), res);
    }
}

async fn apply_one(
    ctx: &RunContext,
    stage: &StageInfo,
    transform: &Arc<dyn Transform>,
    item: Item,
    tx: &mpsc::Sender<Item>,
) {
    let item_id = item.id().to_string();
    let document_id = item
        .document_id()
        .filter(|_| stage.tracks_documents)
        .map(str::to_string);

    let (result, attempts) = stage
        .retry
        .run(&ctx.control, || {
            let transform = transform.clone();
            let item = item.clone();
            async move { transform.apply(item).await }
        })
        .await;

    match result {
        Ok(outputs) => {
            // Adjust before forwarding so downstream cannot settle the
            // document early.
            if let Some(doc) = &document_id {
                if let Some(done) = ctx.ledger.fan_out(doc, outputs.len()) {
                    ctx.complete(done).await;
                }
            }
            for out in outputs {
                if !forward(&ctx.control, tx, out).await {
                    break;
                }
            }
        }
        Err(StageError::Fatal(msg)) => ctx.fatal(stage.index, &stage.label, msg),
        Err(err) => {
            ctx.record_failure(stage.index, &stage.label, &item_id, &err, attempts);
            if let Some(doc) = &document_id {
                ctx.ledger.fail(doc);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Sink
// ═══════════════════════════════════════════════════════════════════════

async fn run_sink(ctx: Arc<RunContext>, stage: StageInfo, sink: Arc<dyn Sink>, mut rx: mpsc::Receiver<Item>) {
    let batch_size = sink.batch_size().max(1);
    let semaphore = Arc::new(Semaphore::new(stage.concurrency));
    let mut inflight = JoinSet::new();
    let mut batch = Vec::with_capacity(batch_size);

    loop {
        let next = next_item(&ctx.control, &mut rx).await;
        let done = next.is_none();
        if let Some(item) = next.and_then(|item| check_sink_item(&ctx, &stage, item)) {
            batch.push(item);
        }
        let flush = batch.len() >= batch_size || (done && !batch.is_empty() && !ctx.has_fatal());
        if flush {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let task_ctx = ctx.clone();
            let task_stage = stage.clone();
            let sink = sink.clone();
            let items = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            inflight.spawn(async move {
                let _permit = permit;
                write_batch(&task_ctx, &task_stage, &sink, items).await;
            });
        }
        while let Some(res) = inflight.try_join_next() {
            ctx.reap(Some(&stage), res);
        }
        if done {
            break;
        }
    }

    while let Some(res) = inflight.join_next().await {
        ctx.reap(Some(&stage), res);
    }
}

/// Reject chunks that reuse an id or belong to a document the gate never
/// admitted.
fn check_sink_item(ctx: &RunContext, stage: &StageInfo, item: Item) -> Option<Item> {
    if let Item::Chunk(chunk) = &item {
        let problem = if !ctx.ledger.claim_chunk(&chunk.chunk_id) {
            Some("chunk id already written in this run")
        } else if ctx.gate_at.is_some() && !ctx.ledger.is_admitted(&chunk.parent_document_id) {
            Some("chunk belongs to a document that was never admitted")
        } else {
            None
        };
        if let Some(msg) = problem {
            ctx.record_failure(stage.index, &stage.label, &chunk.chunk_id, &StageError::permanent(msg), 1);
            ctx.ledger.fail(&chunk.parent_document_id);
            return None;
        }
    }
    Some(item)
}

async fn write_batch(ctx: &RunContext, stage: &StageInfo, sink: &Arc<dyn Sink>, items: Vec<Item>) {
    let items = Arc::new(items);
    let (result, attempts) = stage
        .retry
        .run(&ctx.control, || {
            let sink = sink.clone();
            let items = items.clone();
            async move { sink.write(&items).await }
        })
        .await;

    match result {
        Ok(()) => {
            ctx.report().records_written += items.len() as u64;
            for item in items.iter() {
                settle_persisted(ctx, item).await;
            }
        }
        Err(StageError::Fatal(msg)) => ctx.fatal(stage.index, &stage.label, msg),
        Err(err) => {
            for item in items.iter() {
                ctx.record_failure(stage.index, &stage.label, item.id(), &err, attempts);
                if let Some(doc) = item.document_id() {
                    ctx.ledger.fail(doc);
                }
            }
        }
    }
}

async fn settle_persisted(ctx: &RunContext, item: &Item) {
    let Some(doc) = item.document_id() else {
        return;
    };
    let chunk_id = match item {
        Item::Chunk(c) => Some(c.chunk_id.as_str()),
        _ => None,
    };
    if let Some(done) = ctx.ledger.persisted(doc, chunk_id) {
        ctx.complete(done).await;
    }
}

/// Terminal for pipelines that end without a sink: items leaving the last
/// stage count as persisted.
async fn run_drain(ctx: Arc<RunContext>, mut rx: mpsc::Receiver<Item>) {
    while let Some(item) = next_item(&ctx.control, &mut rx).await {
        settle_persisted(&ctx, &item).await;
    }
}
