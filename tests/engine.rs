//! Engine behaviour under failure and load: retries, tracker outages,
//! bounded channels, duplicate identities and fatal sinks. Every skill here
//! is an in-process fake registered through the public registry API.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use skillforge::assemble::{assemble, Pipeline};
use skillforge::config::{self, SkillCategory, ValidatedConfig};
use skillforge::engine::{Engine, RunControl, RunReport};
use skillforge::error::{exit_codes, FailureKind, IndexerError, StageError, TrackerError};
use skillforge::indexer::{Indexer, IndexerReport};
use skillforge::models::{Chunk, Document, Item, TrackerEntry};
use skillforge::registry::SkillRegistry;
use skillforge::schema;
use skillforge::skills::{Contract, Emitter, Shape, SkillKind, Sink, Source, Transform};
use skillforge::tracker::{InMemoryTracker, Tracker};

/// Counters shared between a test and the skills it registers.
#[derive(Default)]
struct Fixture {
    docs: Vec<Document>,
    emitted: AtomicUsize,
    written: AtomicUsize,
    max_lead: AtomicUsize,
    embed_calls: AtomicUsize,
    closed: AtomicUsize,
    sink_delay: Duration,
}

impl Fixture {
    fn new(docs: &[(&str, &str)]) -> Self {
        Self {
            docs: docs
                .iter()
                .map(|(id, text)| Document::new(*id, format!("memory://{}", id), *text))
                .collect(),
            ..Self::default()
        }
    }

    fn with_docs(docs: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self::new(docs))
    }
}

struct FixedSource(Arc<Fixture>);

#[async_trait]
impl Source for FixedSource {
    async fn produce(&self, out: &Emitter) -> Result<(), StageError> {
        for doc in &self.0.docs {
            // Chunks emitted (two per document) but not yet written.
            let lead = (2 * self.0.emitted.load(Ordering::SeqCst))
                .saturating_sub(self.0.written.load(Ordering::SeqCst));
            self.0.max_lead.fetch_max(lead, Ordering::SeqCst);
            if !out.emit(Item::Document(doc.clone())).await {
                return Ok(());
            }
            self.0.emitted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn close(&self) {
        self.0.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Splits every document into exactly two chunks.
struct HalvesSplitter(Arc<Fixture>);

#[async_trait]
impl Transform for HalvesSplitter {
    fn contract(&self) -> Contract {
        Contract::transform(&[Shape::Document], Shape::Chunk)
    }

    async fn apply(&self, item: Item) -> Result<Vec<Item>, StageError> {
        let Item::Document(doc) = item else {
            return Err(StageError::permanent("not a document"));
        };
        Ok(vec![
            Item::Chunk(Chunk::from_document(&doc, 0, format!("{} (1/2)", doc.raw_content))),
            Item::Chunk(Chunk::from_document(&doc, 1, format!("{} (2/2)", doc.raw_content))),
        ])
    }

    async fn close(&self) {
        self.0.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Emits the same chunk twice for every document.
struct TwinSplitter;

#[async_trait]
impl Transform for TwinSplitter {
    fn contract(&self) -> Contract {
        Contract::transform(&[Shape::Document], Shape::Chunk)
    }

    async fn apply(&self, item: Item) -> Result<Vec<Item>, StageError> {
        let Item::Document(doc) = item else {
            return Err(StageError::permanent("not a document"));
        };
        let chunk = Item::Chunk(Chunk::from_document(&doc, 0, doc.raw_content.as_str()));
        Ok(vec![chunk.clone(), chunk])
    }
}

/// Fails each chunk transiently `fail_first` times, then embeds it.
struct FlakyEmbedder {
    fixture: Arc<Fixture>,
    fail_first: u32,
    attempts: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl Transform for FlakyEmbedder {
    fn contract(&self) -> Contract {
        Contract::transform(&[Shape::Chunk], Shape::EmbeddedChunk)
    }

    async fn apply(&self, item: Item) -> Result<Vec<Item>, StageError> {
        self.fixture.embed_calls.fetch_add(1, Ordering::SeqCst);
        let Item::Chunk(chunk) = item else {
            return Err(StageError::permanent("not a chunk"));
        };
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(chunk.chunk_id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if attempt <= self.fail_first {
            return Err(StageError::transient("503 service unavailable"));
        }
        Ok(vec![Item::Chunk(chunk.with_embedding(vec![1.0, 0.0]))])
    }
}

/// Counts written chunks, optionally slowly.
struct CollectSink(Arc<Fixture>);

#[async_trait]
impl Sink for CollectSink {
    fn contract(&self) -> Contract {
        Contract::sink(&[Shape::Chunk, Shape::EmbeddedChunk])
    }

    async fn write(&self, batch: &[Item]) -> Result<(), StageError> {
        if !self.0.sink_delay.is_zero() {
            tokio::time::sleep(self.0.sink_delay).await;
        }
        self.0.written.fetch_add(batch.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.0.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A sink whose storage is gone.
struct BrokenSink(Arc<Fixture>);

#[async_trait]
impl Sink for BrokenSink {
    fn contract(&self) -> Contract {
        Contract::sink(&[Shape::Chunk, Shape::EmbeddedChunk])
    }

    async fn write(&self, _batch: &[Item]) -> Result<(), StageError> {
        Err(StageError::fatal("disk full"))
    }

    async fn close(&self) {
        self.0.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory tracker whose lookups or upserts can be made to fail.
struct FailingTracker {
    inner: InMemoryTracker,
    fail_lookup: bool,
    fail_upsert: bool,
}

impl FailingTracker {
    fn new(fail_lookup: bool, fail_upsert: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryTracker::new(),
            fail_lookup,
            fail_upsert,
        })
    }
}

#[async_trait]
impl Tracker for FailingTracker {
    fn name(&self) -> &str {
        "failing"
    }

    async fn lookup(&self, document_id: &str) -> Result<Option<TrackerEntry>, TrackerError> {
        if self.fail_lookup {
            return Err(TrackerError::Backend("lookup refused".into()));
        }
        self.inner.lookup(document_id).await
    }

    async fn upsert(&self, entry: &TrackerEntry) -> Result<(), TrackerError> {
        if self.fail_upsert {
            return Err(TrackerError::Backend("upsert refused".into()));
        }
        self.inner.upsert(entry).await
    }

    async fn delete(&self, document_id: &str) -> Result<Option<TrackerEntry>, TrackerError> {
        self.inner.delete(document_id).await
    }

    async fn list_stale(&self, seen: &BTreeSet<String>) -> Result<Vec<TrackerEntry>, TrackerError> {
        self.inner.list_stale(seen).await
    }
}

fn registry(fixture: &Arc<Fixture>) -> SkillRegistry {
    let mut r = SkillRegistry::with_builtins();
    let f = fixture.clone();
    r.register(SkillCategory::Loader, "fixed", move |_| Ok(SkillKind::source(FixedSource(f.clone()))));
    let f = fixture.clone();
    r.register(SkillCategory::Splitter, "halves", move |_| {
        Ok(SkillKind::transform(HalvesSplitter(f.clone())))
    });
    r.register(SkillCategory::Splitter, "twin", |_| Ok(SkillKind::transform(TwinSplitter)));
    let f = fixture.clone();
    r.register(SkillCategory::Embedding, "flaky", move |_| {
        Ok(SkillKind::transform(FlakyEmbedder {
            fixture: f.clone(),
            fail_first: 2,
            attempts: Mutex::new(HashMap::new()),
        }))
    });
    let f = fixture.clone();
    r.register(SkillCategory::Embedding, "down", move |_| {
        Ok(SkillKind::transform(FlakyEmbedder {
            fixture: f.clone(),
            fail_first: u32::MAX,
            attempts: Mutex::new(HashMap::new()),
        }))
    });
    let f = fixture.clone();
    r.register(SkillCategory::VectorStore, "collect", move |_| Ok(SkillKind::sink(CollectSink(f.clone()))));
    let f = fixture.clone();
    r.register(SkillCategory::VectorStore, "broken", move |_| Ok(SkillKind::sink(BrokenSink(f.clone()))));
    r
}

fn load(yaml: &str) -> ValidatedConfig {
    let doc = config::parse_document(yaml, "yaml").unwrap();
    schema::validate(&doc).unwrap()
}

/// Assemble a single-skillset pipeline from `skills`, one inline mapping
/// per line.
async fn pipeline(fixture: &Arc<Fixture>, skills: &[&str]) -> Pipeline {
    let yaml = format!(
        "indexer:\n  id: idx\n  skillset:\n{}",
        skills
            .iter()
            .map(|s| format!("    - {}\n", s))
            .collect::<String>()
    );
    let cfg = load(&yaml);
    assemble(&cfg.indexer.skillsets[0], &registry(fixture)).await.unwrap()
}

const SOURCE: &str = "{ type: loader, name: fixed, params: { file_path: /unused } }";
const HALVES: &str = "{ type: splitter, name: halves }";
const COLLECT: &str = r#"{ type: vector-store, name: collect, params: { connection_string: "sqlite::memory:" } }"#;
const BROKEN: &str = r#"{ type: vector-store, name: broken, params: { connection_string: "sqlite::memory:" } }"#;
const FAST_RETRY: &str = "retry: { max_attempts: 3, initial_backoff_ms: 1, max_backoff_ms: 5 }";

fn aborted(result: Result<RunReport, IndexerError>) -> (IndexerError, Vec<RunReport>) {
    match result {
        Err(IndexerError::RunAborted { cause, runs }) => (*cause, runs),
        Err(other) => panic!("expected an aborted run, got {other}"),
        Ok(report) => panic!("expected an aborted run, got {:?}", report),
    }
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let fixture = Fixture::with_docs(&[("a", "alpha"), ("b", "beta")]);
    let embed = format!("{{ type: embedding, name: flaky, params: {{ {} }} }}", FAST_RETRY);
    let p = pipeline(&fixture, &[SOURCE, HALVES, embed.as_str(), COLLECT]).await;

    let report = Engine::new().run(p, None, &RunControl::new()).await.unwrap();

    assert!(report.is_clean(), "{:#?}", report.failures);
    assert_eq!(report.processed, 2);
    assert_eq!(report.records_written, 4);
    // Four chunks, each failing twice before the third attempt succeeds.
    assert_eq!(fixture.embed_calls.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn exhausted_retries_record_their_attempts() {
    let fixture = Fixture::with_docs(&[("a", "alpha"), ("b", "beta")]);
    let embed = format!("{{ type: embedding, name: down, params: {{ {} }} }}", FAST_RETRY);
    let p = pipeline(&fixture, &[SOURCE, HALVES, embed.as_str(), COLLECT]).await;

    let report = Engine::new().run(p, None, &RunControl::new()).await.unwrap();

    assert_eq!(report.failed, 4);
    assert_eq!(report.failures_at(2), 4);
    assert!(report
        .failures
        .iter()
        .all(|f| f.attempts == 3 && f.kind == FailureKind::Transient && f.skill == "embedding/down"));
    assert_eq!(report.processed, 0);
    assert_eq!(report.records_written, 0);
    assert_eq!(fixture.embed_calls.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn tracker_lookup_failure_is_fatal_unless_tolerated() {
    let fixture = Fixture::with_docs(&[("a", "alpha"), ("b", "beta")]);
    let tracker = FailingTracker::new(true, false);
    let p = pipeline(&fixture, &[SOURCE, HALVES, COLLECT]).await;
    let (cause, runs) = aborted(Engine::new().run(p, Some(tracker.clone()), &RunControl::new()).await);
    assert!(matches!(cause, IndexerError::StageFatal { ref skill, stage: 1, .. } if skill == "tracker"));
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].records_written, 0);

    let fixture = Fixture::with_docs(&[("a", "alpha"), ("b", "beta")]);
    let p = pipeline(&fixture, &[SOURCE, HALVES, COLLECT]).await;
    let report = Engine::new()
        .with_tracker_tolerance(true)
        .run(p, Some(tracker.clone()), &RunControl::new())
        .await
        .unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(tracker.inner.len().await, 2);
}

#[tokio::test]
async fn tracker_upsert_failure_is_fatal_unless_tolerated() {
    let fixture = Fixture::with_docs(&[("a", "alpha"), ("b", "beta")]);
    let tracker = FailingTracker::new(false, true);
    let p = pipeline(&fixture, &[SOURCE, HALVES, COLLECT]).await;
    let (cause, runs) = aborted(Engine::new().run(p, Some(tracker.clone()), &RunControl::new()).await);
    assert!(cause.to_string().contains("upsert refused"), "{cause}");
    assert_eq!(runs[0].processed, 0);
    // Both chunks of the first document were written before its upsert.
    assert!(runs[0].records_written >= 2);

    let fixture = Fixture::with_docs(&[("a", "alpha"), ("b", "beta")]);
    let p = pipeline(&fixture, &[SOURCE, HALVES, COLLECT]).await;
    let report = Engine::new()
        .with_tracker_tolerance(true)
        .run(p, Some(tracker.clone()), &RunControl::new())
        .await
        .unwrap();
    assert_eq!(report.processed, 2);
    assert!(report.is_clean());
    assert_eq!(tracker.inner.len().await, 0);
}

#[tokio::test]
async fn bounded_channels_apply_backpressure_and_group_chunks_by_document() {
    let docs: Vec<(String, String)> = (0..100)
        .map(|i| (format!("doc-{:03}", i), format!("document number {}", i)))
        .collect();
    let refs: Vec<(&str, &str)> = docs.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
    let fixture = Arc::new(Fixture {
        sink_delay: Duration::from_millis(1),
        ..Fixture::new(&refs)
    });
    let tracker = Arc::new(InMemoryTracker::new());
    let p = pipeline(
        &fixture,
        &[
            SOURCE,
            "{ type: splitter, name: halves, params: { concurrency: 4 } }",
            r#"{ type: vector-store, name: collect, params: { connection_string: "sqlite::memory:", concurrency: 2 } }"#,
        ],
    )
    .await;

    let report = Engine::new()
        .with_channel_capacity(1)
        .run(p, Some(tracker.clone()), &RunControl::new())
        .await
        .unwrap();

    assert!(report.is_clean(), "{:#?}", report.failures);
    assert_eq!(report.processed, 100);
    assert_eq!(report.records_written, 200);
    let lead = fixture.max_lead.load(Ordering::SeqCst);
    assert!(lead <= 60, "source ran {} chunks ahead of the sink", lead);

    for (id, _) in &docs {
        let entry = tracker.lookup(id).await.unwrap().unwrap();
        assert_eq!(entry.chunk_ids.len(), 2, "{} completed early", id);
    }
}

#[tokio::test]
async fn repeated_document_id_fails_the_repeat() {
    let fixture = Fixture::with_docs(&[("a", "one"), ("b", "two"), ("a", "one again")]);
    let p = pipeline(&fixture, &[SOURCE, HALVES, COLLECT]).await;

    let report = Engine::new().run(p, None, &RunControl::new()).await.unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.records_written, 4);
    let failure = &report.failures[0];
    assert_eq!(failure.item_id, "a");
    assert_eq!(failure.skill, "tracker");
    assert_eq!(failure.stage, 1);
    assert_eq!(
        report.seen_document_ids,
        BTreeSet::from(["a".to_string(), "b".to_string()])
    );
}

#[tokio::test]
async fn repeated_chunk_id_fails_its_document() {
    let fixture = Fixture::with_docs(&[("a", "only")]);
    let tracker = Arc::new(InMemoryTracker::new());
    let p = pipeline(&fixture, &[SOURCE, "{ type: splitter, name: twin }", COLLECT]).await;

    let report = Engine::new()
        .run(p, Some(tracker.clone()), &RunControl::new())
        .await
        .unwrap();

    assert_eq!(report.records_written, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.processed, 0);
    let failure = &report.failures[0];
    assert_eq!(failure.stage, 2);
    assert_eq!(failure.skill, "vector-store/collect");
    assert!(failure.message.contains("already written"), "{}", failure.message);
    assert!(tracker.lookup("a").await.unwrap().is_none());
}

#[tokio::test]
async fn fatal_sink_aborts_the_run_and_closes_every_skill() {
    let fixture = Fixture::with_docs(&[("a", "alpha"), ("b", "beta")]);
    let p = pipeline(&fixture, &[SOURCE, HALVES, BROKEN]).await;

    let (cause, runs) = aborted(Engine::new().run(p, None, &RunControl::new()).await);

    assert!(matches!(cause, IndexerError::StageFatal { stage: 2, ref message, .. } if message == "disk full"));
    assert_eq!(runs[0].processed, 0);
    assert_eq!(runs[0].records_written, 0);
    assert_eq!(fixture.closed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn aborted_indexer_keeps_reports_of_earlier_skillsets() {
    let fixture = Fixture::with_docs(&[("a", "alpha"), ("b", "beta")]);
    let cfg = load(
        r#"
definitions:
  - skill: { id: src, type: loader, name: fixed, params: { file_path: /unused } }
  - skill: { id: halves, type: splitter, name: halves }
  - skill: { id: collect, type: vector-store, name: collect, params: { connection_string: "sqlite::memory:" } }
  - skill: { id: broken, type: vector-store, name: broken, params: { connection_string: "sqlite::memory:" } }
  - skillset: { id: good, skills: [src, halves, collect] }
  - skillset: { id: bad, skills: [src, halves, broken] }
indexer:
  id: idx
  skillset: [good, bad]
"#,
    );

    let err = Indexer::new(Arc::new(registry(&fixture)))
        .run(&cfg, &RunControl::new())
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), exit_codes::FATAL);
    assert!(err.to_string().contains("disk full"), "{err}");
    let names: Vec<&str> = err.partial_runs().iter().map(|r| r.skillset.as_str()).collect();
    assert_eq!(names, ["good", "bad"]);
    assert_eq!(err.partial_runs()[0].processed, 2);

    let report = IndexerReport::from_aborted("idx", &err);
    assert_eq!(report.runs.len(), 2);
    assert!(!report.succeeded());
}
