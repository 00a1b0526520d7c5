//! Skill traits, stage contracts, and the built-in skills.
//!
//! A skill is one pluggable stage of a skillset. Every skill plays exactly
//! one role:
//!
//! | Role | Trait | Shape |
//! |------|-------|-------|
//! | seed | [`Source`] | nothing → lazy stream of items |
//! | middle | [`Transform`] | one item → zero, one, or many items |
//! | terminal | [`Sink`] | batches of items → external writes |
//!
//! Each skill declares a [`Contract`]: which [`Shape`]s it accepts and
//! which one it produces. The assembler rejects adjacent skills whose
//! contracts do not line up. A pass-through transform forwards what it
//! receives, so the shape after it is the shape before it.

pub mod anonymizer;
pub mod embedding;
pub mod faq_splitter;
pub mod file_reader;
pub mod file_scanner;
pub mod json_writer;
pub mod qna_loader;
pub mod splitter;
pub mod sqlite_store;
pub mod web_exporter;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::SkillDefinition;
use crate::engine::{RetryPolicy, RunControl};
use crate::error::StageError;
use crate::models::Item;

/// The shape of the items flowing between two stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    /// A located file whose content has not been read.
    FileRef,
    Document,
    Chunk,
    /// A chunk carrying an embedding vector.
    EmbeddedChunk,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Shape::FileRef => "file references",
            Shape::Document => "documents",
            Shape::Chunk => "chunks",
            Shape::EmbeddedChunk => "embedded chunks",
        };
        f.write_str(s)
    }
}

/// What a skill consumes and produces. Sources accept nothing; sinks
/// produce nothing; pass-through transforms produce what they accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contract {
    pub accepts: &'static [Shape],
    pub produces: Option<Shape>,
    pub passthrough: bool,
}

impl Contract {
    pub const fn source(produces: Shape) -> Self {
        Self {
            accepts: &[],
            produces: Some(produces),
            passthrough: false,
        }
    }

    pub const fn transform(accepts: &'static [Shape], produces: Shape) -> Self {
        Self {
            accepts,
            produces: Some(produces),
            passthrough: false,
        }
    }

    pub const fn passthrough(accepts: &'static [Shape]) -> Self {
        Self {
            accepts,
            produces: None,
            passthrough: true,
        }
    }

    pub const fn sink(accepts: &'static [Shape]) -> Self {
        Self {
            accepts,
            produces: None,
            passthrough: false,
        }
    }

    pub fn accepts(&self, shape: Shape) -> bool {
        self.accepts.contains(&shape)
    }

    /// Shape leaving a stage that received `input`.
    pub fn output(&self, input: Shape) -> Option<Shape> {
        if self.passthrough {
            Some(input)
        } else {
            self.produces
        }
    }

    pub fn describe_accepts(&self) -> String {
        if self.accepts.is_empty() {
            return "nothing (it is a source)".to_string();
        }
        self.accepts
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" or ")
    }
}

/// A source failure attached to a single item (e.g. one page that could
/// not be exported).
#[derive(Debug, Clone)]
pub struct SourceFailure {
    pub item_id: String,
    pub error: StageError,
    pub attempts: u32,
}

/// Hands items from a [`Source`] to the first downstream stage.
///
/// The channel behind an emitter is bounded, so [`emit`](Emitter::emit)
/// waits whenever downstream stages fall behind.
pub struct Emitter {
    tx: mpsc::Sender<Item>,
    control: RunControl,
    retry: RetryPolicy,
    failures: Arc<Mutex<Vec<SourceFailure>>>,
    emitted: std::sync::atomic::AtomicU64,
}

impl Emitter {
    pub fn new(tx: mpsc::Sender<Item>, control: RunControl, retry: RetryPolicy) -> Self {
        Self {
            tx,
            control,
            retry,
            failures: Arc::new(Mutex::new(Vec::new())),
            emitted: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Send an item downstream. Returns `false` when the run is cancelled
    /// or downstream has gone away; the source should stop producing.
    pub async fn emit(&self, item: Item) -> bool {
        if self.control.is_cancelled() {
            return false;
        }
        let sent = tokio::select! {
            biased;
            _ = self.control.cancelled() => false,
            res = self.tx.send(item) => res.is_ok(),
        };
        if sent {
            self.emitted
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        sent
    }

    /// Record that one item could not be produced.
    pub fn fail(&self, item_id: impl Into<String>, error: StageError, attempts: u32) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SourceFailure {
                item_id: item_id.into(),
                error,
                attempts,
            });
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Retry policy configured for this source, for per-item fetches.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn take_failures(&self) -> Vec<SourceFailure> {
        std::mem::take(&mut *self.failures.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Remembers whether a remote service has answered at least once.
///
/// A connection failure before the first answer means the endpoint is
/// unreachable or misconfigured, and retrying every item against it would
/// only produce a report full of identical failures. Such errors are fatal;
/// once the service has answered, connection errors are transient.
#[derive(Debug, Default)]
pub struct Reachability {
    reached: AtomicBool,
}

impl Reachability {
    pub fn mark_reached(&self) {
        self.reached.store(true, Ordering::Release);
    }

    pub fn has_reached(&self) -> bool {
        self.reached.load(Ordering::Acquire)
    }

    /// Classify a request error against `target`.
    pub fn classify(&self, target: &str, err: reqwest::Error) -> StageError {
        if err.is_connect() && !self.has_reached() {
            StageError::fatal(format!("{} is unreachable: {}", target, err))
        } else {
            StageError::from_http(err)
        }
    }
}

/// Seeds a skillset with items.
#[async_trait]
pub trait Source: Send + Sync {
    fn contract(&self) -> Contract {
        Contract::source(Shape::Document)
    }

    /// Enumerate the source, emitting items until done or until
    /// [`Emitter::emit`] returns `false`. An `Err` means the source as a
    /// whole failed; per-item problems go through [`Emitter::fail`].
    async fn produce(&self, out: &Emitter) -> Result<(), StageError>;

    /// Release external handles. Called once at the end of a run.
    async fn close(&self) {}
}

/// A middle stage: 1:1 (reader, embedder) or 1:N (splitter).
#[async_trait]
pub trait Transform: Send + Sync {
    fn contract(&self) -> Contract;

    async fn apply(&self, item: Item) -> Result<Vec<Item>, StageError>;

    /// The tracker skipped `document_id` because it has not changed since
    /// the last run, so none of its items will pass through this stage.
    async fn unchanged(&self, _document_id: &str) {}

    /// Called once after all input has been handled and before
    /// [`close`](Transform::close), unless the run failed fatally.
    /// `complete` is false when the run was cancelled or its source did
    /// not finish. An `Err` fails the run.
    async fn finish(&self, _complete: bool) -> Result<(), StageError> {
        Ok(())
    }

    async fn close(&self) {}
}

/// A terminal stage that persists items, possibly in batches (N:1).
///
/// Writes must be idempotent on `chunk_id` (or `document_id` for
/// document sinks) because the engine retries transient failures.
#[async_trait]
pub trait Sink: Send + Sync {
    fn contract(&self) -> Contract {
        Contract::sink(&[Shape::EmbeddedChunk])
    }

    fn batch_size(&self) -> usize {
        1
    }

    async fn write(&self, batch: &[Item]) -> Result<(), StageError>;

    /// Remove previously written chunks that a newer version of their
    /// document no longer produces.
    async fn delete(&self, _chunk_ids: &[String]) -> Result<(), StageError> {
        Ok(())
    }

    async fn close(&self) {}
}

/// The role-specific implementation behind a skill instance.
#[derive(Clone)]
pub enum SkillKind {
    Source(Arc<dyn Source>),
    Transform(Arc<dyn Transform>),
    Sink(Arc<dyn Sink>),
}

impl SkillKind {
    pub fn source(s: impl Source + 'static) -> Self {
        SkillKind::Source(Arc::new(s))
    }

    pub fn transform(t: impl Transform + 'static) -> Self {
        SkillKind::Transform(Arc::new(t))
    }

    pub fn sink(s: impl Sink + 'static) -> Self {
        SkillKind::Sink(Arc::new(s))
    }

    pub fn contract(&self) -> Contract {
        match self {
            SkillKind::Source(s) => s.contract(),
            SkillKind::Transform(t) => t.contract(),
            SkillKind::Sink(s) => s.contract(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            SkillKind::Source(_) => "source",
            SkillKind::Transform(_) => "transform",
            SkillKind::Sink(_) => "sink",
        }
    }
}

/// A constructed skill bound to the definition it was built from.
#[derive(Clone)]
pub struct SkillInstance {
    pub definition: Arc<SkillDefinition>,
    pub kind: SkillKind,
}

impl SkillInstance {
    pub fn label(&self) -> String {
        self.definition.label()
    }

    pub fn contract(&self) -> Contract {
        self.kind.contract()
    }

    pub async fn close(&self) {
        match &self.kind {
            SkillKind::Source(s) => s.close().await,
            SkillKind::Transform(t) => t.close().await,
            SkillKind::Sink(s) => s.close().await,
        }
    }
}

impl fmt::Debug for SkillInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkillInstance")
            .field("skill", &self.label())
            .field("role", &self.kind.role())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_keeps_the_incoming_shape() {
        let writer = Contract::passthrough(&[Shape::Chunk, Shape::EmbeddedChunk]);
        assert_eq!(writer.output(Shape::Chunk), Some(Shape::Chunk));
        assert_eq!(writer.output(Shape::EmbeddedChunk), Some(Shape::EmbeddedChunk));

        let splitter = Contract::transform(&[Shape::Document], Shape::Chunk);
        assert_eq!(splitter.output(Shape::Document), Some(Shape::Chunk));
        assert_eq!(Contract::sink(&[Shape::Chunk]).output(Shape::Chunk), None);
    }

    #[tokio::test]
    async fn failures_survive_a_poisoned_lock() {
        let (tx, _rx) = mpsc::channel(1);
        let emitter = Arc::new(Emitter::new(tx, RunControl::new(), RetryPolicy::none()));

        let poisoner = emitter.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.failures.lock().unwrap();
            panic!("poison the failure list");
        })
        .join();
        assert!(emitter.failures.is_poisoned());

        emitter.fail("page-1", StageError::permanent("gone"), 2);
        let failures = emitter.take_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].item_id, "page-1");
        assert_eq!(failures[0].attempts, 2);
    }

    #[tokio::test]
    async fn connect_errors_are_fatal_until_reached() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = reqwest::Client::new();
        let url = format!("http://{}/", addr);
        let reach = Reachability::default();

        let err = client.get(&url).send().await.unwrap_err();
        assert!(matches!(reach.classify("test service", err), StageError::Fatal(_)));

        reach.mark_reached();
        let err = client.get(&url).send().await.unwrap_err();
        assert!(matches!(reach.classify("test service", err), StageError::Transient(_)));
    }
}
