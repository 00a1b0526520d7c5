//! Loader for enriched Q&A exports.
//!
//! Reads a JSON array of conversation threads, each with an original
//! question, optional AI-rephrased question and answer, a topic and the
//! list of replies. Every usable pair becomes one [`Document`] whose
//! content is `Q: …\n\nA: …`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;

use super::{Contract, Emitter, Shape, SkillKind, Source};
use crate::config::{LoaderParams, SkillDefinition, SkillParams};
use crate::error::StageError;
use crate::models::{Document, Item};

const DEFAULT_TAG: &str = "enriched-qna";
const MAX_ID_LEN: usize = 128;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QnaEntry {
    thread_id: Option<serde_json::Value>,
    question: Option<String>,
    rephrased_question: Option<String>,
    rephrased_answer: Option<String>,
    topic: Option<String>,
    source_link: Option<String>,
    answers: Vec<QnaAnswer>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QnaAnswer {
    answer: Option<String>,
    is_expert: bool,
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.is_empty())
}

impl QnaEntry {
    fn question(&self) -> &str {
        non_empty(&self.rephrased_question)
            .or_else(|| self.question.as_deref())
            .unwrap_or("")
    }

    /// Rephrased answer, else the first expert reply, else the first reply.
    fn answer(&self) -> &str {
        if let Some(a) = non_empty(&self.rephrased_answer) {
            return a;
        }
        self.answers
            .iter()
            .find(|a| a.is_expert)
            .or_else(|| self.answers.first())
            .and_then(|a| a.answer.as_deref())
            .unwrap_or("")
    }

    fn thread_id(&self) -> Option<String> {
        match &self.thread_id {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Replace anything outside `[A-Za-z0-9_-]` with `_` and cap the length.
pub fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(MAX_ID_LEN)
        .collect()
}

pub struct QnaLoader {
    file_path: PathBuf,
    tag: String,
}

pub fn build(def: &SkillDefinition) -> Result<SkillKind> {
    let SkillParams::Loader(params) = &def.params else {
        bail!("expected loader params");
    };
    Ok(SkillKind::source(QnaLoader::new(params)))
}

impl QnaLoader {
    pub fn new(params: &LoaderParams) -> Self {
        Self {
            file_path: params.file_path.clone(),
            tag: params.tag.clone().unwrap_or_else(|| DEFAULT_TAG.to_string()),
        }
    }

    async fn load(&self) -> Result<Vec<serde_json::Value>, StageError> {
        let text = tokio::fs::read_to_string(&self.file_path).await.map_err(|e| {
            StageError::fatal(format!("cannot read {}: {}", self.file_path.display(), e))
        })?;
        let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            StageError::fatal(format!("{} is not valid JSON: {}", self.file_path.display(), e))
        })?;
        match value {
            serde_json::Value::Array(entries) => Ok(entries),
            other => Err(StageError::fatal(format!(
                "expected a JSON array of Q&A objects, got {}",
                json_type(&other)
            ))),
        }
    }

    fn to_document(&self, idx: usize, entry: &QnaEntry) -> Option<Document> {
        let question = entry.question().trim();
        let answer = entry.answer().trim();
        if question.is_empty() || answer.is_empty() {
            return None;
        }

        let id = sanitize_id(&entry.thread_id().unwrap_or_else(|| format!("qna_{}", idx)));
        let topic = entry.topic.as_deref().unwrap_or("General");
        let source_uri = non_empty(&entry.source_link)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| format!("file://{}#{}", self.file_path.display(), idx));

        Some(
            Document::new(id, source_uri, format!("Q: {}\n\nA: {}", question, answer))
                .with_metadata("title", format!("{} - FAQ", topic))
                .with_metadata("topic", topic)
                .with_metadata("tag", self.tag.clone()),
        )
    }
}

fn json_type(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[async_trait]
impl Source for QnaLoader {
    fn contract(&self) -> Contract {
        Contract::source(Shape::Document)
    }

    async fn produce(&self, out: &Emitter) -> Result<(), StageError> {
        let entries = self.load().await?;
        if entries.is_empty() {
            tracing::warn!(path = %self.file_path.display(), "no Q&A pairs found");
        }

        let mut loaded = 0usize;
        for (idx, raw) in entries.into_iter().enumerate() {
            let entry: QnaEntry = match serde_json::from_value(raw) {
                Ok(e) => e,
                Err(e) => {
                    out.fail(format!("qna_{}", idx), StageError::permanent(e), 1);
                    continue;
                }
            };
            let Some(doc) = self.to_document(idx, &entry) else {
                tracing::debug!(index = idx, "skipping Q&A pair without question or answer");
                continue;
            };
            if !out.emit(Item::Document(doc)).await {
                break;
            }
            loaded += 1;
        }

        tracing::info!(path = %self.file_path.display(), loaded, "loaded Q&A pairs");
        Ok(())
    }
}
