//! JSON snapshot writer.
//!
//! A pass-through stage: every document or chunk is forwarded unchanged and
//! remembered on the way. When the run finishes, `output_path` holds the
//! sorted JSON array of the remembered contents. Volatile fields (ids,
//! timestamps, file names) are left out so a checksum of the file changes
//! only when text does. With a `field_mapping`, each entry is instead the
//! mapped record object, ordered by content. Empty contents are forwarded
//! but not written.
//!
//! A manifest beside the output (`<output_path>.manifest`) keeps the
//! entries of the previous run. Entries of a document this run did not see
//! survive when the tracker skipped the document as unchanged, or when the
//! run did not complete; otherwise they are dropped.
//!
//! Both files are written through a temporary sibling and a rename, so a
//! reader never observes a half-written array.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{Contract, Shape, SkillKind, Transform};
use crate::config::{SkillDefinition, SkillParams, UploaderParams};
use crate::error::StageError;
use crate::models::{Chunk, FieldMapping, IndexRecord, Item};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    document_id: String,
    content: String,
    #[serde(default)]
    record: serde_json::Value,
}

/// What this run has seen, keyed by chunk id (or document id for whole
/// documents).
#[derive(Default)]
struct Collected {
    entries: BTreeMap<String, Entry>,
    seen: BTreeSet<String>,
    carried: BTreeSet<String>,
}

pub struct JsonWriter {
    output_path: PathBuf,
    manifest_path: PathBuf,
    mapping: Option<FieldMapping>,
    state: Mutex<Collected>,
}

pub fn build(def: &SkillDefinition) -> Result<SkillKind> {
    let SkillParams::Uploader(params) = &def.params else {
        bail!("expected uploader params");
    };
    Ok(SkillKind::transform(JsonWriter::new(params)))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.to_path_buf().into_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

impl JsonWriter {
    pub fn new(params: &UploaderParams) -> Self {
        let mapping = if params.field_mapping.is_empty() {
            None
        } else {
            Some(FieldMapping::from_map(&params.field_mapping))
        };
        Self {
            manifest_path: sibling(&params.output_path, ".manifest"),
            output_path: params.output_path.clone(),
            mapping,
            state: Mutex::new(Collected::default()),
        }
    }

    fn entry(&self, chunk: &Chunk) -> Entry {
        let record = match &self.mapping {
            Some(mapping) => serde_json::Value::Object(IndexRecord::from_chunk(chunk).to_mapped_json(mapping)),
            None => serde_json::Value::Null,
        };
        Entry {
            document_id: chunk.parent_document_id.clone(),
            content: chunk.content.clone(),
            record,
        }
    }

    fn render(&self, entries: &BTreeMap<String, Entry>) -> serde_json::Value {
        let mut sorted: Vec<(&String, &Entry)> = entries.iter().collect();
        sorted.sort_by(|a, b| a.1.content.cmp(&b.1.content).then(a.0.cmp(b.0)));
        let values = sorted
            .into_iter()
            .map(|(_, entry)| match self.mapping {
                Some(_) => entry.record.clone(),
                None => serde_json::Value::String(entry.content.clone()),
            })
            .collect();
        serde_json::Value::Array(values)
    }

    async fn previous_entries(&self) -> Result<BTreeMap<String, Entry>, StageError> {
        let text = match tokio::fs::read_to_string(&self.manifest_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(io_error(&self.manifest_path, e)),
        };
        match serde_json::from_str(&text) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                tracing::warn!(
                    path = %self.manifest_path.display(),
                    error = %e,
                    "ignoring unreadable manifest"
                );
                Ok(BTreeMap::new())
            }
        }
    }
}

async fn write_atomic(path: &Path, value: &impl Serialize) -> Result<(), StageError> {
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| StageError::permanent(format!("cannot serialize output: {}", e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| io_error(path, e))?;
        }
    }
    let tmp = sibling(path, ".tmp");
    tokio::fs::write(&tmp, body).await.map_err(|e| io_error(&tmp, e))?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| io_error(path, e))
}

fn io_error(path: &Path, e: std::io::Error) -> StageError {
    let msg = format!("{}: {}", path.display(), e);
    match e.kind() {
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock => StageError::transient(msg),
        _ => StageError::permanent(msg),
    }
}

#[async_trait]
impl Transform for JsonWriter {
    fn contract(&self) -> Contract {
        Contract::passthrough(&[Shape::Document, Shape::Chunk, Shape::EmbeddedChunk])
    }

    async fn apply(&self, item: Item) -> Result<Vec<Item>, StageError> {
        let (key, entry) = match &item {
            Item::Chunk(chunk) => (chunk.chunk_id.clone(), self.entry(chunk)),
            Item::Document(doc) => (
                doc.id.clone(),
                self.entry(&Chunk::from_document(doc, 0, doc.raw_content.as_str())),
            ),
            other => {
                return Err(StageError::permanent(format!(
                    "json-writer cannot write a {}",
                    other.kind()
                )))
            }
        };

        let mut state = self.state.lock().await;
        state.seen.insert(entry.document_id.clone());
        if !entry.content.is_empty() {
            state.entries.insert(key, entry);
        }
        drop(state);
        Ok(vec![item])
    }

    async fn unchanged(&self, document_id: &str) {
        self.state.lock().await.carried.insert(document_id.to_string());
    }

    async fn finish(&self, complete: bool) -> Result<(), StageError> {
        let state = self.state.lock().await;
        let mut entries = state.entries.clone();
        let mut kept = 0usize;
        for (key, entry) in self.previous_entries().await? {
            if state.seen.contains(&entry.document_id) {
                continue;
            }
            if complete && !state.carried.contains(&entry.document_id) {
                continue;
            }
            entries.entry(key).or_insert(entry);
            kept += 1;
        }

        write_atomic(&self.output_path, &self.render(&entries)).await?;
        write_atomic(&self.manifest_path, &entries).await?;

        tracing::debug!(
            path = %self.output_path.display(),
            entries = entries.len(),
            kept,
            complete,
            "wrote snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Document, FileRef};
    use tempfile::TempDir;

    fn writer(tmp: &TempDir, mapping: &[(&str, &str)]) -> JsonWriter {
        JsonWriter::new(&UploaderParams {
            output_path: tmp.path().join("out/pipeline_output.json"),
            field_mapping: mapping
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }

    fn chunk(doc: &str, text: &str) -> Item {
        let doc = Document::new(doc, "file:///x", text);
        Item::Chunk(Chunk::from_document(&doc, 0, text))
    }

    fn read(tmp: &TempDir) -> serde_json::Value {
        let text = std::fs::read_to_string(tmp.path().join("out/pipeline_output.json")).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    async fn run(w: &JsonWriter, items: &[Item]) {
        for item in items {
            let out = w.apply(item.clone()).await.unwrap();
            assert_eq!(out, vec![item.clone()]);
        }
    }

    #[tokio::test]
    async fn forwards_items_and_writes_sorted_contents_on_finish() {
        let tmp = TempDir::new().unwrap();
        let w = writer(&tmp, &[]);
        run(&w, &[chunk("b", "zeta"), chunk("e", ""), chunk("a", "alpha")]).await;
        assert!(!tmp.path().join("out/pipeline_output.json").exists());

        w.finish(true).await.unwrap();
        assert_eq!(read(&tmp), serde_json::json!(["alpha", "zeta"]));
        assert!(tmp.path().join("out/pipeline_output.json.manifest").exists());
    }

    #[tokio::test]
    async fn carried_documents_keep_their_previous_entries() {
        let tmp = TempDir::new().unwrap();
        let first = writer(&tmp, &[]);
        run(&first, &[chunk("a", "alpha"), chunk("b", "beta")]).await;
        first.finish(true).await.unwrap();

        let second = writer(&tmp, &[]);
        second.unchanged("a").await;
        run(&second, &[chunk("b", "beta v2")]).await;
        second.finish(true).await.unwrap();
        assert_eq!(read(&tmp), serde_json::json!(["alpha", "beta v2"]));

        // "a" was neither seen nor carried: it is gone from the source.
        let third = writer(&tmp, &[]);
        run(&third, &[chunk("b", "beta v2")]).await;
        third.finish(true).await.unwrap();
        assert_eq!(read(&tmp), serde_json::json!(["beta v2"]));
    }

    #[tokio::test]
    async fn incomplete_runs_keep_unseen_entries() {
        let tmp = TempDir::new().unwrap();
        let first = writer(&tmp, &[]);
        run(&first, &[chunk("a", "alpha"), chunk("b", "beta")]).await;
        first.finish(true).await.unwrap();

        let second = writer(&tmp, &[]);
        run(&second, &[chunk("c", "gamma")]).await;
        second.finish(false).await.unwrap();
        assert_eq!(read(&tmp), serde_json::json!(["alpha", "beta", "gamma"]));
    }

    #[tokio::test]
    async fn field_mapping_writes_objects() {
        let tmp = TempDir::new().unwrap();
        let w = writer(&tmp, &[("content", "text")]);
        run(&w, &[chunk("a", "alpha")]).await;
        w.finish(true).await.unwrap();
        let out = read(&tmp);
        assert_eq!(out[0]["text"], "alpha");
        assert_eq!(out[0]["document_id"], "a");
    }

    #[tokio::test]
    async fn documents_are_written_whole_and_files_rejected() {
        let tmp = TempDir::new().unwrap();
        let w = writer(&tmp, &[]);
        run(&w, &[Item::Document(Document::new("d", "u", "whole text"))]).await;
        w.finish(true).await.unwrap();
        assert_eq!(read(&tmp), serde_json::json!(["whole text"]));

        let file = Item::File(FileRef {
            id: "f.md".into(),
            path: tmp.path().join("f.md"),
            size: 0,
            modified: chrono::Utc::now(),
        });
        assert!(matches!(w.apply(file).await, Err(StageError::Permanent(_))));
    }
}
