//! Core data models that flow through a skillset.
//!
//! Sources emit [`FileRef`]s or [`Document`]s, splitters turn documents into
//! [`Chunk`]s, embedders attach vectors, and sinks persist [`IndexRecord`]s.
//! Values move downstream by ownership; later stages build new values
//! instead of editing fields produced upstream.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A file found by a scanner whose content has not been read yet.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRef {
    /// Stable identifier: the path relative to the scan root.
    pub id: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// A normalized source document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub source_uri: String,
    pub raw_content: String,
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(id: impl Into<String>, source_uri: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_uri: source_uri.into(),
            raw_content: content.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// SHA-256 fingerprint of the content, used by the tracker.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.raw_content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Human-readable name: `title` or `file_name` metadata, else the id.
    pub fn display_name(&self) -> String {
        self.metadata
            .get("title")
            .or_else(|| self.metadata.get("file_name"))
            .cloned()
            .unwrap_or_else(|| self.id.clone())
    }

    pub fn tag(&self) -> Option<String> {
        self.metadata.get("tag").cloned()
    }
}

/// A content-addressable slice of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub parent_document_id: String,
    pub content: String,
    pub position: usize,
    pub embedding: Option<Vec<f32>>,
    pub document_name: String,
    pub source_link: String,
    pub tag: Option<String>,
}

impl Chunk {
    /// Build the chunk at `position` of `doc`. The id is derived from
    /// `(document id, position, content)` only.
    pub fn from_document(doc: &Document, position: usize, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            chunk_id: chunk_id(&doc.id, position, &content),
            parent_document_id: doc.id.clone(),
            position,
            embedding: None,
            document_name: doc.display_name(),
            source_link: doc.source_uri.clone(),
            tag: doc.tag(),
            content,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Deterministic chunk identity: hex SHA-256 over the parent id, position
/// and content, separated by NUL bytes.
pub fn chunk_id(document_id: &str, position: usize, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(position.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The value passed between stages.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    File(FileRef),
    Document(Document),
    Chunk(Chunk),
}

impl Item {
    /// Identifier used when reporting failures.
    pub fn id(&self) -> &str {
        match self {
            Item::File(f) => &f.id,
            Item::Document(d) => &d.id,
            Item::Chunk(c) => &c.chunk_id,
        }
    }

    /// The document this item belongs to, once a document exists.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            Item::File(_) => None,
            Item::Document(d) => Some(&d.id),
            Item::Chunk(c) => Some(&c.parent_document_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Item::File(_) => "file",
            Item::Document(_) => "document",
            Item::Chunk(c) if c.embedding.is_some() => "embedded chunk",
            Item::Chunk(_) => "chunk",
        }
    }
}

/// Canonical logical fields of an [`IndexRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalField {
    DocumentId,
    Content,
    Embedding,
    SourceLink,
    DocumentName,
    ChunkId,
}

impl LogicalField {
    pub const ALL: [LogicalField; 6] = [
        LogicalField::DocumentId,
        LogicalField::Content,
        LogicalField::Embedding,
        LogicalField::SourceLink,
        LogicalField::DocumentName,
        LogicalField::ChunkId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalField::DocumentId => "document_id",
            LogicalField::Content => "content",
            LogicalField::Embedding => "embedding",
            LogicalField::SourceLink => "source_link",
            LogicalField::DocumentName => "document_name",
            LogicalField::ChunkId => "chunk_id",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == s)
    }
}

/// Renames canonical fields to a backend's schema. Unmapped fields keep
/// their canonical name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMapping {
    renames: BTreeMap<LogicalField, String>,
}

impl FieldMapping {
    /// Build from a `logical name -> target name` map. Unknown logical
    /// names are rejected by the schema validator before this is called.
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let renames = map
            .iter()
            .filter_map(|(k, v)| LogicalField::parse(k).map(|f| (f, v.clone())))
            .collect();
        Self { renames }
    }

    pub fn target(&self, field: LogicalField) -> &str {
        self.renames
            .get(&field)
            .map(String::as_str)
            .unwrap_or_else(|| field.as_str())
    }
}

/// The unit a sink persists.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub source_link: String,
    pub document_name: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub extra: BTreeMap<String, String>,
}

impl IndexRecord {
    pub fn from_chunk(chunk: &Chunk) -> Self {
        let mut extra = BTreeMap::new();
        if let Some(tag) = &chunk.tag {
            extra.insert("tag".to_string(), tag.clone());
        }
        extra.insert("position".to_string(), chunk.position.to_string());
        Self {
            chunk_id: chunk.chunk_id.clone(),
            document_id: chunk.parent_document_id.clone(),
            source_link: chunk.source_link.clone(),
            document_name: chunk.document_name.clone(),
            content: chunk.content.clone(),
            embedding: chunk.embedding.clone().unwrap_or_default(),
            extra,
        }
    }

    /// Render the record as a JSON object with field names remapped.
    pub fn to_mapped_json(&self, mapping: &FieldMapping) -> serde_json::Map<String, serde_json::Value> {
        use serde_json::Value;

        let mut obj = serde_json::Map::new();
        obj.insert(
            mapping.target(LogicalField::ChunkId).to_string(),
            Value::String(self.chunk_id.clone()),
        );
        obj.insert(
            mapping.target(LogicalField::DocumentId).to_string(),
            Value::String(self.document_id.clone()),
        );
        obj.insert(
            mapping.target(LogicalField::SourceLink).to_string(),
            Value::String(self.source_link.clone()),
        );
        obj.insert(
            mapping.target(LogicalField::DocumentName).to_string(),
            Value::String(self.document_name.clone()),
        );
        obj.insert(
            mapping.target(LogicalField::Content).to_string(),
            Value::String(self.content.clone()),
        );
        obj.insert(
            mapping.target(LogicalField::Embedding).to_string(),
            serde_json::json!(self.embedding),
        );
        for (k, v) in &self.extra {
            obj.entry(k.clone()).or_insert_with(|| Value::String(v.clone()));
        }
        obj
    }
}

/// Per-document processing state kept by a tracker across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerEntry {
    pub document_id: String,
    pub content_hash: String,
    pub last_processed_at: DateTime<Utc>,
    pub chunk_ids: BTreeSet<String>,
}
