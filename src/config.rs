//! Configuration loading and the typed, validated configuration model.
//!
//! A configuration file (YAML or TOML, chosen by extension) is parsed into
//! a generic JSON tree and handed to [`crate::schema::validate`], which
//! either reports every violation or returns a [`ValidatedConfig`]. Typed
//! parameter structs are only built from params that already passed the
//! schema, so `deny_unknown_fields` never fires in practice.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{IndexerError, Result};
use crate::schema;

/// Skill categories recognised by the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SkillCategory {
    Exporter,
    Reader,
    Splitter,
    Embedding,
    VectorStore,
    Uploader,
    IntegratedPipeline,
    FileScanner,
    Loader,
    Anonymizer,
}

impl SkillCategory {
    pub const ALL: [SkillCategory; 10] = [
        SkillCategory::Exporter,
        SkillCategory::Reader,
        SkillCategory::Splitter,
        SkillCategory::Embedding,
        SkillCategory::VectorStore,
        SkillCategory::Uploader,
        SkillCategory::IntegratedPipeline,
        SkillCategory::FileScanner,
        SkillCategory::Loader,
        SkillCategory::Anonymizer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SkillCategory::Exporter => "exporter",
            SkillCategory::Reader => "reader",
            SkillCategory::Splitter => "splitter",
            SkillCategory::Embedding => "embedding",
            SkillCategory::VectorStore => "vector-store",
            SkillCategory::Uploader => "uploader",
            SkillCategory::IntegratedPipeline => "integrated-pipeline",
            SkillCategory::FileScanner => "file-scanner",
            SkillCategory::Loader => "loader",
            SkillCategory::Anonymizer => "anonymizer",
        }
    }

    /// Parse a category name. `source` is accepted as an alias of `exporter`.
    pub fn parse(s: &str) -> Option<Self> {
        if s == "source" {
            return Some(SkillCategory::Exporter);
        }
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// Categories allowed to seed a skillset.
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            SkillCategory::Exporter | SkillCategory::FileScanner | SkillCategory::Loader
        )
    }
}

impl fmt::Display for SkillCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── per-category parameter blocks ──────────────────────────────────────

fn default_filter() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_chunk_size() -> usize {
    1000
}
fn default_min_heading_level() -> u8 {
    2
}
fn default_max_heading_level() -> u8 {
    6
}
fn default_batch_size() -> usize {
    32
}
fn default_output_path() -> PathBuf {
    PathBuf::from("data/pipeline_output.json")
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileScannerParams {
    pub path: PathBuf,
    #[serde(default = "default_filter")]
    pub filter: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default)]
    pub follow_symlinks: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InvalidUtf8 {
    #[default]
    Fail,
    Replace,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ReaderParams {
    #[serde(default)]
    pub max_file_size: Option<u64>,
    #[serde(default)]
    pub on_invalid_utf8: InvalidUtf8,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LoaderParams {
    pub file_path: PathBuf,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportScope {
    #[default]
    Current,
    Descendants,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExporterParams {
    pub url: String,
    #[serde(default)]
    pub pages: Vec<String>,
    #[serde(default)]
    pub scope: ExportScope,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SplitterParams {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub overlap: usize,
    #[serde(default = "default_min_heading_level")]
    pub min_heading_level: u8,
    #[serde(default = "default_max_heading_level")]
    pub max_heading_level: u8,
    #[serde(default)]
    pub question_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub skip_headings: Option<Vec<String>>,
    #[serde(default)]
    pub stop_sections: Option<Vec<String>>,
    #[serde(default)]
    pub skip_patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingParams {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Azure OpenAI deployment; replaces `model` in the request path.
    #[serde(default)]
    pub deployment_name: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl EmbeddingParams {
    /// Inline key first, then the named environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
        })
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VectorStoreParams {
    pub connection_string: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UploaderParams {
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AnonymizerParams {
    /// Replace matches with `<ENTITY_TYPE>` instead of masking characters.
    #[serde(default = "default_true")]
    pub use_placeholders: bool,
    /// Entity types to recognise; all known types when absent.
    #[serde(default)]
    pub entities: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IntegratedPipelineParams {
    pub url: String,
    pub index_name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,
}

/// Validated params, one variant per category.
#[derive(Debug, Clone, PartialEq)]
pub enum SkillParams {
    Exporter(ExporterParams),
    Reader(ReaderParams),
    Splitter(SplitterParams),
    Embedding(EmbeddingParams),
    VectorStore(VectorStoreParams),
    Uploader(UploaderParams),
    IntegratedPipeline(IntegratedPipelineParams),
    FileScanner(FileScannerParams),
    Loader(LoaderParams),
    Anonymizer(AnonymizerParams),
}

impl SkillParams {
    pub fn category(&self) -> SkillCategory {
        match self {
            SkillParams::Exporter(_) => SkillCategory::Exporter,
            SkillParams::Reader(_) => SkillCategory::Reader,
            SkillParams::Splitter(_) => SkillCategory::Splitter,
            SkillParams::Embedding(_) => SkillCategory::Embedding,
            SkillParams::VectorStore(_) => SkillCategory::VectorStore,
            SkillParams::Uploader(_) => SkillCategory::Uploader,
            SkillParams::IntegratedPipeline(_) => SkillCategory::IntegratedPipeline,
            SkillParams::FileScanner(_) => SkillCategory::FileScanner,
            SkillParams::Loader(_) => SkillCategory::Loader,
            SkillParams::Anonymizer(_) => SkillCategory::Anonymizer,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

/// Per-stage retry settings for transient failures.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryParams {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Keys every skill accepts regardless of category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonParams {
    pub concurrency: usize,
    pub retry: RetryParams,
}

impl Default for CommonParams {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retry: RetryParams::default(),
        }
    }
}

/// One validated skill definition. Identity is its position in the
/// `definitions` list; skillsets share it through `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillDefinition {
    pub index: usize,
    pub id: Option<String>,
    pub category: SkillCategory,
    pub name: String,
    pub params: SkillParams,
    pub common: CommonParams,
}

impl SkillDefinition {
    /// `category/name`, used in logs and reports.
    pub fn label(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }
}

/// An ordered composition of skill definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct Skillset {
    pub id: String,
    pub skills: Vec<Arc<SkillDefinition>>,
}

/// Tracker declaration from `indexer.tracker`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerDecl {
    pub connection_string: String,
    /// Fall back to full reprocessing when the tracker cannot be used.
    pub tolerate_unavailable: bool,
    /// Delete tracker entries for documents no longer present at the source.
    pub purge_stale: bool,
}

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexerDecl {
    pub id: String,
    pub skillsets: Vec<Arc<Skillset>>,
    pub tracker: Option<TrackerDecl>,
    pub channel_capacity: usize,
    pub grace_period: Duration,
}

/// The output of a successful validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedConfig {
    pub definitions: Vec<Arc<SkillDefinition>>,
    pub skillsets: Vec<Arc<Skillset>>,
    pub indexer: IndexerDecl,
}

/// Parse raw configuration text. `format` is `"yaml"` or `"toml"`.
pub fn parse_document(content: &str, format: &str) -> Result<serde_json::Value> {
    match format {
        "toml" => toml::from_str(content).map_err(|e| IndexerError::Parse(e.to_string())),
        _ => serde_yaml::from_str(content).map_err(|e| IndexerError::Parse(e.to_string())),
    }
}

/// Read, parse and validate a configuration file.
pub fn load_config(path: &Path) -> Result<ValidatedConfig> {
    let content = std::fs::read_to_string(path).map_err(|source| IndexerError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let format = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => "toml",
        _ => "yaml",
    };

    let doc = parse_document(&content, format)?;
    Ok(schema::validate(&doc)?)
}
