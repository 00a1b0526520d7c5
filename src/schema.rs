//! Structural validation of a parsed configuration document.
//!
//! [`validate`] walks the whole tree and collects every violation before
//! returning, so a user fixing a config sees all problems at once. Each
//! skill's `params` block is checked against the field table of its
//! category: unknown keys, wrong types, missing required keys, URL
//! patterns, numeric minimums and restricted value sets are all reported
//! with the dotted path of the offending field.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::config::{
    CommonParams, IndexerDecl, RetryParams, SkillCategory, SkillDefinition, SkillParams,
    Skillset, TrackerDecl, ValidatedConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_GRACE_PERIOD_MS,
};
use crate::error::{ConfigValidationError, Violation};
use crate::models::LogicalField;
use crate::skills::anonymizer::EntityKind;

const HTTP_URL: &str = r"^https?://[^\s/$.?#][^\s]*$";
const SQLITE_URI: &str = r"^sqlite:";
const TRACKER_URI: &str = r"^(sqlite:|memory:|mongodb(\+srv)?://)";

/// The expected shape of one field.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Str,
    /// A string matching a regex; the second element describes it.
    Pattern(&'static str, &'static str),
    Int { min: i64 },
    Bool,
    StrList,
    OneOf(&'static [&'static str]),
    /// `logical field -> backend field` renames.
    FieldMapping,
    Object(&'static [FieldSpec]),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

const fn req(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: true,
    }
}

const fn opt(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: false,
    }
}

const RETRY_FIELDS: &[FieldSpec] = &[
    opt("max_attempts", FieldKind::Int { min: 1 }),
    opt("initial_backoff_ms", FieldKind::Int { min: 0 }),
    opt("max_backoff_ms", FieldKind::Int { min: 0 }),
];

const COMMON_FIELDS: &[FieldSpec] = &[
    opt("concurrency", FieldKind::Int { min: 1 }),
    opt("retry", FieldKind::Object(RETRY_FIELDS)),
];

const FILE_SCANNER_FIELDS: &[FieldSpec] = &[
    req("path", FieldKind::Str),
    opt("filter", FieldKind::StrList),
    opt("exclude", FieldKind::StrList),
    opt("recursive", FieldKind::Bool),
    opt("follow_symlinks", FieldKind::Bool),
];

const READER_FIELDS: &[FieldSpec] = &[
    opt("max_file_size", FieldKind::Int { min: 1 }),
    opt("on_invalid_utf8", FieldKind::OneOf(&["fail", "replace"])),
];

const LOADER_FIELDS: &[FieldSpec] = &[
    req("file_path", FieldKind::Str),
    opt("tag", FieldKind::Str),
];

const EXPORTER_FIELDS: &[FieldSpec] = &[
    req("url", FieldKind::Pattern(HTTP_URL, "an http(s) URL")),
    opt("pages", FieldKind::StrList),
    opt("scope", FieldKind::OneOf(&["descendants", "current"])),
    opt("auth_token", FieldKind::Str),
    opt("timeout_secs", FieldKind::Int { min: 1 }),
    opt("tag", FieldKind::Str),
];

const SPLITTER_FIELDS: &[FieldSpec] = &[
    opt("chunk_size", FieldKind::Int { min: 1 }),
    opt("overlap", FieldKind::Int { min: 0 }),
    opt("min_heading_level", FieldKind::Int { min: 1 }),
    opt("max_heading_level", FieldKind::Int { min: 1 }),
    opt("question_patterns", FieldKind::StrList),
    opt("skip_headings", FieldKind::StrList),
    opt("stop_sections", FieldKind::StrList),
    opt("skip_patterns", FieldKind::StrList),
];

const EMBEDDING_FIELDS: &[FieldSpec] = &[
    opt("endpoint", FieldKind::Pattern(HTTP_URL, "an http(s) URL")),
    opt("model", FieldKind::Str),
    opt("deployment_name", FieldKind::Str),
    opt("api_version", FieldKind::Str),
    opt("dims", FieldKind::Int { min: 1 }),
    opt("api_key", FieldKind::Str),
    opt("api_key_env", FieldKind::Str),
    opt("timeout_secs", FieldKind::Int { min: 1 }),
];

const VECTOR_STORE_FIELDS: &[FieldSpec] = &[
    req(
        "connection_string",
        FieldKind::Pattern(SQLITE_URI, "a sqlite: connection string"),
    ),
    opt("table", FieldKind::Pattern(r"^[A-Za-z_][A-Za-z0-9_]*$", "a SQL identifier")),
    opt("field_mapping", FieldKind::FieldMapping),
    opt("batch_size", FieldKind::Int { min: 1 }),
];

const UPLOADER_FIELDS: &[FieldSpec] = &[
    opt("output_path", FieldKind::Str),
    opt("field_mapping", FieldKind::FieldMapping),
];

const ANONYMIZER_FIELDS: &[FieldSpec] = &[
    opt("use_placeholders", FieldKind::Bool),
    opt("entities", FieldKind::StrList),
];

const INTEGRATED_FIELDS: &[FieldSpec] = &[
    req("url", FieldKind::Pattern(HTTP_URL, "an http(s) URL")),
    req("index_name", FieldKind::Str),
    opt("api_key", FieldKind::Str),
    opt("field_mapping", FieldKind::FieldMapping),
];

const DATABASE_FIELDS: &[FieldSpec] = &[req(
    "connection_string",
    FieldKind::Pattern(
        TRACKER_URI,
        "a sqlite:, memory: or mongodb:// connection string",
    ),
)];

const TRACKER_PARAM_FIELDS: &[FieldSpec] = &[
    req("database", FieldKind::Object(DATABASE_FIELDS)),
    opt("tolerate_unavailable", FieldKind::Bool),
    opt("purge_stale", FieldKind::Bool),
];

const TRACKER_FIELDS: &[FieldSpec] = &[req("params", FieldKind::Object(TRACKER_PARAM_FIELDS))];

/// Category-specific params fields (the common fields are added on top).
pub fn params_schema(category: SkillCategory) -> &'static [FieldSpec] {
    match category {
        SkillCategory::FileScanner => FILE_SCANNER_FIELDS,
        SkillCategory::Reader => READER_FIELDS,
        SkillCategory::Loader => LOADER_FIELDS,
        SkillCategory::Exporter => EXPORTER_FIELDS,
        SkillCategory::Splitter => SPLITTER_FIELDS,
        SkillCategory::Embedding => EMBEDDING_FIELDS,
        SkillCategory::VectorStore => VECTOR_STORE_FIELDS,
        SkillCategory::Uploader => UPLOADER_FIELDS,
        SkillCategory::IntegratedPipeline => INTEGRATED_FIELDS,
        SkillCategory::Anonymizer => ANONYMIZER_FIELDS,
    }
}

/// Validate a parsed configuration document.
pub fn validate(doc: &Value) -> Result<ValidatedConfig, ConfigValidationError> {
    let mut v = Validator::default();
    let config = v.run(doc);
    match config {
        Some(config) if v.violations.is_empty() => Ok(config),
        _ => Err(ConfigValidationError {
            violations: v.violations,
        }),
    }
}

#[derive(Default)]
struct Validator {
    violations: Vec<Violation>,
    regexes: HashMap<&'static str, Regex>,
    definitions: Vec<Arc<SkillDefinition>>,
    /// Raw value of each definition, used to share identical inline skills.
    raw_definitions: Vec<Value>,
    skill_ids: HashMap<String, Arc<SkillDefinition>>,
    skillsets: Vec<Arc<Skillset>>,
    skillset_ids: HashMap<String, Arc<Skillset>>,
}

impl Validator {
    fn violation(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation::new(path, message));
    }

    fn run(&mut self, doc: &Value) -> Option<ValidatedConfig> {
        let Some(root) = doc.as_object() else {
            self.violation("$", "configuration must be a mapping");
            return None;
        };

        for key in root.keys() {
            if key != "definitions" && key != "indexer" {
                self.violation(key.clone(), "unknown top-level key");
            }
        }

        let entries = match root.get("definitions") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                self.violation("definitions", "expected a list");
                Vec::new()
            }
        };

        // Skills first so skillsets may reference ids declared later.
        let mut pending_skillsets = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let path = format!("definitions[{}]", i);
            let Some(obj) = entry.as_object() else {
                self.violation(path, "expected a mapping with a 'skill' or 'skillset' key");
                continue;
            };
            if obj.len() != 1 {
                self.violation(path, "expected exactly one of 'skill' or 'skillset'");
                continue;
            }
            if let Some(skill) = obj.get("skill") {
                self.declare_skill(skill, &format!("{}.skill", path));
            } else if let Some(skillset) = obj.get("skillset") {
                pending_skillsets.push((i, skillset.clone()));
            } else {
                self.violation(path, "expected exactly one of 'skill' or 'skillset'");
            }
        }

        for (i, raw) in pending_skillsets {
            let path = format!("definitions[{}].skillset", i);
            self.declare_skillset(&raw, &path, i);
        }

        let indexer = match root.get("indexer") {
            Some(raw) => self.indexer(raw),
            None => {
                self.violation("indexer", "required field is missing");
                None
            }
        };

        indexer.map(|indexer| ValidatedConfig {
            definitions: self.definitions.clone(),
            skillsets: self.skillsets.clone(),
            indexer,
        })
    }

    fn declare_skill(&mut self, raw: &Value, path: &str) -> Option<Arc<SkillDefinition>> {
        let def = self.skill(raw, path, false)?;
        if let Some(id) = &def.id {
            if self.skill_ids.contains_key(id) {
                self.violation(format!("{}.id", path), format!("duplicate skill id '{}'", id));
                return None;
            }
            self.skill_ids.insert(id.clone(), def.clone());
        }
        Some(def)
    }

    /// Validate one skill mapping and register it as a definition. With
    /// `share`, a mapping identical to an earlier one reuses that definition;
    /// top-level entries always get their own.
    fn skill(&mut self, raw: &Value, path: &str, share: bool) -> Option<Arc<SkillDefinition>> {
        if share {
            if let Some(pos) = self.raw_definitions.iter().position(|r| r == raw) {
                return Some(self.definitions[pos].clone());
            }
        }

        let Some(obj) = raw.as_object() else {
            self.violation(path, "expected a skill mapping");
            return None;
        };
        let before = self.violations.len();

        for key in obj.keys() {
            if !matches!(key.as_str(), "id" | "type" | "name" | "params") {
                self.violation(format!("{}.{}", path, key), "unknown key");
            }
        }

        let id = match obj.get("id") {
            None => None,
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(_) => {
                self.violation(format!("{}.id", path), "expected a non-empty string");
                None
            }
        };

        let category = match obj.get("type") {
            Some(Value::String(s)) => match SkillCategory::parse(s) {
                Some(c) => Some(c),
                None => {
                    let known: Vec<&str> = SkillCategory::ALL.iter().map(|c| c.as_str()).collect();
                    self.violation(
                        format!("{}.type", path),
                        format!("unknown skill category '{}'; expected one of {}", s, known.join(", ")),
                    );
                    None
                }
            },
            Some(_) => {
                self.violation(format!("{}.type", path), "expected a string");
                None
            }
            None => {
                self.violation(format!("{}.type", path), "required field is missing");
                None
            }
        };

        let name = match obj.get("name") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(_) => {
                self.violation(format!("{}.name", path), "expected a non-empty string");
                None
            }
            None => {
                self.violation(format!("{}.name", path), "required field is missing");
                None
            }
        };

        let empty = Map::new();
        let params = match obj.get("params") {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(m)) => m,
            Some(_) => {
                self.violation(format!("{}.params", path), "expected a mapping");
                return None;
            }
        };

        let category = category?;
        let params_path = format!("{}.params", path);
        let all_fields: Vec<FieldSpec> = params_schema(category)
            .iter()
            .chain(COMMON_FIELDS.iter())
            .copied()
            .collect();
        self.check_object(params, &all_fields, &params_path);
        self.cross_check(category, params, &params_path);

        if self.violations.len() > before {
            return None;
        }
        let name = name?;

        let (typed, common) = self.typed_params(category, params, &params_path)?;
        let def = Arc::new(SkillDefinition {
            index: self.definitions.len(),
            id,
            category,
            name,
            params: typed,
            common,
        });
        self.definitions.push(def.clone());
        self.raw_definitions.push(raw.clone());
        Some(def)
    }

    fn typed_params(
        &mut self,
        category: SkillCategory,
        params: &Map<String, Value>,
        path: &str,
    ) -> Option<(SkillParams, CommonParams)> {
        let mut rest = params.clone();
        let mut common = CommonParams::default();
        if let Some(c) = rest.remove("concurrency").and_then(|v| v.as_u64()) {
            common.concurrency = c as usize;
        }
        if let Some(retry) = rest.remove("retry") {
            common.retry = self.deserialize::<RetryParams>(retry, &format!("{}.retry", path))?;
        }

        let rest = Value::Object(rest);
        let typed = match category {
            SkillCategory::Exporter => SkillParams::Exporter(self.deserialize(rest, path)?),
            SkillCategory::Reader => SkillParams::Reader(self.deserialize(rest, path)?),
            SkillCategory::Splitter => SkillParams::Splitter(self.deserialize(rest, path)?),
            SkillCategory::Embedding => SkillParams::Embedding(self.deserialize(rest, path)?),
            SkillCategory::VectorStore => SkillParams::VectorStore(self.deserialize(rest, path)?),
            SkillCategory::Uploader => SkillParams::Uploader(self.deserialize(rest, path)?),
            SkillCategory::IntegratedPipeline => {
                SkillParams::IntegratedPipeline(self.deserialize(rest, path)?)
            }
            SkillCategory::FileScanner => SkillParams::FileScanner(self.deserialize(rest, path)?),
            SkillCategory::Loader => SkillParams::Loader(self.deserialize(rest, path)?),
            SkillCategory::Anonymizer => SkillParams::Anonymizer(self.deserialize(rest, path)?),
        };
        Some((typed, common))
    }

    fn deserialize<T: DeserializeOwned>(&mut self, value: Value, path: &str) -> Option<T> {
        match serde_json::from_value(value) {
            Ok(t) => Some(t),
            Err(e) => {
                self.violation(path, e.to_string());
                None
            }
        }
    }

    fn cross_check(&mut self, category: SkillCategory, params: &Map<String, Value>, path: &str) {
        match category {
            SkillCategory::Splitter => self.splitter_check(params, path),
            SkillCategory::Anonymizer => {
                if let Some(Value::Array(names)) = params.get("entities") {
                    for (i, name) in names.iter().enumerate() {
                        let Some(name) = name.as_str() else { continue };
                        if EntityKind::parse(name).is_none() {
                            let known: Vec<&str> = EntityKind::ALL.iter().map(|e| e.as_str()).collect();
                            self.violation(
                                format!("{}.entities[{}]", path, i),
                                format!("unknown entity '{}'; expected one of {}", name, known.join(", ")),
                            );
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn splitter_check(&mut self, params: &Map<String, Value>, path: &str) {
        let int = |key: &str| params.get(key).and_then(Value::as_i64);
        let size = int("chunk_size").unwrap_or(1000);
        if let Some(overlap) = int("overlap") {
            if size >= 1 && overlap >= size {
                self.violation(
                    format!("{}.overlap", path),
                    format!("must be smaller than chunk_size ({})", size),
                );
            }
        }
        let lo = int("min_heading_level").unwrap_or(2);
        let hi = int("max_heading_level").unwrap_or(6);
        if lo > hi {
            self.violation(
                format!("{}.min_heading_level", path),
                "must not exceed max_heading_level",
            );
        }
        for key in ["stop_sections", "skip_patterns"] {
            if let Some(Value::Array(patterns)) = params.get(key) {
                for (i, p) in patterns.iter().enumerate() {
                    if let Some(p) = p.as_str() {
                        if let Err(e) = Regex::new(p) {
                            self.violation(format!("{}.{}[{}]", path, key, i), e.to_string());
                        }
                    }
                }
            }
        }
    }

    fn check_object(&mut self, obj: &Map<String, Value>, fields: &[FieldSpec], path: &str) {
        for key in obj.keys() {
            if !fields.iter().any(|f| f.name == key) {
                let known: Vec<&str> = fields.iter().map(|f| f.name).collect();
                self.violation(
                    format!("{}.{}", path, key),
                    format!("unknown parameter; expected one of {}", known.join(", ")),
                );
            }
        }
        for field in fields {
            let field_path = format!("{}.{}", path, field.name);
            match obj.get(field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        self.violation(field_path, "required field is missing");
                    }
                }
                Some(value) => self.check_value(value, field.kind, &field_path),
            }
        }
    }

    fn check_value(&mut self, value: &Value, kind: FieldKind, path: &str) {
        match kind {
            FieldKind::Str => {
                if !value.is_string() {
                    self.violation(path, "expected a string");
                }
            }
            FieldKind::Pattern(pattern, description) => match value.as_str() {
                Some(s) => match self.regex(pattern) {
                    Ok(re) if re.is_match(s) => {}
                    Ok(_) => self.violation(path, format!("'{}' is not {}", s, description)),
                    Err(e) => self.violation(path, format!("bad pattern {}: {}", pattern, e)),
                },
                None => self.violation(path, "expected a string"),
            },
            FieldKind::Int { min } => match value.as_i64() {
                Some(n) if n < min => self.violation(path, format!("must be >= {} (got {})", min, n)),
                Some(_) => {}
                None => self.violation(path, "expected an integer"),
            },
            FieldKind::Bool => {
                if !value.is_boolean() {
                    self.violation(path, "expected a boolean");
                }
            }
            FieldKind::StrList => match value.as_array() {
                Some(items) => {
                    for (i, item) in items.iter().enumerate() {
                        if !item.is_string() {
                            self.violation(format!("{}[{}]", path, i), "expected a string");
                        }
                    }
                }
                None => self.violation(path, "expected a list of strings"),
            },
            FieldKind::OneOf(allowed) => match value.as_str() {
                Some(s) if allowed.contains(&s) => {}
                Some(s) => self.violation(
                    path,
                    format!("'{}' is not one of {}", s, allowed.join(", ")),
                ),
                None => self.violation(path, "expected a string"),
            },
            FieldKind::FieldMapping => match value.as_object() {
                Some(map) => {
                    for (k, v) in map {
                        if LogicalField::parse(k).is_none() {
                            let known: Vec<&str> =
                                LogicalField::ALL.iter().map(|f| f.as_str()).collect();
                            self.violation(
                                format!("{}.{}", path, k),
                                format!("unknown logical field; expected one of {}", known.join(", ")),
                            );
                        }
                        if !v.is_string() {
                            self.violation(format!("{}.{}", path, k), "expected a string");
                        }
                    }
                }
                None => self.violation(path, "expected a mapping"),
            },
            FieldKind::Object(fields) => match value.as_object() {
                Some(map) => self.check_object(map, fields, path),
                None => self.violation(path, "expected a mapping"),
            },
        }
    }

    fn regex(&mut self, pattern: &'static str) -> Result<Regex, regex::Error> {
        if let Some(re) = self.regexes.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(pattern)?;
        self.regexes.insert(pattern, re.clone());
        Ok(re)
    }

    /// Resolve one skillset entry list: ids or inline skill mappings.
    fn skill_list(&mut self, items: &[Value], path: &str) -> Option<Vec<Arc<SkillDefinition>>> {
        if items.is_empty() {
            self.violation(path, "a skillset needs at least one skill");
            return None;
        }
        let mut skills = Vec::with_capacity(items.len());
        let mut ok = true;
        for (i, item) in items.iter().enumerate() {
            let item_path = format!("{}[{}]", path, i);
            match item {
                Value::String(id) => match self.skill_ids.get(id) {
                    Some(def) => skills.push(def.clone()),
                    None => {
                        self.violation(item_path, format!("no skill definition with id '{}'", id));
                        ok = false;
                    }
                },
                Value::Object(_) => match self.skill(item, &item_path, true) {
                    Some(def) => skills.push(def),
                    None => ok = false,
                },
                _ => {
                    self.violation(item_path, "expected a skill id or an inline skill mapping");
                    ok = false;
                }
            }
        }
        ok.then_some(skills)
    }

    fn declare_skillset(&mut self, raw: &Value, path: &str, position: usize) {
        let (id, items, items_path) = match raw {
            Value::Array(items) => (
                format!("skillset-{}", position),
                items.clone(),
                path.to_string(),
            ),
            Value::Object(obj) => {
                for key in obj.keys() {
                    if key != "id" && key != "skills" {
                        self.violation(format!("{}.{}", path, key), "unknown key");
                    }
                }
                let id = match obj.get("id") {
                    Some(Value::String(s)) if !s.is_empty() => s.clone(),
                    _ => {
                        self.violation(format!("{}.id", path), "required non-empty string");
                        return;
                    }
                };
                let items = match obj.get("skills") {
                    Some(Value::Array(items)) => items.clone(),
                    _ => {
                        self.violation(format!("{}.skills", path), "expected a list of skills");
                        return;
                    }
                };
                (id, items, format!("{}.skills", path))
            }
            _ => {
                self.violation(path, "expected a list of skills or {id, skills}");
                return;
            }
        };

        if self.skillset_ids.contains_key(&id) {
            self.violation(format!("{}.id", path), format!("duplicate skillset id '{}'", id));
            return;
        }
        if let Some(skills) = self.skill_list(&items, &items_path) {
            let skillset = Arc::new(Skillset { id: id.clone(), skills });
            self.skillsets.push(skillset.clone());
            self.skillset_ids.insert(id, skillset);
        }
    }

    fn indexer(&mut self, raw: &Value) -> Option<IndexerDecl> {
        let Some(obj) = raw.as_object() else {
            self.violation("indexer", "expected a mapping");
            return None;
        };
        for key in obj.keys() {
            if !matches!(
                key.as_str(),
                "id" | "skillset" | "tracker" | "channel_capacity" | "grace_period_ms"
            ) {
                self.violation(format!("indexer.{}", key), "unknown key");
            }
        }

        let id = match obj.get("id") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(_) => {
                self.violation("indexer.id", "expected a non-empty string");
                None
            }
            None => {
                self.violation("indexer.id", "required field is missing");
                None
            }
        };

        let skillsets = match obj.get("skillset") {
            None => {
                self.violation("indexer.skillset", "required field is missing");
                None
            }
            Some(raw) => self.indexer_skillsets(raw, id.as_deref().unwrap_or("indexer")),
        };

        let tracker = match obj.get("tracker") {
            None | Some(Value::Null) => None,
            Some(raw) => self.tracker(raw),
        };

        let mut channel_capacity = DEFAULT_CHANNEL_CAPACITY;
        if let Some(v) = obj.get("channel_capacity") {
            self.check_value(v, FieldKind::Int { min: 1 }, "indexer.channel_capacity");
            channel_capacity = v.as_u64().map(|n| n as usize).unwrap_or(channel_capacity);
        }
        let mut grace_ms = DEFAULT_GRACE_PERIOD_MS;
        if let Some(v) = obj.get("grace_period_ms") {
            self.check_value(v, FieldKind::Int { min: 0 }, "indexer.grace_period_ms");
            grace_ms = v.as_u64().unwrap_or(grace_ms);
        }

        Some(IndexerDecl {
            id: id?,
            skillsets: skillsets?,
            tracker,
            channel_capacity,
            grace_period: Duration::from_millis(grace_ms),
        })
    }

    /// `indexer.skillset` is a skillset id, a list of skillset ids, or an
    /// inline list of skills (what an expanded YAML alias looks like).
    fn indexer_skillsets(&mut self, raw: &Value, indexer_id: &str) -> Option<Vec<Arc<Skillset>>> {
        let path = "indexer.skillset";
        match raw {
            Value::String(id) => match self.skillset_ids.get(id) {
                Some(s) => Some(vec![s.clone()]),
                None => {
                    self.violation(path, format!("no skillset with id '{}'", id));
                    None
                }
            },
            Value::Array(items)
                if !items.is_empty()
                    && items
                        .iter()
                        .all(|i| i.as_str().is_some_and(|s| self.skillset_ids.contains_key(s))) =>
            {
                Some(
                    items
                        .iter()
                        .filter_map(|i| i.as_str())
                        .filter_map(|s| self.skillset_ids.get(s).cloned())
                        .collect(),
                )
            }
            Value::Array(items) => {
                let skills = self.skill_list(items, path)?;
                if let Some(existing) = self.skillsets.iter().find(|s| s.skills == skills) {
                    return Some(vec![existing.clone()]);
                }
                let skillset = Arc::new(Skillset {
                    id: indexer_id.to_string(),
                    skills,
                });
                self.skillsets.push(skillset.clone());
                Some(vec![skillset])
            }
            Value::Object(obj) => {
                let id = obj
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or(indexer_id)
                    .to_string();
                match obj.get("skills") {
                    Some(Value::Array(items)) => {
                        let skills = self.skill_list(items, &format!("{}.skills", path))?;
                        let skillset = Arc::new(Skillset { id, skills });
                        self.skillsets.push(skillset.clone());
                        Some(vec![skillset])
                    }
                    _ => {
                        self.violation(format!("{}.skills", path), "expected a list of skills");
                        None
                    }
                }
            }
            _ => {
                self.violation(path, "expected a skillset id, a list of ids, or a list of skills");
                None
            }
        }
    }

    fn tracker(&mut self, raw: &Value) -> Option<TrackerDecl> {
        let Some(obj) = raw.as_object() else {
            self.violation("indexer.tracker", "expected a mapping");
            return None;
        };
        let before = self.violations.len();
        self.check_object(obj, TRACKER_FIELDS, "indexer.tracker");
        if self.violations.len() > before {
            return None;
        }

        let params = obj.get("params")?;
        let flag = |key: &str| params.get(key).and_then(Value::as_bool).unwrap_or(false);
        Some(TrackerDecl {
            connection_string: params
                .get("database")
                .and_then(|d| d.get("connection_string"))
                .and_then(Value::as_str)?
                .to_string(),
            tolerate_unavailable: flag("tolerate_unavailable"),
            purge_stale: flag("purge_stale"),
        })
    }
}

/// Field names accepted for a category, for help output.
pub fn known_params(category: SkillCategory) -> BTreeMap<&'static str, bool> {
    params_schema(category)
        .iter()
        .chain(COMMON_FIELDS.iter())
        .map(|f| (f.name, f.required))
        .collect()
}
