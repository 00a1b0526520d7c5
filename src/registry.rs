//! Skill registry.
//!
//! Maps `(category, name)` to a factory that builds a skill from its
//! validated definition. Built-in skills are registered by
//! [`SkillRegistry::with_builtins`]; applications add their own with
//! [`SkillRegistry::register`] before assembly.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │               SkillRegistry                │
//! │  ┌──────────────┐      ┌────────────────┐  │
//! │  │  Built-in    │      │    Custom      │  │
//! │  │ scanner/web/ │      │   (Rust)       │  │
//! │  │ splitter/... │      │  factories     │  │
//! │  └──────────────┘      └────────────────┘  │
//! └──────────────────┬─────────────────────────┘
//!                    ▼
//!           assemble() → Pipeline → Engine
//! ```
//!
//! Lookup is exact and case-sensitive. Registering a key twice replaces
//! the earlier factory.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{SkillCategory, SkillDefinition};
use crate::error::{IndexerError, Result};
use crate::skills::{
    anonymizer, embedding, faq_splitter, file_reader, file_scanner, json_writer, qna_loader, splitter,
    sqlite_store, web_exporter, SkillKind,
};

/// Builds a skill from its definition. Errors become
/// [`IndexerError::SkillConstruction`].
pub type SkillFactory =
    Arc<dyn Fn(&SkillDefinition) -> anyhow::Result<SkillKind> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SkillKey {
    pub category: SkillCategory,
    pub name: String,
}

impl SkillKey {
    pub fn new(category: SkillCategory, name: impl Into<String>) -> Self {
        Self {
            category,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for SkillKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.category, self.name)
    }
}

#[derive(Default, Clone)]
pub struct SkillRegistry {
    factories: BTreeMap<SkillKey, SkillFactory>,
}

impl SkillRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in skill.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register(SkillCategory::FileScanner, "file-scanner", file_scanner::build);
        r.register(SkillCategory::Reader, "file-reader", file_reader::build);
        r.register(SkillCategory::Loader, "qna-json", qna_loader::build);
        r.register(SkillCategory::Exporter, "web", web_exporter::build);
        r.register(SkillCategory::Splitter, "recursive-character", splitter::build);
        r.register(SkillCategory::Splitter, "faq", faq_splitter::build);
        r.register(SkillCategory::Embedding, "openai", embedding::build_openai);
        r.register(SkillCategory::Embedding, "azure-openai", embedding::build_azure_openai);
        r.register(SkillCategory::Embedding, "ollama", embedding::build_ollama);
        r.register(SkillCategory::VectorStore, "sqlite", sqlite_store::build);
        r.register(SkillCategory::Uploader, "json-writer", json_writer::build);
        r.register(SkillCategory::Anonymizer, "regex", anonymizer::build);
        r
    }

    /// Register a factory, replacing any existing one for the same key.
    pub fn register<F>(&mut self, category: SkillCategory, name: &str, factory: F)
    where
        F: Fn(&SkillDefinition) -> anyhow::Result<SkillKind> + Send + Sync + 'static,
    {
        let key = SkillKey::new(category, name);
        if self.factories.insert(key.clone(), Arc::new(factory)).is_some() {
            tracing::debug!(skill = %key, "replaced registered skill");
        }
    }

    pub fn resolve(&self, category: SkillCategory, name: &str) -> Result<SkillFactory> {
        self.factories
            .get(&SkillKey::new(category, name))
            .cloned()
            .ok_or_else(|| IndexerError::UnknownSkill {
                category: category.to_string(),
                name: name.to_string(),
            })
    }

    /// Build the skill for `def`.
    pub fn build(&self, def: &SkillDefinition) -> Result<SkillKind> {
        let factory = self.resolve(def.category, &def.name)?;
        factory(def).map_err(|e| IndexerError::SkillConstruction {
            skill: def.label(),
            message: format!("{:#}", e),
        })
    }

    /// Registered keys in sorted order.
    pub fn keys(&self) -> Vec<SkillKey> {
        self.factories.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommonParams, ReaderParams, SkillParams};

    fn reader_def(name: &str) -> SkillDefinition {
        SkillDefinition {
            index: 0,
            id: None,
            category: SkillCategory::Reader,
            name: name.to_string(),
            params: SkillParams::Reader(ReaderParams::default()),
            common: CommonParams::default(),
        }
    }

    #[test]
    fn builtins_are_registered() {
        let r = SkillRegistry::with_builtins();
        assert_eq!(r.len(), 12);
        assert!(r.resolve(SkillCategory::Splitter, "faq").is_ok());
        assert!(r.resolve(SkillCategory::Embedding, "ollama").is_ok());
        assert!(r.resolve(SkillCategory::Embedding, "azure-openai").is_ok());
        assert!(r.resolve(SkillCategory::Anonymizer, "regex").is_ok());
        assert!(r.build(&reader_def("file-reader")).is_ok());
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let r = SkillRegistry::with_builtins();
        let err = r.resolve(SkillCategory::Reader, "File-Reader").err().unwrap();
        assert!(matches!(err, IndexerError::UnknownSkill { .. }));
        assert!(err.to_string().contains("File-Reader"));
    }

    #[test]
    fn construction_errors_name_the_skill() {
        let mut r = SkillRegistry::new();
        r.register(SkillCategory::Reader, "broken", |_| {
            Err(anyhow::anyhow!("cannot open handle"))
        });
        match r.build(&reader_def("broken")) {
            Err(IndexerError::SkillConstruction { skill, message }) => {
                assert_eq!(skill, "reader/broken");
                assert!(message.contains("cannot open handle"));
            }
            other => panic!("unexpected: {:?}", other.map(|k| k.role())),
        }
    }

    #[test]
    fn later_registration_overrides() {
        let mut r = SkillRegistry::with_builtins();
        r.register(SkillCategory::Reader, "file-reader", |_| {
            Err(anyhow::anyhow!("overridden"))
        });
        assert_eq!(r.len(), 12);
        assert!(r.build(&reader_def("file-reader")).is_err());
    }
}
