use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{Contract, Emitter, Shape, SkillKind, Source};
use crate::config::{FileScannerParams, SkillDefinition, SkillParams};
use crate::error::StageError;
use crate::models::{FileRef, Item};

const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Walks a directory and emits a [`FileRef`] per matching file, in path
/// order.
pub struct FileScanner {
    root: PathBuf,
    recursive: bool,
    follow_symlinks: bool,
    include: GlobSet,
    exclude: GlobSet,
}

pub fn build(def: &SkillDefinition) -> Result<SkillKind> {
    let SkillParams::FileScanner(params) = &def.params else {
        bail!("expected file-scanner params");
    };
    Ok(SkillKind::source(FileScanner::new(params)?))
}

impl FileScanner {
    pub fn new(params: &FileScannerParams) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(params.exclude.iter().cloned());
        Ok(Self {
            root: params.path.clone(),
            recursive: params.recursive,
            follow_symlinks: params.follow_symlinks,
            include: build_globset(&params.filter)?,
            exclude: build_globset(&excludes)?,
        })
    }

    fn scan(&self) -> Result<Vec<FileRef>, StageError> {
        if !self.root.is_dir() {
            return Err(StageError::fatal(format!(
                "scan root does not exist or is not a directory: {}",
                self.root.display()
            )));
        }

        let mut walker = WalkDir::new(&self.root).follow_links(self.follow_symlinks);
        if !self.recursive {
            walker = walker.max_depth(1);
        }

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(root = %self.root.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            files.push(file_ref(path, rel_str));
        }

        files.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(files)
    }
}

fn file_ref(path: &Path, id: String) -> FileRef {
    let metadata = std::fs::metadata(path).ok();
    let modified = metadata
        .as_ref()
        .and_then(|m| m.modified().ok())
        .map(DateTime::<Utc>::from)
        .unwrap_or_default();
    FileRef {
        id,
        path: path.to_path_buf(),
        size: metadata.map(|m| m.len()).unwrap_or(0),
        modified,
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[async_trait]
impl Source for FileScanner {
    fn contract(&self) -> Contract {
        Contract::source(Shape::FileRef)
    }

    async fn produce(&self, out: &Emitter) -> Result<(), StageError> {
        let files = self.scan()?;
        tracing::debug!(root = %self.root.display(), files = files.len(), "scan complete");
        for file in files {
            if !out.emit(Item::File(file)).await {
                break;
            }
        }
        Ok(())
    }
}
