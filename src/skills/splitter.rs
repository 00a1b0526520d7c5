//! Recursive character splitter.
//!
//! Splits document content into chunks of at most `chunk_size` characters,
//! preferring paragraph boundaries (`\n\n`), then line breaks, then spaces,
//! and only then arbitrary character positions. Up to `overlap` characters
//! from the end of one chunk are repeated at the start of the next.
//!
//! Sizes are counted in `char`s, never bytes, so multi-byte text is never
//! split inside a code point.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;

use super::{Contract, Shape, SkillKind, Transform};
use crate::config::{SkillDefinition, SkillParams, SplitterParams};
use crate::error::StageError;
use crate::models::{Chunk, Item};

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

pub struct RecursiveCharacterSplitter {
    chunk_size: usize,
    overlap: usize,
}

pub fn build(def: &SkillDefinition) -> Result<SkillKind> {
    let SkillParams::Splitter(params) = &def.params else {
        bail!("expected splitter params");
    };
    Ok(SkillKind::transform(RecursiveCharacterSplitter::new(params)?))
}

impl RecursiveCharacterSplitter {
    pub fn new(params: &SplitterParams) -> Result<Self> {
        if params.chunk_size == 0 {
            bail!("chunk_size must be at least 1");
        }
        if params.overlap >= params.chunk_size {
            bail!(
                "overlap ({}) must be smaller than chunk_size ({})",
                params.overlap,
                params.chunk_size
            );
        }
        Ok(Self {
            chunk_size: params.chunk_size,
            overlap: params.overlap,
        })
    }

    /// Split `text` into trimmed, non-empty pieces.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        split_recursive(text, &SEPARATORS, self.chunk_size, self.overlap)
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn split_recursive(text: &str, separators: &[&str], size: usize, overlap: usize) -> Vec<String> {
    // The empty separator always matches, so this always finds one.
    let pick = separators
        .iter()
        .position(|sep| sep.is_empty() || text.contains(sep))
        .unwrap_or(separators.len().saturating_sub(1));
    let sep = separators.get(pick).copied().unwrap_or("");
    let rest = separators.get(pick + 1..).unwrap_or(&[]);

    let pieces: Vec<String> = if sep.is_empty() {
        text.chars().map(String::from).collect()
    } else {
        text.split(sep)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };

    let mut out = Vec::new();
    let mut fitting: Vec<String> = Vec::new();
    for piece in pieces {
        if char_len(&piece) <= size {
            fitting.push(piece);
            continue;
        }
        if !fitting.is_empty() {
            out.extend(merge(std::mem::take(&mut fitting), sep, size, overlap));
        }
        if rest.is_empty() {
            out.push(piece);
        } else {
            out.extend(split_recursive(&piece, rest, size, overlap));
        }
    }
    if !fitting.is_empty() {
        out.extend(merge(fitting, sep, size, overlap));
    }
    out
}

/// Greedily join `pieces` with `sep` into chunks of at most `size` chars,
/// carrying up to `overlap` chars of trailing pieces into the next chunk.
fn merge(pieces: Vec<String>, sep: &str, size: usize, overlap: usize) -> Vec<String> {
    let sep_len = char_len(sep);
    let mut chunks = Vec::new();
    let mut current: VecDeque<(String, usize)> = VecDeque::new();
    let mut total = 0usize;

    for piece in pieces {
        let len = char_len(&piece);
        let joined = if current.is_empty() { 0 } else { sep_len };

        if total + len + joined > size && !current.is_empty() {
            chunks.push(join(&current, sep));
            while total > overlap || (total > 0 && total + len + sep_len > size) {
                let Some((_, first_len)) = current.pop_front() else {
                    break;
                };
                total -= first_len + if current.is_empty() { 0 } else { sep_len };
            }
        }

        total += len + if current.is_empty() { 0 } else { sep_len };
        current.push_back((piece, len));
    }

    if !current.is_empty() {
        chunks.push(join(&current, sep));
    }
    chunks
}

fn join(pieces: &VecDeque<(String, usize)>, sep: &str) -> String {
    pieces
        .iter()
        .map(|(p, _)| p.as_str())
        .collect::<Vec<_>>()
        .join(sep)
}

#[async_trait]
impl Transform for RecursiveCharacterSplitter {
    fn contract(&self) -> Contract {
        Contract::transform(&[Shape::Document], Shape::Chunk)
    }

    async fn apply(&self, item: Item) -> Result<Vec<Item>, StageError> {
        let doc = match item {
            Item::Document(doc) => doc,
            other => {
                return Err(StageError::permanent(format!(
                    "splitter cannot split a {}",
                    other.kind()
                )))
            }
        };
        Ok(self
            .split_text(&doc.raw_content)
            .into_iter()
            .enumerate()
            .map(|(position, text)| Item::Chunk(Chunk::from_document(&doc, position, text)))
            .collect())
    }
}
