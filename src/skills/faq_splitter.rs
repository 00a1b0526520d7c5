//! FAQ splitter for markdown pages.
//!
//! Walks the page as a sequence of headings and paragraphs. A heading whose
//! level lies in `[min_heading_level, max_heading_level]` and that either
//! contains `?` or starts with one of the question prefixes opens a Q&A
//! pair; everything up to the next question, stop section, or end of page
//! is its answer. Each pair becomes one chunk:
//!
//! ```text
//! Q: <heading>
//!
//! A: <answer>
//!
//! References (hyperlinks from the answer):
//! - <link text>: <url>
//! ```
//!
//! Table-of-contents blocks and regions under `skip_headings` (such as a
//! summary) never open pairs. Answer paragraphs matching one of
//! `skip_patterns` (boilerplate banners) are dropped.

use anyhow::{bail, Result};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};

use super::{Contract, Shape, SkillKind, Transform};
use crate::config::{SkillDefinition, SkillParams, SplitterParams};
use crate::error::StageError;
use crate::models::{Chunk, Item};

const DEFAULT_QUESTION_PATTERNS: [&str; 16] = [
    "i am ", "i cannot ", "i can't ", "i see ", "i have ", "i need ", "my ", "when i ",
    "how do i ", "how can i ", "what is ", "what are ", "why does ", "why is ", "where is ",
    "where can ",
];
const DEFAULT_SKIP_HEADINGS: [&str; 1] = ["summary"];
const DEFAULT_STOP_SECTIONS: [&str; 3] = [
    r"^\s*related\s*articles?\s*$",
    r"^\s*related\s*resources?\s*$",
    r"^\s*see\s*also\s*$",
];
/// Boilerplate banners dropped from answers when `skip_patterns` is unset.
const DEFAULT_SKIP_PATTERNS: [&str; 3] = [
    r"^\s*confidential\s*$",
    r"^\s*search the faq\s*$",
    r"^\s*search artifactory faq\s*$",
];
const TOC_TITLES: [&str; 2] = ["table of contents", "contents"];

#[derive(Debug, Clone, PartialEq)]
enum Block {
    Heading { level: u8, text: String },
    Paragraph(String),
}

impl Block {
    fn text(&self) -> &str {
        match self {
            Block::Heading { text, .. } | Block::Paragraph(text) => text,
        }
    }

    fn level(&self) -> Option<u8> {
        match self {
            Block::Heading { level, .. } => Some(*level),
            Block::Paragraph(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Link {
    text: String,
    url: String,
}

#[derive(Debug, Default)]
struct Pair {
    question: String,
    answer: Vec<String>,
    links: Vec<Link>,
}

pub struct FaqSplitter {
    min_level: u8,
    max_level: u8,
    question_patterns: Vec<String>,
    skip_headings: Vec<String>,
    stop_sections: Vec<Regex>,
    skip_patterns: Vec<Regex>,
    heading: Regex,
    link: Regex,
    bare_link: Regex,
}

pub fn build(def: &SkillDefinition) -> Result<SkillKind> {
    let SkillParams::Splitter(params) = &def.params else {
        bail!("expected splitter params");
    };
    Ok(SkillKind::transform(FaqSplitter::new(params)?))
}

fn lowered(list: &Option<Vec<String>>, defaults: &[&str]) -> Vec<String> {
    match list {
        Some(items) => items.iter().map(|s| s.to_lowercase()).collect(),
        None => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

/// Compile `list` (or `defaults`) case-insensitively.
fn patterns(list: &Option<Vec<String>>, defaults: &[&str]) -> Result<Vec<Regex>> {
    let sources: Vec<&str> = match list {
        Some(items) => items.iter().map(String::as_str).collect(),
        None => defaults.to_vec(),
    };
    Ok(sources
        .into_iter()
        .map(|p| RegexBuilder::new(p).case_insensitive(true).build())
        .collect::<Result<Vec<_>, _>>()?)
}

/// Replace non-breaking spaces and collapse runs of whitespace.
fn norm(s: &str) -> String {
    s.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl FaqSplitter {
    pub fn new(params: &SplitterParams) -> Result<Self> {
        if params.min_heading_level < 1 || params.max_heading_level > 6 {
            bail!("heading levels must lie between 1 and 6");
        }
        if params.min_heading_level > params.max_heading_level {
            bail!(
                "min_heading_level ({}) exceeds max_heading_level ({})",
                params.min_heading_level,
                params.max_heading_level
            );
        }

        Ok(Self {
            min_level: params.min_heading_level,
            max_level: params.max_heading_level,
            question_patterns: lowered(&params.question_patterns, &DEFAULT_QUESTION_PATTERNS),
            skip_headings: lowered(&params.skip_headings, &DEFAULT_SKIP_HEADINGS),
            stop_sections: patterns(&params.stop_sections, &DEFAULT_STOP_SECTIONS)?,
            skip_patterns: patterns(&params.skip_patterns, &DEFAULT_SKIP_PATTERNS)?,
            heading: Regex::new(r"^(#{1,6})\s+(.*?)\s*#*\s*$")?,
            link: Regex::new(r#"(!?)\[([^\]]*)\]\(([^)\s]+)(?:\s+"[^"]*")?\)"#)?,
            bare_link: Regex::new(r"\[Link\]\([^)]+\)")?,
        })
    }

    /// Split markdown into headings and blank-line separated paragraphs.
    /// Lines inside fenced code blocks are never headings.
    fn blocks(&self, markdown: &str) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut para: Vec<&str> = Vec::new();
        let mut in_fence = false;

        let flush = |para: &mut Vec<&str>, blocks: &mut Vec<Block>| {
            if !para.is_empty() {
                blocks.push(Block::Paragraph(para.join("\n")));
                para.clear();
            }
        };

        for line in markdown.lines() {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                para.push(line);
                continue;
            }
            if in_fence {
                para.push(line);
                continue;
            }
            if line.trim().is_empty() {
                flush(&mut para, &mut blocks);
                continue;
            }
            if let Some(caps) = self.heading.captures(line.trim_start()) {
                flush(&mut para, &mut blocks);
                let level = caps.get(1).map(|m| m.as_str().len()).unwrap_or(1) as u8;
                let text = caps.get(2).map(|m| m.as_str()).unwrap_or("").to_string();
                blocks.push(Block::Heading { level, text });
                continue;
            }
            para.push(line);
        }
        flush(&mut para, &mut blocks);
        blocks
    }

    fn is_question(&self, block: &Block) -> bool {
        let Some(level) = block.level() else {
            return false;
        };
        let t = norm(block.text());
        if t.is_empty() || self.skip_headings.contains(&t.to_lowercase()) {
            return false;
        }
        if level < self.min_level || level > self.max_level {
            return false;
        }
        if t.contains('?') {
            return true;
        }
        let lower = t.to_lowercase();
        self.question_patterns.iter().any(|p| lower.starts_with(p.as_str()))
    }

    fn is_stop(&self, block: &Block) -> bool {
        let t = norm(block.text());
        self.stop_sections.iter().any(|re| re.is_match(&t))
    }

    /// Links with descriptive text, plus the block text with link markup
    /// reduced to its label. Images and bare `[Link](…)` markers are dropped.
    fn links_and_text(&self, text: &str) -> (Vec<Link>, String) {
        let mut links = Vec::new();
        for caps in self.link.captures_iter(text) {
            let is_image = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
            let label = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            let url = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            if is_image || label.is_empty() || label == "Link" || url.starts_with("#scroll-bookmark") {
                continue;
            }
            links.push(Link {
                text: label.to_string(),
                url: url.to_string(),
            });
        }

        let cleaned = self.bare_link.replace_all(text, "");
        let cleaned = self.link.replace_all(&cleaned, |caps: &regex::Captures| {
            if caps.get(1).is_some_and(|m| !m.as_str().is_empty()) {
                String::new()
            } else {
                caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default()
            }
        });
        (links, cleaned.trim().to_string())
    }

    fn extract_pairs(&self, markdown: &str) -> Vec<Pair> {
        let mut pairs = Vec::new();
        let mut current: Option<Pair> = None;
        let mut in_toc = false;
        let mut in_skipped = false;

        for block in self.blocks(markdown) {
            let text = norm(block.text());
            let title = text.to_lowercase();
            let level = block.level();

            if TOC_TITLES.contains(&title.as_str()) {
                in_toc = true;
                pairs.extend(current.take());
                continue;
            }
            if in_toc {
                match level {
                    Some(l) if l <= 2 => in_toc = false,
                    _ => continue,
                }
            }

            if level.is_some() && self.skip_headings.contains(&title) {
                in_skipped = true;
                continue;
            }
            if in_skipped && level.is_some() {
                in_skipped = false;
            }

            if current.is_some() && self.is_stop(&block) {
                pairs.extend(current.take());
                continue;
            }

            if !in_skipped && self.is_question(&block) {
                pairs.extend(current.take());
                current = Some(Pair {
                    question: text,
                    ..Pair::default()
                });
                continue;
            }

            if let Some(pair) = current.as_mut() {
                if text.is_empty() || self.skip_patterns.iter().any(|p| p.is_match(&text)) {
                    continue;
                }
                let (links, cleaned) = self.links_and_text(block.text());
                if !cleaned.is_empty() {
                    pair.answer.push(cleaned);
                }
                pair.links.extend(links);
            }
        }
        pairs.extend(current);
        pairs
    }

    /// One formatted chunk text per pair with both a question and an answer.
    pub fn split_text(&self, markdown: &str) -> Vec<String> {
        self.extract_pairs(markdown)
            .into_iter()
            .filter_map(|pair| {
                let answer = pair.answer.join("\n");
                let answer = answer.trim();
                if pair.question.trim().is_empty() || answer.is_empty() {
                    return None;
                }
                let references: Vec<String> = pair
                    .links
                    .iter()
                    .filter(|l| !is_link_text_redundant(&l.text, &l.url))
                    .map(|l| format!("- {}: {}", l.text, l.url))
                    .collect();
                let mut text = format!("Q: {}\n\nA: {}", pair.question, answer);
                if !references.is_empty() {
                    text.push_str("\n\nReferences (hyperlinks from the answer):\n");
                    text.push_str(&references.join("\n"));
                }
                Some(text)
            })
            .collect()
    }
}

/// True when the link label merely repeats its URL.
fn is_link_text_redundant(text: &str, url: &str) -> bool {
    const TRAILING: &[char] = &[')', '.', ',', ';', ':', ' '];
    let text = text.trim().to_lowercase();
    let url = url.trim().to_lowercase();
    let text = text.trim_end_matches(TRAILING);
    let url = url.trim_end_matches(TRAILING);

    let strip_scheme = |s: &str| -> String {
        s.strip_prefix("https://")
            .or_else(|| s.strip_prefix("http://"))
            .unwrap_or(s)
            .to_string()
    };
    let url_bare = strip_scheme(url);
    let url_no_www = url_bare.strip_prefix("www.").unwrap_or(&url_bare);

    text == url || strip_scheme(text) == url_bare || text == url_no_www
}

#[async_trait]
impl Transform for FaqSplitter {
    fn contract(&self) -> Contract {
        Contract::transform(&[Shape::Document], Shape::Chunk)
    }

    async fn apply(&self, item: Item) -> Result<Vec<Item>, StageError> {
        let doc = match item {
            Item::Document(doc) => doc,
            other => {
                return Err(StageError::permanent(format!(
                    "faq splitter cannot split a {}",
                    other.kind()
                )))
            }
        };
        let pairs = self.split_text(&doc.raw_content);
        tracing::debug!(document = %doc.id, pairs = pairs.len(), "extracted Q&A pairs");
        Ok(pairs
            .into_iter()
            .enumerate()
            .map(|(position, text)| Item::Chunk(Chunk::from_document(&doc, position, text)))
            .collect())
    }
}
