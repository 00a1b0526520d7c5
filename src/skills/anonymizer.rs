//! PII anonymizer for whole documents.
//!
//! Recognizers are regular expressions, some backed by a checksum:
//!
//! | Entity | Match | Check |
//! |--------|-------|-------|
//! | `EMAIL_ADDRESS` | `local@domain.tld` | |
//! | `CREDIT_CARD` | 13 to 19 digits, spaces or dashes allowed | Luhn |
//! | `IBAN_CODE` | country code, check digits, 11 to 30 alphanumerics | mod 97 |
//! | `IP_ADDRESS` | dotted IPv4 | |
//! | `PHONE_NUMBER` | digit groups, optional `+` country code | 9 to 15 digits |
//!
//! When two matches overlap the earlier, then the longer one wins. With
//! `use_placeholders` a match becomes `<ENTITY_TYPE>`; otherwise its
//! letters and digits are masked with `*` and separators are kept.

use anyhow::{bail, Result};
use async_trait::async_trait;
use regex::Regex;

use super::{Contract, Shape, SkillKind, Transform};
use crate::config::{AnonymizerParams, SkillDefinition, SkillParams};
use crate::error::StageError;
use crate::models::Item;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    CreditCard,
    IbanCode,
    EmailAddress,
    IpAddress,
    PhoneNumber,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::CreditCard,
        EntityKind::IbanCode,
        EntityKind::EmailAddress,
        EntityKind::IpAddress,
        EntityKind::PhoneNumber,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::CreditCard => "CREDIT_CARD",
            EntityKind::IbanCode => "IBAN_CODE",
            EntityKind::EmailAddress => "EMAIL_ADDRESS",
            EntityKind::IpAddress => "IP_ADDRESS",
            EntityKind::PhoneNumber => "PHONE_NUMBER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == s)
    }

    fn pattern(&self) -> &'static str {
        match self {
            EntityKind::CreditCard => r"\b\d(?:[ -]?\d){12,18}\b",
            EntityKind::IbanCode => r"\b[A-Z]{2}\d{2}(?: ?[A-Z0-9]){11,30}\b",
            EntityKind::EmailAddress => r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            EntityKind::IpAddress => {
                r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b"
            }
            EntityKind::PhoneNumber => {
                r"(?:\+\d{1,3}[ .-]?)?(?:\(\d{1,4}\)[ .-]?)?\b\d{2,4}(?:[ .-]\d{2,5}){1,4}\b"
            }
        }
    }

    fn accepts(&self, text: &str) -> bool {
        match self {
            EntityKind::CreditCard => luhn_valid(text),
            EntityKind::IbanCode => iban_valid(text),
            EntityKind::PhoneNumber => {
                let digits = text.chars().filter(char::is_ascii_digit).count();
                (9..=15).contains(&digits)
            }
            EntityKind::EmailAddress | EntityKind::IpAddress => true,
        }
    }
}

fn luhn_valid(text: &str) -> bool {
    let digits: Vec<u32> = text.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| match (i % 2 == 1, d * 2) {
            (true, doubled) if doubled > 9 => doubled - 9,
            (true, doubled) => doubled,
            (false, _) => d,
        })
        .sum();
    sum % 10 == 0
}

fn iban_valid(text: &str) -> bool {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 15 || compact.len() > 34 {
        return false;
    }
    let (head, tail) = compact.split_at(4);
    let mut remainder = 0u32;
    for c in tail.chars().chain(head.chars()) {
        let Some(value) = c.to_digit(36) else {
            return false;
        };
        remainder = if value >= 10 {
            (remainder * 100 + value) % 97
        } else {
            (remainder * 10 + value) % 97
        };
    }
    remainder == 1
}

struct Recognizer {
    kind: EntityKind,
    regex: Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
    kind: EntityKind,
}

pub struct Anonymizer {
    recognizers: Vec<Recognizer>,
    use_placeholders: bool,
}

pub fn build(def: &SkillDefinition) -> Result<SkillKind> {
    let SkillParams::Anonymizer(params) = &def.params else {
        bail!("expected anonymizer params");
    };
    Ok(SkillKind::transform(Anonymizer::new(params)?))
}

impl Anonymizer {
    pub fn new(params: &AnonymizerParams) -> Result<Self> {
        let kinds = match &params.entities {
            None => EntityKind::ALL.to_vec(),
            Some(names) => {
                let mut kinds = Vec::with_capacity(names.len());
                for name in names {
                    match EntityKind::parse(name) {
                        Some(kind) => kinds.push(kind),
                        None => bail!("unknown entity type '{}'", name),
                    }
                }
                kinds
            }
        };
        let recognizers = kinds
            .into_iter()
            .map(|kind| {
                Ok(Recognizer {
                    kind,
                    regex: Regex::new(kind.pattern())?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            recognizers,
            use_placeholders: params.use_placeholders,
        })
    }

    fn spans(&self, text: &str) -> Vec<Span> {
        let mut found: Vec<Span> = self
            .recognizers
            .iter()
            .flat_map(|r| {
                r.regex
                    .find_iter(text)
                    .filter(|m| r.kind.accepts(m.as_str()))
                    .map(|m| Span {
                        start: m.start(),
                        end: m.end(),
                        kind: r.kind,
                    })
            })
            .collect();
        found.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then((b.end - b.start).cmp(&(a.end - a.start)))
                .then(a.kind.cmp(&b.kind))
        });

        let mut kept: Vec<Span> = Vec::with_capacity(found.len());
        for span in found {
            if kept.last().map_or(true, |last| span.start >= last.end) {
                kept.push(span);
            }
        }
        kept
    }

    /// Anonymized text and the number of replaced entities.
    pub fn anonymize(&self, text: &str) -> (String, usize) {
        let spans = self.spans(text);
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for span in &spans {
            out.push_str(&text[cursor..span.start]);
            let matched = &text[span.start..span.end];
            if self.use_placeholders {
                out.push('<');
                out.push_str(span.kind.as_str());
                out.push('>');
            } else {
                out.extend(
                    matched
                        .chars()
                        .map(|c| if c.is_alphanumeric() { '*' } else { c }),
                );
            }
            cursor = span.end;
        }
        out.push_str(&text[cursor..]);
        (out, spans.len())
    }
}

#[async_trait]
impl Transform for Anonymizer {
    fn contract(&self) -> Contract {
        Contract::transform(&[Shape::Document], Shape::Document)
    }

    async fn apply(&self, item: Item) -> Result<Vec<Item>, StageError> {
        let mut doc = match item {
            Item::Document(doc) => doc,
            other => {
                return Err(StageError::permanent(format!(
                    "anonymizer cannot process a {}",
                    other.kind()
                )))
            }
        };
        let (content, replaced) = self.anonymize(&doc.raw_content);
        if replaced > 0 {
            tracing::debug!(document = %doc.id, entities = replaced, "anonymized document");
            doc.raw_content = content;
        }
        Ok(vec![Item::Document(
            doc.with_metadata("anonymized_entities", replaced.to_string()),
        )])
    }
}
