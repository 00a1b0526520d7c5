//! Web page exporter.
//!
//! Fetches `url` and, with `scope: descendants`, every `pages` entry
//! resolved against it. Each page that loads becomes one [`Document`] keyed
//! by its absolute URL; HTML bodies are parsed and reduced to text and
//! their `<title>` kept as metadata. A page that cannot be fetched after
//! the stage's retries is reported as a failure for that page alone. A site
//! that refuses the first connection fails the run.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use scraper::{ElementRef, Html, Node, Selector};
use std::time::Duration;

use super::{Contract, Emitter, Reachability, Shape, SkillKind, Source};
use crate::config::{ExportScope, ExporterParams, SkillDefinition, SkillParams};
use crate::error::StageError;
use crate::models::{Document, Item};

pub struct WebExporter {
    client: reqwest::Client,
    pages: Vec<Url>,
    auth_token: Option<String>,
    tag: Option<String>,
    html: HtmlText,
    reach: Reachability,
}

pub fn build(def: &SkillDefinition) -> Result<SkillKind> {
    let SkillParams::Exporter(params) = &def.params else {
        bail!("expected exporter params");
    };
    Ok(SkillKind::source(WebExporter::new(params)?))
}

impl WebExporter {
    pub fn new(params: &ExporterParams) -> Result<Self> {
        let root = Url::parse(&params.url).with_context(|| format!("invalid url '{}'", params.url))?;
        let mut pages = vec![root.clone()];
        if params.scope == ExportScope::Descendants {
            for page in &params.pages {
                let resolved = root
                    .join(page)
                    .with_context(|| format!("cannot resolve page '{}' against {}", page, root))?;
                if !pages.contains(&resolved) {
                    pages.push(resolved);
                }
            }
        } else if !params.pages.is_empty() {
            tracing::warn!(url = %root, "pages are ignored unless scope is 'descendants'");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(params.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            pages,
            auth_token: params.auth_token.clone(),
            tag: params.tag.clone(),
            html: HtmlText::new()?,
            reach: Reachability::default(),
        })
    }

    async fn fetch(&self, url: &Url) -> Result<Document, StageError> {
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.reach.classify(url.as_str(), e))?;
        self.reach.mark_reached();
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StageError::from_status(status, &body));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/plain")
            .to_string();
        let body = response.text().await.map_err(StageError::from_http)?;

        let (title, content) = if content_type.contains("html") {
            self.html.extract(&body)
        } else {
            (None, body)
        };

        let mut doc = Document::new(url.as_str(), url.as_str(), content)
            .with_metadata("content_type", content_type);
        if let Some(title) = title {
            doc = doc.with_metadata("title", title);
        }
        if let Some(tag) = &self.tag {
            doc = doc.with_metadata("tag", tag.clone());
        }
        Ok(doc)
    }
}

#[async_trait]
impl Source for WebExporter {
    fn contract(&self) -> Contract {
        Contract::source(Shape::Document)
    }

    async fn produce(&self, out: &Emitter) -> Result<(), StageError> {
        for url in &self.pages {
            if out.is_cancelled() {
                break;
            }
            let (result, attempts) = out
                .retry_policy()
                .run(out.control(), || self.fetch(url))
                .await;
            match result {
                Ok(doc) => {
                    tracing::debug!(url = %url, attempts, "exported page");
                    if !out.emit(Item::Document(doc)).await {
                        break;
                    }
                }
                Err(StageError::Fatal(msg)) => return Err(StageError::Fatal(msg)),
                Err(err) => {
                    tracing::warn!(url = %url, attempts, error = %err, "page export failed");
                    out.fail(url.as_str(), err, attempts);
                }
            }
        }
        Ok(())
    }
}

/// Elements whose content never reaches the text.
const HIDDEN: [&str; 5] = ["head", "script", "style", "noscript", "template"];
/// Elements that start a new line.
const BLOCKS: [&str; 22] = [
    "address", "article", "blockquote", "br", "dd", "div", "dl", "dt", "footer", "h1", "h2",
    "h3", "h4", "h5", "h6", "header", "li", "p", "pre", "section", "table", "tr",
];

/// HTML to text reduction over a parsed DOM: hidden elements are dropped,
/// block elements become line breaks, whitespace is collapsed per line and
/// entities come out decoded.
struct HtmlText {
    title: Selector,
}

impl HtmlText {
    fn new() -> Result<Self> {
        Ok(Self {
            title: Selector::parse("title").map_err(|e| anyhow!("invalid selector: {}", e))?,
        })
    }

    /// Page title and body text.
    fn extract(&self, html: &str) -> (Option<String>, String) {
        let doc = Html::parse_document(html);
        let title = doc
            .select(&self.title)
            .next()
            .map(|t| collapse(&t.text().collect::<String>()))
            .filter(|t| !t.is_empty());

        let mut raw = String::new();
        walk(doc.root_element(), &mut raw);
        let text = raw
            .lines()
            .map(collapse)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        (title, text)
    }
}

fn walk(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(e) if HIDDEN.contains(&e.name()) => {}
            Node::Element(e) => {
                let block = BLOCKS.contains(&e.name());
                if let Some(child) = ElementRef::wrap(child) {
                    if block {
                        out.push('\n');
                    }
                    walk(child, out);
                    if block {
                        out.push('\n');
                    }
                }
            }
            _ => {}
        }
    }
}

fn collapse(s: &str) -> String {
    s.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
