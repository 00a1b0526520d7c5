//! HTTP embedding skills.
//!
//! Three request dialects are supported:
//! - **openai**: `POST {endpoint}/v1/embeddings`, bearer auth, response
//!   `data[].embedding` (ordered by `data[].index`).
//! - **azure-openai**: `POST {endpoint}/openai/deployments/{deployment}/embeddings?api-version={v}`,
//!   `api-key` header, OpenAI response format.
//! - **ollama**: `POST {endpoint}/api/embed`, response `embeddings[]`.
//!
//! Each chunk is embedded in its own request; throughput comes from the
//! stage's `concurrency` setting and retries from its retry policy, so the
//! skill itself never loops. HTTP 429 and 5xx responses and network errors
//! are transient, other 4xx and malformed responses are permanent. An
//! endpoint that refuses the very first connection is fatal.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use super::{Contract, Reachability, Shape, SkillKind, Transform};
use crate::config::{EmbeddingParams, SkillDefinition, SkillParams};
use crate::error::StageError;
use crate::models::Item;

const OPENAI_ENDPOINT: &str = "https://api.openai.com";
const OLLAMA_ENDPOINT: &str = "http://localhost:11434";
const AZURE_API_VERSION: &str = "2023-05-15";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    AzureOpenAi,
    Ollama,
}

impl Dialect {
    fn name(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::AzureOpenAi => "azure-openai",
            Dialect::Ollama => "ollama",
        }
    }
}

pub struct HttpEmbedder {
    dialect: Dialect,
    client: reqwest::Client,
    url: String,
    /// Sent in the request body; Azure selects the model by deployment.
    model: Option<String>,
    dims: Option<usize>,
    api_key: Option<String>,
    reach: Reachability,
}

pub fn build_openai(def: &SkillDefinition) -> Result<SkillKind> {
    build(def, Dialect::OpenAi)
}

pub fn build_azure_openai(def: &SkillDefinition) -> Result<SkillKind> {
    build(def, Dialect::AzureOpenAi)
}

pub fn build_ollama(def: &SkillDefinition) -> Result<SkillKind> {
    build(def, Dialect::Ollama)
}

fn build(def: &SkillDefinition, dialect: Dialect) -> Result<SkillKind> {
    let SkillParams::Embedding(params) = &def.params else {
        bail!("expected embedding params");
    };
    Ok(SkillKind::transform(HttpEmbedder::new(params, dialect)?))
}

impl HttpEmbedder {
    pub fn new(params: &EmbeddingParams, dialect: Dialect) -> Result<Self> {
        let api_key = params.resolve_api_key();
        if dialect != Dialect::Ollama && api_key.is_none() {
            match &params.api_key_env {
                Some(var) => bail!("environment variable {} is not set", var),
                None => bail!("{} embedding requires api_key or api_key_env", dialect.name()),
            }
        }
        if dialect != Dialect::AzureOpenAi && params.model.is_none() {
            bail!("{} embedding requires a model", dialect.name());
        }

        let endpoint = match (dialect, params.endpoint.as_deref()) {
            (_, Some(endpoint)) => endpoint,
            (Dialect::OpenAi, None) => OPENAI_ENDPOINT,
            (Dialect::Ollama, None) => OLLAMA_ENDPOINT,
            (Dialect::AzureOpenAi, None) => bail!("azure-openai embedding requires an endpoint"),
        };
        let endpoint = endpoint.trim_end_matches('/');
        let url = match dialect {
            Dialect::OpenAi => format!("{}/v1/embeddings", endpoint),
            Dialect::AzureOpenAi => {
                let Some(deployment) = params.deployment_name.as_deref() else {
                    bail!("azure-openai embedding requires deployment_name");
                };
                format!(
                    "{}/openai/deployments/{}/embeddings?api-version={}",
                    endpoint,
                    deployment,
                    params.api_version.as_deref().unwrap_or(AZURE_API_VERSION)
                )
            }
            Dialect::Ollama => format!("{}/api/embed", endpoint),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(params.timeout_secs))
            .build()?;

        Ok(Self {
            dialect,
            client,
            url,
            model: params.model.clone(),
            dims: params.dims,
            api_key,
            reach: Reachability::default(),
        })
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, StageError> {
        let mut body = serde_json::json!({ "input": [text] });
        if let Some(model) = &self.model {
            body["model"] = serde_json::Value::String(model.clone());
        }

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = match self.dialect {
                Dialect::AzureOpenAi => request.header("api-key", key),
                _ => request.bearer_auth(key),
            };
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.reach.classify(&format!("{} endpoint {}", self.dialect.name(), self.url), e))?;
        self.reach.mark_reached();
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(StageError::from_status(status, &body_text));
        }

        let json: serde_json::Value = response.json().await.map_err(StageError::from_http)?;
        let parsed = match self.dialect {
            Dialect::OpenAi | Dialect::AzureOpenAi => parse_openai_response(&json),
            Dialect::Ollama => parse_ollama_response(&json),
        };
        let vector = parsed
            .and_then(|vectors| {
                vectors
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("response contained no embeddings"))
            })
            .map_err(|e| StageError::permanent(format!("{} response: {}", self.dialect.name(), e)))?;

        if let Some(dims) = self.dims {
            if vector.len() != dims {
                return Err(StageError::permanent(format!(
                    "model {} returned {} dimensions, expected {}",
                    self.model.as_deref().unwrap_or(self.dialect.name()),
                    vector.len(),
                    dims
                )));
            }
        }
        Ok(vector)
    }
}

fn as_vector(value: &serde_json::Value) -> Result<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| anyhow!("embedding is not an array"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow!("embedding contains a non-numeric value"))
        })
        .collect()
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow!("missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, as_vector(embedding)?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("missing embeddings array"))?
        .iter()
        .map(as_vector)
        .collect()
}

#[async_trait]
impl Transform for HttpEmbedder {
    fn contract(&self) -> Contract {
        Contract::transform(&[Shape::Chunk], Shape::EmbeddedChunk)
    }

    async fn apply(&self, item: Item) -> Result<Vec<Item>, StageError> {
        let chunk = match item {
            Item::Chunk(chunk) => chunk,
            other => {
                return Err(StageError::permanent(format!(
                    "embedding cannot embed a {}",
                    other.kind()
                )))
            }
        };
        let vector = self.embed(&chunk.content).await?;
        tracing::debug!(chunk = %chunk.chunk_id, dims = vector.len(), "embedded chunk");
        Ok(vec![Item::Chunk(chunk.with_embedding(vector))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, Document};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn params(endpoint: &str, dims: Option<usize>) -> EmbeddingParams {
        EmbeddingParams {
            endpoint: Some(endpoint.to_string()),
            model: Some("test-model".into()),
            deployment_name: None,
            api_version: None,
            dims,
            api_key: Some("sk-test".into()),
            api_key_env: None,
            timeout_secs: 5,
        }
    }

    /// Answer a single HTTP request with `status` and a JSON `body`.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        serve_once_capturing(status, body).await.0
    }

    /// Like [`serve_once`], also handing back the raw request text.
    async fn serve_once_capturing(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut tmp = [0u8; 4096];
            loop {
                let n = socket.read(&mut tmp).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&tmp[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            let _ = seen_tx.send(String::from_utf8_lossy(&buf).to_string());
        });
        (format!("http://{}", addr), seen_rx)
    }

    fn chunk() -> Item {
        let doc = Document::new("d", "file:///d", "hello");
        Item::Chunk(Chunk::from_document(&doc, 0, "hello"))
    }

    #[test]
    fn openai_requires_a_key() {
        let mut p = params("http://localhost:1", None);
        p.api_key = None;
        assert!(HttpEmbedder::new(&p, Dialect::OpenAi).is_err());
        assert!(HttpEmbedder::new(&p, Dialect::Ollama).is_ok());
    }

    #[test]
    fn openai_response_is_ordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [2.0, 2.0]},
                {"index": 0, "embedding": [1.0, 1.0]}
            ]
        });
        let out = parse_openai_response(&json).unwrap();
        assert_eq!(out, vec![vec![1.0, 1.0], vec![2.0, 2.0]]);
        assert!(parse_openai_response(&serde_json::json!({"error": "x"})).is_err());
    }

    #[test]
    fn ollama_response_parses() {
        let json = serde_json::json!({"embeddings": [[0.5, -0.5]]});
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![vec![0.5, -0.5]]);
        let bad = serde_json::json!({"embeddings": [["x"]]});
        assert!(parse_ollama_response(&bad).is_err());
    }

    #[tokio::test]
    async fn attaches_embedding_to_chunk() {
        let url = serve_once("200 OK", r#"{"data":[{"index":0,"embedding":[0.1,0.2,0.3]}]}"#).await;
        let embedder = HttpEmbedder::new(&params(&url, Some(3)), Dialect::OpenAi).unwrap();
        let out = embedder.apply(chunk()).await.unwrap();
        let Item::Chunk(c) = &out[0] else {
            panic!("expected chunk");
        };
        assert_eq!(c.embedding.as_deref(), Some(&[0.1f32, 0.2, 0.3][..]));
    }

    #[tokio::test]
    async fn dimension_mismatch_is_permanent() {
        let url = serve_once("200 OK", r#"{"embeddings":[[0.1,0.2]]}"#).await;
        let embedder = HttpEmbedder::new(&params(&url, Some(3)), Dialect::Ollama).unwrap();
        assert!(matches!(
            embedder.apply(chunk()).await,
            Err(StageError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn rate_limit_is_transient() {
        let url = serve_once("429 Too Many Requests", r#"{"error":"slow down"}"#).await;
        let embedder = HttpEmbedder::new(&params(&url, None), Dialect::OpenAi).unwrap();
        assert!(matches!(
            embedder.apply(chunk()).await,
            Err(StageError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn azure_uses_deployment_path_and_api_key_header() {
        let (url, seen) =
            serve_once_capturing("200 OK", r#"{"data":[{"index":0,"embedding":[0.5,0.5]}]}"#).await;
        let mut p = params(&url, Some(2));
        p.model = None;
        p.deployment_name = Some("ada-002".into());
        let embedder = HttpEmbedder::new(&p, Dialect::AzureOpenAi).unwrap();

        assert_eq!(embedder.embed("hello").await.unwrap(), vec![0.5, 0.5]);
        let request = seen.await.unwrap();
        assert!(
            request.starts_with("POST /openai/deployments/ada-002/embeddings?api-version=2023-05-15 "),
            "{}",
            request
        );
        assert!(request.to_ascii_lowercase().contains("api-key: sk-test"));
        assert!(!request.to_ascii_lowercase().contains("authorization"));
        assert!(!request.contains("\"model\""));
    }

    #[test]
    fn azure_requires_deployment_and_endpoint() {
        let mut p = params("https://example.openai.azure.com", None);
        p.model = None;
        assert!(HttpEmbedder::new(&p, Dialect::AzureOpenAi).is_err());
        p.deployment_name = Some("ada".into());
        assert!(HttpEmbedder::new(&p, Dialect::AzureOpenAi).is_ok());
        p.endpoint = None;
        assert!(HttpEmbedder::new(&p, Dialect::AzureOpenAi).is_err());
        // The other dialects still need a model.
        let mut p = params("http://localhost:1", None);
        p.model = None;
        assert!(HttpEmbedder::new(&p, Dialect::Ollama).is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_on_first_use_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let embedder =
            HttpEmbedder::new(&params(&format!("http://{}", addr), None), Dialect::Ollama).unwrap();
        assert!(matches!(
            embedder.apply(chunk()).await,
            Err(StageError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn connection_loss_after_first_answer_is_transient() {
        let url = serve_once("200 OK", r#"{"embeddings":[[0.1]]}"#).await;
        let embedder = HttpEmbedder::new(&params(&url, None), Dialect::Ollama).unwrap();
        embedder.apply(chunk()).await.unwrap();

        // The one-shot server has gone away.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(matches!(
            embedder.apply(chunk()).await,
            Err(StageError::Transient(_))
        ));
    }
}
