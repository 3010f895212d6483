//! OpenAI-compatible embedding client.
//!
//! Sends `POST {endpoint}/embeddings` with `{"model": ..., "input": [...]}`
//! (plus `"dimensions"` when configured) and reads `data[].embedding` from the
//! response. Works against OpenAI, Azure
//! deployments fronted by a compatible gateway, Ollama and most local servers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Embedder, EmbeddingError};

/// Configuration for [`HttpEmbedder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEmbedderConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Bearer token. Falls back to `EMBEDDINGS_API_KEY` / `OPENAI_API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Requested output dimensionality, checked on every response when set.
    /// Unset means the model's native width is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
}

fn default_model() -> String {
    "text-embedding-3-small".to_string()
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

pub struct HttpEmbedder {
    config: HttpEmbedderConfig,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_key(&self) -> Option<String> {
        self.config
            .api_key
            .clone()
            .or_else(|| std::env::var("EMBEDDINGS_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }

    fn url(&self) -> String {
        format!("{}/embeddings", self.config.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Response("response contained no data".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        log::debug!(
            "Embedding {} text(s) with model {}",
            texts.len(),
            self.config.model
        );

        let mut request = self.client.post(self.url()).json(&EmbeddingRequest {
            model: &self.config.model,
            input: texts,
            dimensions: self.config.dimensions,
        });
        if let Some(key) = self.api_key() {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Request(format!("HTTP {} - {}", status, body)));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Response(e.to_string()))?;

        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::Response(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        parsed.data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();

        if let Some(expected) = self.config.dimensions {
            if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: bad.len(),
                });
            }
        }

        Ok(vectors)
    }

    fn dimensions(&self) -> Option<usize> {
        self.config.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// One-shot HTTP server answering with an embedding of `width` floats.
    /// Resolves to the JSON request body it received.
    async fn stub_server(width: usize) -> (String, JoinHandle<serde_json::Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}/v1", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            let body = loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= split + 4 + length {
                        break raw[split + 4..split + 4 + length].to_vec();
                    }
                }
                assert!(n > 0, "connection closed before the request was complete");
            };
            let reply = serde_json::json!({
                "data": [{"index": 0, "embedding": vec![0.01f32; width]}]
            })
            .to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                reply.len(),
                reply
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            serde_json::from_slice(&body).unwrap()
        });
        (endpoint, handle)
    }

    #[tokio::test]
    async fn test_endpoint_only_config_accepts_native_width() {
        let (endpoint, server) = stub_server(1536).await;
        let settings = crate::config::EmbeddingSettings {
            endpoint: Some(endpoint),
            api_key: Some("test".into()),
            ..Default::default()
        };
        let e = HttpEmbedder::new(settings.http_config().unwrap());

        let vector = e.embed("weather lookup").await.unwrap();
        assert_eq!(vector.len(), 1536);

        let request = server.await.unwrap();
        assert_eq!(request["model"], "text-embedding-3-small");
        assert_eq!(request["input"][0], "weather lookup");
        assert!(request.get("dimensions").is_none());
    }

    #[tokio::test]
    async fn test_configured_dimensions_are_requested_and_enforced() {
        let (endpoint, server) = stub_server(1536).await;
        let e = HttpEmbedder::new(HttpEmbedderConfig {
            endpoint,
            model: default_model(),
            api_key: Some("test".into()),
            dimensions: Some(512),
        });

        let err = e.embed("weather lookup").await.unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch { expected: 512, actual: 1536 }
        ));
        assert_eq!(server.await.unwrap()["dimensions"], 512);
    }

    #[test]
    fn test_url_trims_trailing_slash() {
        let e = HttpEmbedder::new(HttpEmbedderConfig {
            endpoint: "http://localhost:11434/v1/".into(),
            model: default_model(),
            api_key: None,
            dimensions: Some(768),
        });
        assert_eq!(e.url(), "http://localhost:11434/v1/embeddings");
        assert_eq!(e.dimensions(), Some(768));
    }

    #[test]
    fn test_response_parsing_tolerates_missing_index() {
        let body = r#"{"data":[{"embedding":[0.1,0.2]},{"index":1,"embedding":[0.3,0.4]}]}"#;
        let parsed: EmbeddingResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.len(), 2);
        assert_eq!(parsed.data[1].index, Some(1));
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let e = HttpEmbedder::new(HttpEmbedderConfig {
            endpoint: "http://127.0.0.1:9".into(),
            model: default_model(),
            api_key: None,
            dimensions: None,
        });
        assert!(e.embed_batch(&[]).await.unwrap().is_empty());
    }
}
