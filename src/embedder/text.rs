use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};

use crate::config::EMBED_TIMEOUT_SECS;
use crate::error::{Error, Result};

use super::{normalize, TextEmbedder};

/// Response row from the embedding server: `[{embedding: [[f32; D]]}]`.
#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<Vec<f32>>,
}

/// HTTP gateway to the text embedding service.
///
/// Chunks are posted one at a time: the embedder service is the
/// throughput bottleneck and queues internally, so client-side batching
/// buys nothing.
pub struct HttpTextEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl HttpTextEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimensions,
        }
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embedding", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "content": text }))
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable {
                backend: "embedder".to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::BackendUnavailable {
                backend: "embedder".to_string(),
                message: format!("{url} returned {}", response.status()),
            });
        }

        let rows: Vec<EmbeddingRow> =
            response
                .json()
                .await
                .map_err(|e| Error::Serialization(format!("embedding response: {e}")))?;

        let vector = rows
            .into_iter()
            .next()
            .and_then(|row| row.embedding.into_iter().next())
            .ok_or_else(|| Error::Serialization("embedding response carried no vector".into()))?;

        trace!(dimensions = vector.len(), "embedded one chunk");
        normalize(vector)
    }
}

#[async_trait]
impl TextEmbedder for HttpTextEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for (index, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                // Empty chunk: zero-vector fallback so the batch continues.
                debug!(index, "empty chunk, substituting zero vector");
                vectors.push(vec![0.0; self.dimensions]);
                continue;
            }
            vectors.push(self.embed_one(text).await?);
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn posts_each_chunk_and_normalizes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embedding"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!([
                    { "embedding": [[3.0, 4.0]] }
                ])),
            )
            .expect(2)
            .mount(&server)
            .await;

        let embedder = HttpTextEmbedder::new(server.uri(), "test-model", 2);
        let vectors = embedder
            .embed_batch(&["alpha".into(), "beta".into()])
            .await
            .unwrap();

        assert_eq!(vectors.len(), 2);
        let magnitude: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
        assert!((vectors[0][0] - 0.6).abs() < 1e-5);
    }

    #[tokio::test]
    async fn sends_content_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embedding"))
            .and(body_partial_json(serde_json::json!({"content": "hello"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{ "embedding": [[1.0]] }])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let embedder = HttpTextEmbedder::new(server.uri(), "m", 1);
        embedder.embed_batch(&["hello".into()]).await.unwrap();
    }

    #[tokio::test]
    async fn empty_chunk_becomes_zero_vector_without_a_call() {
        let server = MockServer::start().await;
        // No mock mounted: any request would 404 and fail the test.
        let embedder = HttpTextEmbedder::new(server.uri(), "m", 4);
        let vectors = embedder.embed_batch(&["".into()]).await.unwrap();
        assert_eq!(vectors, vec![vec![0.0; 4]]);
    }

    #[tokio::test]
    async fn zero_vector_from_server_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embedding"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{ "embedding": [[0.0, 0.0]] }])),
            )
            .mount(&server)
            .await;

        let embedder = HttpTextEmbedder::new(server.uri(), "m", 2);
        let err = embedder.embed_batch(&["x".into()]).await.unwrap_err();
        assert!(matches!(err, Error::ZeroEmbedding));
    }

    #[tokio::test]
    async fn http_error_maps_to_backend_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embedding"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let embedder = HttpTextEmbedder::new(server.uri(), "m", 2);
        let err = embedder.embed_batch(&["x".into()]).await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable { .. }));
    }
}
