use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::config::{MultimodalConfig, MultimodalPayloadFormat, EMBED_TIMEOUT_SECS};
use crate::error::{Error, Result};
use crate::intake::image::resize_base64_png;

use super::{normalize, ImageEmbedder};

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<Vec<f32>>,
}

/// HTTP gateway to a multimodal embedding server.
///
/// The payload format is fixed per configured server and reused verbatim at
/// query time (with the image parts omitted) so query vectors land in the
/// same subspace as stored image vectors.
pub struct HttpMultimodalEmbedder {
    client: reqwest::Client,
    config: MultimodalConfig,
    base_url: String,
}

impl HttpMultimodalEmbedder {
    pub fn new(config: MultimodalConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        let base_url = config.base_path.trim_end_matches('/').to_string();
        Self {
            client,
            config,
            base_url,
        }
    }

    fn image_payload(&self, base64_png: &str, description: &str) -> Value {
        match self.config.payload_format {
            MultimodalPayloadFormat::PromptString => json!({
                "content": [{
                    "prompt_string": format!("Instruct: {description}\n<__media__>"),
                    "multimodal_data": [base64_png],
                }],
                "parameter": { "output_dimension": self.config.dimensions },
            }),
            MultimodalPayloadFormat::ImageData => json!({
                "content": "Image: [img-0]",
                "image_data": [{ "data": base64_png, "id": 0 }],
            }),
        }
    }

    fn text_payload(&self, text: &str) -> Value {
        match self.config.payload_format {
            MultimodalPayloadFormat::PromptString => json!({
                "content": [{ "prompt_string": text }],
                "parameter": { "output_dimension": self.config.dimensions },
            }),
            MultimodalPayloadFormat::ImageData => json!({ "content": text }),
        }
    }

    async fn post_embedding(&self, payload: &Value) -> Result<Vec<f32>> {
        let url = format!("{}/embedding", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable {
                backend: "multimodal-embedder".to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::BackendUnavailable {
                backend: "multimodal-embedder".to_string(),
                message: format!("{url} returned {}", response.status()),
            });
        }

        let rows: Vec<EmbeddingRow> = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("multimodal response: {e}")))?;

        let vector = rows
            .into_iter()
            .next()
            .and_then(|row| row.embedding.into_iter().next())
            .ok_or_else(|| Error::Serialization("multimodal response carried no vector".into()))?;

        trace!(dimensions = vector.len(), "multimodal embedding returned");
        normalize(vector)
    }
}

#[async_trait]
impl ImageEmbedder for HttpMultimodalEmbedder {
    async fn embed_image(&self, base64_png: &str, description: &str) -> Result<Vec<f32>> {
        // Cap the longest edge before shipping; never upscale.
        let resized = resize_base64_png(base64_png, self.config.max_edge)?;
        debug!(
            model = %self.config.model,
            max_edge = self.config.max_edge,
            "embedding image"
        );
        self.post_embedding(&self.image_payload(&resized, description))
            .await
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.post_embedding(&self.text_payload(text)).await
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base: &str, format: MultimodalPayloadFormat) -> MultimodalConfig {
        MultimodalConfig {
            provider: "custom".into(),
            base_path: base.into(),
            model: "mm-test".into(),
            dimensions: 4,
            payload_format: format,
            max_edge: 64,
        }
    }

    fn ok_body() -> serde_json::Value {
        serde_json::json!([{ "embedding": [[1.0, 2.0, 2.0, 4.0]] }])
    }

    #[test]
    fn prompt_string_image_payload_shape() {
        let embedder =
            HttpMultimodalEmbedder::new(config("http://x", MultimodalPayloadFormat::PromptString));
        let payload = embedder.image_payload("B64", "a red apple");
        let prompt = payload["content"][0]["prompt_string"].as_str().unwrap();
        assert!(prompt.starts_with("Instruct: a red apple"));
        assert!(prompt.contains("<__media__>"));
        assert_eq!(payload["content"][0]["multimodal_data"][0], "B64");
        assert_eq!(payload["parameter"]["output_dimension"], 4);
    }

    #[test]
    fn image_data_payload_shape() {
        let embedder =
            HttpMultimodalEmbedder::new(config("http://x", MultimodalPayloadFormat::ImageData));
        let payload = embedder.image_payload("B64", "unused");
        assert_eq!(payload["content"], "Image: [img-0]");
        assert_eq!(payload["image_data"][0]["data"], "B64");
        assert_eq!(payload["image_data"][0]["id"], 0);
    }

    #[test]
    fn text_payload_omits_image_parts() {
        let ps =
            HttpMultimodalEmbedder::new(config("http://x", MultimodalPayloadFormat::PromptString));
        let payload = ps.text_payload("apple");
        assert_eq!(payload["content"][0]["prompt_string"], "apple");
        assert!(payload["content"][0].get("multimodal_data").is_none());

        let id = HttpMultimodalEmbedder::new(config("http://x", MultimodalPayloadFormat::ImageData));
        let payload = id.text_payload("apple");
        assert_eq!(payload["content"], "apple");
        assert!(payload.get("image_data").is_none());
    }

    #[tokio::test]
    async fn embed_text_posts_and_normalizes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embedding"))
            .and(body_partial_json(serde_json::json!({
                "parameter": { "output_dimension": 4 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = HttpMultimodalEmbedder::new(config(
            &server.uri(),
            MultimodalPayloadFormat::PromptString,
        ));
        let v = embedder.embed_text("apple").await.unwrap();
        let magnitude: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn server_error_is_backend_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embedding"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let embedder = HttpMultimodalEmbedder::new(config(
            &server.uri(),
            MultimodalPayloadFormat::ImageData,
        ));
        let err = embedder.embed_text("apple").await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable { .. }));
    }
}
