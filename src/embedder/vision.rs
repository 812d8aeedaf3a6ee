use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::VISION_TIMEOUT_SECS;
use crate::error::{Error, Result};

/// System prompt pinning the assistant's role for caption generation.
const SYSTEM_PROMPT: &str = "You are an assistant that perfectly describes images.";

/// Default user instruction when the caller provides no prompt of its own.
const DEFAULT_PROMPT: &str =
    "Describe this image in a few sentences, covering the subject, setting, and notable details.";

/// A vision LLM that turns images into text captions.
#[async_trait]
pub trait VisionDescriber: Send + Sync {
    /// Describe a batch of base64 images. `prompts` pairs with `images`;
    /// missing or empty prompts use the default instruction.
    ///
    /// Per-item failures yield `Err` entries in the parallel output so the
    /// caller can substitute a neutral caption without aborting the batch.
    async fn describe_images(&self, images: &[String], prompts: &[String]) -> Vec<Result<String>>;

    fn name(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// HTTP gateway to an OpenAI-style chat-completions vision endpoint.
pub struct HttpVisionDescriber {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpVisionDescriber {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(VISION_TIMEOUT_SECS))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    async fn describe_one(&self, image_b64: &str, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let prompt = if prompt.trim().is_empty() {
            DEFAULT_PROMPT
        } else {
            prompt
        };

        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": {
                        "url": format!("data:image/jpeg;base64,{image_b64}")
                    }},
                ]},
            ],
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable {
                backend: "vision".to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::BackendUnavailable {
                backend: "vision".to_string(),
                message: format!("{url} returned {}", response.status()),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("vision response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::Serialization("vision response carried no caption".into()))
    }
}

#[async_trait]
impl VisionDescriber for HttpVisionDescriber {
    async fn describe_images(&self, images: &[String], prompts: &[String]) -> Vec<Result<String>> {
        let mut results = Vec::with_capacity(images.len());
        for (i, image) in images.iter().enumerate() {
            let prompt = prompts.get(i).map(String::as_str).unwrap_or("");
            match self.describe_one(image, prompt).await {
                Ok(caption) => {
                    debug!(index = i, chars = caption.len(), "image described");
                    results.push(Ok(caption));
                }
                Err(e) => {
                    warn!(index = i, error = %e, "image description failed");
                    results.push(Err(e));
                }
            }
        }
        results
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Describer returning a fixed caption; stands in for the vision LLM in tests.
pub struct StaticDescriber {
    caption: String,
    fail: bool,
}

impl StaticDescriber {
    pub fn new(caption: impl Into<String>) -> Self {
        Self {
            caption: caption.into(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            caption: String::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl VisionDescriber for StaticDescriber {
    async fn describe_images(&self, images: &[String], _prompts: &[String]) -> Vec<Result<String>> {
        images
            .iter()
            .map(|_| {
                if self.fail {
                    Err(Error::BackendUnavailable {
                        backend: "vision".to_string(),
                        message: "configured to fail".to_string(),
                    })
                } else {
                    Ok(self.caption.clone())
                }
            })
            .collect()
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_body(caption: &str) -> serde_json::Value {
        json!({
            "choices": [{ "message": { "role": "assistant", "content": caption } }]
        })
    }

    #[tokio::test]
    async fn describes_via_chat_completions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({
                "messages": [{ "role": "system", "content": SYSTEM_PROMPT }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("a red apple")))
            .expect(1)
            .mount(&server)
            .await;

        let describer = HttpVisionDescriber::new(server.uri(), "llava");
        let results = describer
            .describe_images(&["B64".into()], &["what is this?".into()])
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), "a red apple");
    }

    #[tokio::test]
    async fn per_item_failure_does_not_abort_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let describer = HttpVisionDescriber::new(server.uri(), "llava");
        let results = describer
            .describe_images(&["A".into(), "B".into()], &[])
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_err()));
    }

    #[tokio::test]
    async fn static_describer_is_deterministic() {
        let describer = StaticDescriber::new("a cat");
        let results = describer.describe_images(&["x".into()], &[]).await;
        assert_eq!(results[0].as_ref().unwrap(), "a cat");
    }
}
