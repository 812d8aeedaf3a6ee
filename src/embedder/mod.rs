pub mod mock;
pub mod multimodal;
pub mod text;
pub mod vision;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub use mock::MockEmbedder;
pub use multimodal::HttpMultimodalEmbedder;
pub use text::HttpTextEmbedder;
pub use vision::{HttpVisionDescriber, VisionDescriber};

/// Trait for embedding text chunks into vector representations.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Embed a batch of texts, returning one unit-normalized vector per input.
    /// Empty inputs yield a zero-vector fallback rather than an error.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// The dimensionality of the embedding vectors produced.
    fn dimensions(&self) -> usize;

    /// Human-readable name for this embedder.
    fn name(&self) -> &str;
}

/// Trait for embedding images (and query text) in a shared multimodal space.
#[async_trait]
pub trait ImageEmbedder: Send + Sync {
    /// Embed a base64 PNG, with `description` as the instruction prompt.
    async fn embed_image(&self, base64_png: &str, description: &str) -> Result<Vec<f32>>;

    /// Embed plain text through the multimodal server (query-time path).
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;

    fn name(&self) -> &str;
}

/// Scale a vector to unit L2 magnitude. Zero-magnitude input is an error.
pub fn normalize(mut vector: Vec<f32>) -> Result<Vec<f32>> {
    let magnitude = vector.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if magnitude == 0.0 || !magnitude.is_finite() {
        return Err(Error::ZeroEmbedding);
    }
    for x in &mut vector {
        *x = (*x as f64 / magnitude) as f32;
    }
    Ok(vector)
}

/// Magnitude, mean, and standard deviation of a vector, for diagnostics.
pub fn vector_stats(vector: &[f32]) -> (f64, f64, f64) {
    if vector.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let n = vector.len() as f64;
    let magnitude = vector.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mean = vector.iter().map(|x| *x as f64).sum::<f64>() / n;
    let variance = vector
        .iter()
        .map(|x| (*x as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (magnitude, mean, variance.sqrt())
}

/// Validate raw JSON chunk values into strings.
///
/// Non-string values are rejected (`InvalidChunk`); null and empty strings
/// are passed through empty so the embedder applies its zero-vector
/// fallback instead of aborting the batch.
pub fn coerce_chunks(values: &[Value]) -> Result<Vec<String>> {
    values
        .iter()
        .enumerate()
        .map(|(index, value)| match value {
            Value::String(s) => Ok(s.clone()),
            Value::Null => Ok(String::new()),
            other => Err(Error::InvalidChunk {
                index,
                reason: format!("expected string, got {}", type_name(other)),
            }),
        })
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Centralizes query-time embedder selection.
///
/// When a multimodal embedder is active, queries are embedded through its
/// text-only path so query vectors share the subspace of stored image
/// vectors. The fallback to the standard text embedder happens only on
/// multimodal failure, is logged, and is refused outright when the text
/// embedder's dimension cannot match the target collection.
pub struct QueryEmbedder {
    text: Arc<dyn TextEmbedder>,
    multimodal: Option<Arc<dyn ImageEmbedder>>,
}

impl QueryEmbedder {
    pub fn new(text: Arc<dyn TextEmbedder>, multimodal: Option<Arc<dyn ImageEmbedder>>) -> Self {
        Self { text, multimodal }
    }

    pub fn has_multimodal(&self) -> bool {
        self.multimodal.is_some()
    }

    /// Embed a search query, choosing the embedder to match the collection.
    ///
    /// `collection_dim` is the dimension of the target collection when it is
    /// known; a vector of any other size cannot produce meaningful scores.
    pub async fn embed_query(
        &self,
        query: &str,
        namespace: &str,
        collection_dim: Option<usize>,
    ) -> Result<Vec<f32>> {
        let vector = match &self.multimodal {
            Some(mm) => match mm.embed_text(query).await {
                Ok(vector) => vector,
                Err(e) => {
                    warn!(embedder = mm.name(), error = %e,
                        "multimodal query embedding failed, falling back to text embedder");
                    if let Some(dim) = collection_dim {
                        if self.text.dimensions() != dim {
                            return Err(Error::DimensionMismatch {
                                namespace: namespace.to_string(),
                                expected: dim,
                                actual: self.text.dimensions(),
                            });
                        }
                    }
                    self.embed_with_text(query).await?
                }
            },
            None => self.embed_with_text(query).await?,
        };

        let (magnitude, mean, std) = vector_stats(&vector);
        debug!(
            dimensions = vector.len(),
            magnitude, mean, std, "query embedded"
        );
        if let Some(dim) = collection_dim {
            if vector.len() != dim {
                warn!(
                    got = vector.len(),
                    expected = dim,
                    "query vector dimension does not match collection"
                );
                return Err(Error::DimensionMismatch {
                    namespace: namespace.to_string(),
                    expected: dim,
                    actual: vector.len(),
                });
            }
        }
        Ok(vector)
    }

    async fn embed_with_text(&self, query: &str) -> Result<Vec<f32>> {
        let mut vectors = self.text.embed_batch(std::slice::from_ref(&query.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Serialization("embedder returned no vectors".into()))
    }
}
