use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

use super::{normalize, ImageEmbedder, TextEmbedder};

/// A mock embedder for deterministic testing.
///
/// Generates vectors by hashing input text with SHA-256 and normalizing the
/// resulting bytes. Implements both the text and multimodal traits so the
/// same instance can stand in for either gateway; `embed_image` hashes the
/// description only, so a query for the exact caption lands on the image.
pub struct MockEmbedder {
    dimensions: usize,
    fail: bool,
    call_count: AtomicUsize,
    image_calls: AtomicUsize,
    image_text_calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            fail: false,
            call_count: AtomicUsize::new(0),
            image_calls: AtomicUsize::new(0),
            image_text_calls: AtomicUsize::new(0),
        }
    }

    /// A mock whose every call errors, for exercising fallback paths.
    pub fn failing(dimensions: usize) -> Self {
        Self {
            fail: true,
            ..Self::new(dimensions)
        }
    }

    /// Number of `embed_batch` calls.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Number of `embed_image` calls.
    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    /// Number of multimodal `embed_text` calls.
    pub fn image_text_calls(&self) -> usize {
        self.image_text_calls.load(Ordering::SeqCst)
    }

    /// The normalized vector this mock would produce for `text`, without
    /// touching any call counter. Lets tests craft query vectors.
    pub fn query_vector(&self, text: &str) -> Vec<f32> {
        normalize(self.deterministic_vector(text)).expect("hash vectors are never zero")
    }

    fn deterministic_vector(&self, text: &str) -> Vec<f32> {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let hash = hasher.finalize();

        let mut result = Vec::with_capacity(self.dimensions);
        for i in 0..self.dimensions {
            let byte_idx = i % hash.len();
            // Offset by the lap count so cycling does not repeat exactly.
            let lap = (i / hash.len()) as f32;
            result.push(hash[byte_idx] as f32 / 255.0 + lap * 1e-3);
        }
        result
    }

    fn unavailable(&self) -> Error {
        Error::BackendUnavailable {
            backend: "mock".to_string(),
            message: "configured to fail".to_string(),
        }
    }
}

#[async_trait]
impl TextEmbedder for MockEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.fail {
            return Err(self.unavailable());
        }
        self.call_count.fetch_add(1, Ordering::SeqCst);
        texts
            .iter()
            .map(|t| {
                if t.trim().is_empty() {
                    Ok(vec![0.0; self.dimensions])
                } else {
                    normalize(self.deterministic_vector(t))
                }
            })
            .collect()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[async_trait]
impl ImageEmbedder for MockEmbedder {
    async fn embed_image(&self, _base64_png: &str, description: &str) -> Result<Vec<f32>> {
        if self.fail {
            return Err(self.unavailable());
        }
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        normalize(self.deterministic_vector(description))
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        if self.fail {
            return Err(self.unavailable());
        }
        self.image_text_calls.fetch_add(1, Ordering::SeqCst);
        normalize(self.deterministic_vector(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "mock-multimodal"
    }
}
