use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// A single embedded vector plus its payload, as produced by an embedding
/// session and as cached on disk in the vector cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Record UUID (string form, one per chunk).
    pub id: String,
    /// Unit-normalized embedding. Dimension must match the collection.
    pub vector: Vec<f32>,
    /// The chunk text (or image caption) this vector was computed from.
    pub text: String,
    /// Owning document id.
    #[serde(rename = "docId")]
    pub doc_id: String,
    /// Flattened document metadata carried into search payloads.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// A record as persisted inside a collection file. The vector itself lives
/// in the KNN index region; metadata is kept as a JSON string the same way
/// the folder caches store theirs.
#[derive(Debug, Clone, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct StoredRecord {
    pub id: String,
    pub doc_id: String,
    pub text: String,
    pub metadata_json: String,
    /// Key of the corresponding vector in the KNN index region.
    pub key: u64,
}

impl StoredRecord {
    pub fn from_record(record: &VectorRecord, key: u64) -> Self {
        Self {
            id: record.id.clone(),
            doc_id: record.doc_id.clone(),
            text: record.text.clone(),
            metadata_json: serde_json::to_string(&record.metadata).unwrap_or_default(),
            key,
        }
    }

    pub fn metadata(&self) -> Map<String, Value> {
        serde_json::from_str(&self.metadata_json).unwrap_or_default()
    }
}

/// Serialized metadata region of a collection file.
#[derive(Debug, Clone, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct CollectionMetadata {
    /// Map from record id to stored payload.
    pub records: HashMap<String, StoredRecord>,
    /// Bridge: document id → record ids, for targeted deletes.
    pub doc_vectors: HashMap<String, Vec<String>>,
    /// Fixed vector dimension, set when the collection is first created.
    pub dimensions: usize,
    /// Unix timestamp (seconds) of last save.
    pub last_updated: u64,
}

impl CollectionMetadata {
    pub fn empty(dimensions: usize) -> Self {
        Self {
            records: HashMap::new(),
            doc_vectors: HashMap::new(),
            dimensions,
            last_updated: 0,
        }
    }
}

/// Status snapshot for one collection.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatus {
    pub namespace: String,
    pub vector_count: usize,
    pub document_count: usize,
    pub dimensions: usize,
    pub last_updated: u64,
    pub file_size: u64,
}

/// Distance metric selected at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    L2,
    Dot,
}

impl FromStr for DistanceMetric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cosine" | "cos" => Ok(Self::Cosine),
            "l2" | "euclidean" => Ok(Self::L2),
            "dot" | "ip" => Ok(Self::Dot),
            other => Err(Error::Config(format!(
                "unknown distance metric '{other}': expected cosine, l2, or dot"
            ))),
        }
    }
}
