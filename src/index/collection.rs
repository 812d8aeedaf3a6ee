use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::{debug, warn};
use usearch::Index as KnnIndex;

use crate::error::{Error, Result};
use crate::index::storage;
use crate::index::types::{CollectionMetadata, CollectionStatus, StoredRecord, VectorRecord};

/// Internal mutable state protected by the RwLock.
struct CollectionState {
    metadata: CollectionMetadata,
    knn: KnnIndex,
    id_to_key: HashMap<String, u64>,
    key_to_id: HashMap<u64, String>,
    next_key: u64,
    dirty: bool,
}

/// Thread-safe handle to one namespace's collection file.
///
/// Single-writer append-heavy, multi-reader; writes within a workspace are
/// serialized at the session level, so the lock is uncontended in practice.
pub struct Collection {
    path: PathBuf,
    namespace: String,
    state: RwLock<CollectionState>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Collection {
    /// Open an existing collection file.
    pub fn open(path: &Path, namespace: &str) -> Result<Self> {
        let (metadata, knn) = storage::load_collection(path)?;

        let mut id_to_key = HashMap::new();
        let mut key_to_id = HashMap::new();
        let mut max_key: Option<u64> = None;
        for (id, record) in &metadata.records {
            id_to_key.insert(id.clone(), record.key);
            key_to_id.insert(record.key, id.clone());
            max_key = Some(max_key.map_or(record.key, |m: u64| m.max(record.key)));
        }
        let next_key = max_key.map_or(0, |k| k + 1);

        Ok(Self {
            path: path.to_path_buf(),
            namespace: namespace.to_string(),
            state: RwLock::new(CollectionState {
                metadata,
                knn,
                id_to_key,
                key_to_id,
                next_key,
                dirty: false,
            }),
        })
    }

    /// Create a new, empty collection with a fixed dimension.
    pub fn create(path: &Path, namespace: &str, dimensions: usize) -> Result<Self> {
        let mut metadata = CollectionMetadata::empty(dimensions);
        metadata.last_updated = now_secs();

        let knn = storage::create_knn(dimensions)?;
        knn.reserve(16)
            .map_err(|e| Error::Serialization(format!("usearch reserve: {e}")))?;

        storage::write_collection(path, &metadata, &knn)?;

        Ok(Self {
            path: path.to_path_buf(),
            namespace: namespace.to_string(),
            state: RwLock::new(CollectionState {
                metadata,
                knn,
                id_to_key: HashMap::new(),
                key_to_id: HashMap::new(),
                next_key: 0,
                dirty: false,
            }),
        })
    }

    /// Open an existing collection or create a fresh one if missing.
    pub fn open_or_create(path: &Path, namespace: &str, dimensions: usize) -> Result<Self> {
        match Self::open(path, namespace) {
            Ok(collection) => Ok(collection),
            Err(Error::CollectionNotFound(_)) => Self::create(path, namespace, dimensions),
            Err(e) => Err(e),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn dimensions(&self) -> usize {
        self.state.read().metadata.dimensions
    }

    pub fn vector_count(&self) -> usize {
        self.state.read().metadata.records.len()
    }

    pub fn document_count(&self) -> usize {
        self.state.read().metadata.doc_vectors.len()
    }

    /// Append vector records. Every vector must match the collection's
    /// dimension; insertion is all-or-nothing per call so a cancelled
    /// session never leaves a torn document behind.
    pub fn add_records(&self, records: &[VectorRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.write();
        let dims = state.metadata.dimensions;
        for record in records {
            if record.vector.len() != dims {
                return Err(Error::DimensionMismatch {
                    namespace: self.namespace.clone(),
                    expected: dims,
                    actual: record.vector.len(),
                });
            }
        }

        let needed = state.knn.size() + records.len();
        if state.knn.capacity() < needed {
            state
                .knn
                .reserve(needed.max(16))
                .map_err(|e| Error::Serialization(format!("usearch reserve: {e}")))?;
        }

        for record in records {
            let key = state.next_key;
            state
                .knn
                .add(key, &record.vector)
                .map_err(|e| Error::Serialization(format!("usearch add: {e}")))?;
            state.next_key += 1;

            let stored = StoredRecord::from_record(record, key);
            state.id_to_key.insert(record.id.clone(), key);
            state.key_to_id.insert(key, record.id.clone());
            state
                .metadata
                .doc_vectors
                .entry(record.doc_id.clone())
                .or_default()
                .push(record.id.clone());
            state.metadata.records.insert(record.id.clone(), stored);
        }
        state.dirty = true;
        debug!(
            namespace = %self.namespace,
            added = records.len(),
            total = state.metadata.records.len(),
            "records added"
        );
        Ok(records.len())
    }

    /// Remove every vector belonging to a document. Returns the number of
    /// vectors removed.
    pub fn remove_document(&self, doc_id: &str) -> Result<usize> {
        let mut state = self.state.write();
        let Some(record_ids) = state.metadata.doc_vectors.remove(doc_id) else {
            return Ok(0);
        };

        let mut removed = 0;
        for record_id in &record_ids {
            if state.metadata.records.remove(record_id).is_some() {
                removed += 1;
            }
            if let Some(key) = state.id_to_key.remove(record_id) {
                state.key_to_id.remove(&key);
                if let Err(e) = state.knn.remove(key) {
                    warn!(namespace = %self.namespace, %record_id, error = %e,
                        "KNN removal failed, metadata row dropped anyway");
                }
            }
        }
        state.dirty = true;
        debug!(namespace = %self.namespace, doc_id, removed, "document removed");
        Ok(removed)
    }

    /// Doc ids whose records carry the given `sourceIdentifier`. Used for
    /// best-effort removal when only the source path is known.
    pub fn doc_ids_for_source(&self, source_identifier: &str) -> Vec<String> {
        let state = self.state.read();
        let mut doc_ids: Vec<String> = state
            .metadata
            .records
            .values()
            .filter(|record| {
                record
                    .metadata()
                    .get("sourceIdentifier")
                    .and_then(serde_json::Value::as_str)
                    == Some(source_identifier)
            })
            .map(|record| record.doc_id.clone())
            .collect();
        doc_ids.sort();
        doc_ids.dedup();
        doc_ids
    }

    /// Record ids for one document (the DocumentVectors bridge).
    pub fn document_vector_ids(&self, doc_id: &str) -> Vec<String> {
        self.state
            .read()
            .metadata
            .doc_vectors
            .get(doc_id)
            .cloned()
            .unwrap_or_default()
    }

    /// KNN search. Returns `(record_id, cosine_distance)` pairs ordered by
    /// ascending distance. The query dimension must match the collection.
    pub fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<(String, f32)>> {
        let state = self.state.read();
        if vector.len() != state.metadata.dimensions {
            return Err(Error::DimensionMismatch {
                namespace: self.namespace.clone(),
                expected: state.metadata.dimensions,
                actual: vector.len(),
            });
        }
        if state.metadata.records.is_empty() {
            return Ok(Vec::new());
        }

        let matches = state
            .knn
            .search(vector, limit)
            .map_err(|e| Error::Serialization(format!("usearch search: {e}")))?;

        let mut results = Vec::with_capacity(matches.keys.len());
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            if let Some(id) = state.key_to_id.get(key) {
                results.push((id.clone(), *distance));
            }
        }
        Ok(results)
    }

    pub fn get_record(&self, record_id: &str) -> Option<StoredRecord> {
        self.state.read().metadata.records.get(record_id).cloned()
    }

    /// Persist the collection if anything changed since the last save.
    pub fn save(&self) -> Result<()> {
        let mut state = self.state.write();
        if !state.dirty {
            return Ok(());
        }
        state.metadata.last_updated = now_secs();
        storage::write_collection(&self.path, &state.metadata, &state.knn)?;
        state.dirty = false;
        Ok(())
    }

    pub fn status(&self) -> CollectionStatus {
        let state = self.state.read();
        let file_size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        CollectionStatus {
            namespace: self.namespace.clone(),
            vector_count: state.metadata.records.len(),
            document_count: state.metadata.doc_vectors.len(),
            dimensions: state.metadata.dimensions,
            last_updated: state.metadata.last_updated,
            file_size,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
