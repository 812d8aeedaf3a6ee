pub mod collection;
pub mod search;
pub mod storage;
pub mod types;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{Error, Result};

pub use collection::Collection;
pub use search::{RerankCandidate, Reranker, SearchOptions, SearchResults, SourceDocument};
pub use types::{CollectionStatus, DistanceMetric, StoredRecord, VectorRecord};

/// Collection-per-namespace vector store rooted at `<storage>/vectordb/`.
///
/// Namespaces are lowercased workspace names; each maps to one collection
/// file. Collections are created lazily on first insert, with the dimension
/// taken from the first batch.
pub struct VectorIndex {
    dir: PathBuf,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

/// Canonical form of a workspace namespace.
pub fn normalize_namespace(namespace: &str) -> String {
    namespace.trim().to_lowercase()
}

impl VectorIndex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            collections: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.collection"))
    }

    /// Fetch an open handle for a namespace, opening from disk on first use.
    pub fn get(&self, namespace: &str) -> Result<Option<Arc<Collection>>> {
        let namespace = normalize_namespace(namespace);
        if let Some(collection) = self.collections.read().get(&namespace) {
            return Ok(Some(Arc::clone(collection)));
        }

        let path = self.path_for(&namespace);
        if !path.exists() {
            return Ok(None);
        }
        let collection = Arc::new(Collection::open(&path, &namespace)?);
        self.collections
            .write()
            .insert(namespace, Arc::clone(&collection));
        Ok(Some(collection))
    }

    fn get_or_create(&self, namespace: &str, dimensions: usize) -> Result<Arc<Collection>> {
        if let Some(collection) = self.get(namespace)? {
            return Ok(collection);
        }
        let namespace = normalize_namespace(namespace);
        std::fs::create_dir_all(&self.dir)?;
        let collection = Arc::new(Collection::create(
            &self.path_for(&namespace),
            &namespace,
            dimensions,
        )?);
        info!(%namespace, dimensions, "collection created");
        self.collections
            .write()
            .insert(namespace, Arc::clone(&collection));
        Ok(collection)
    }

    /// Insert a document's vector records into a namespace and persist.
    ///
    /// The insert is the per-document commit boundary. A serialization
    /// failure on an existing collection is treated as a schema conflict:
    /// the collection is dropped and recreated seeded with this batch.
    pub fn add_document_to_namespace(
        &self,
        namespace: &str,
        records: &[VectorRecord],
    ) -> Result<usize> {
        let Some(first) = records.first() else {
            return Ok(0);
        };
        let collection = self.get_or_create(namespace, first.vector.len())?;

        let added = match collection.add_records(records).and_then(|n| {
            collection.save()?;
            Ok(n)
        }) {
            Ok(n) => n,
            Err(Error::Serialization(message)) => {
                let namespace = normalize_namespace(namespace);
                warn!(
                    %namespace,
                    %message,
                    "schema conflict on insert, dropping and recreating collection"
                );
                self.delete_namespace(&namespace)?;
                let fresh = self.get_or_create(&namespace, first.vector.len())?;
                let n = fresh.add_records(records).map_err(|e| match e {
                    Error::Serialization(m) => Error::SchemaConflict {
                        namespace: namespace.clone(),
                        message: m,
                    },
                    other => other,
                })?;
                fresh.save()?;
                n
            }
            Err(e) => return Err(e),
        };
        Ok(added)
    }

    /// Delete every vector derived from a document. Returns removed count.
    pub fn delete_document_from_namespace(&self, namespace: &str, doc_id: &str) -> Result<usize> {
        let Some(collection) = self.get(namespace)? else {
            return Ok(0);
        };
        let removed = collection.remove_document(doc_id)?;
        if removed > 0 {
            collection.save()?;
        }
        Ok(removed)
    }

    /// Delete every vector whose records carry the given source identifier.
    /// Best-effort path for callers that only know the document's source.
    pub fn delete_source_from_namespace(
        &self,
        namespace: &str,
        source_identifier: &str,
    ) -> Result<usize> {
        let Some(collection) = self.get(namespace)? else {
            return Ok(0);
        };
        let mut removed = 0;
        for doc_id in collection.doc_ids_for_source(source_identifier) {
            removed += collection.remove_document(&doc_id)?;
        }
        if removed > 0 {
            collection.save()?;
        }
        Ok(removed)
    }

    pub fn namespace_exists(&self, namespace: &str) -> bool {
        let namespace = normalize_namespace(namespace);
        self.collections.read().contains_key(&namespace) || self.path_for(&namespace).exists()
    }

    pub fn namespace_count(&self, namespace: &str) -> Result<usize> {
        Ok(self.get(namespace)?.map(|c| c.vector_count()).unwrap_or(0))
    }

    /// Total vectors across every collection on disk.
    pub fn total_vectors(&self) -> Result<usize> {
        let mut total = 0;
        for namespace in self.list_namespaces()? {
            total += self.namespace_count(&namespace)?;
        }
        Ok(total)
    }

    pub fn list_namespaces(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("collection") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Drop a namespace's collection entirely.
    pub fn delete_namespace(&self, namespace: &str) -> Result<()> {
        let namespace = normalize_namespace(namespace);
        self.collections.write().remove(&namespace);
        let path = self.path_for(&namespace);
        if path.exists() {
            std::fs::remove_file(&path)?;
            info!(%namespace, "collection deleted");
        }
        Ok(())
    }

    /// Drop every collection.
    pub fn reset(&self) -> Result<()> {
        for namespace in self.list_namespaces()? {
            self.delete_namespace(&namespace)?;
        }
        self.collections.write().clear();
        Ok(())
    }

    pub fn status(&self, namespace: &str) -> Result<Option<CollectionStatus>> {
        Ok(self.get(namespace)?.map(|c| c.status()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::TempDir;

    fn record(id: &str, doc: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.into(),
            vector,
            text: "t".into(),
            doc_id: doc.into(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn lazy_creation_on_first_insert() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::new(dir.path());
        assert!(!index.namespace_exists("W1"));

        index
            .add_document_to_namespace("W1", &[record("a", "d1", vec![1.0, 0.0])])
            .unwrap();

        // Lowercased namespace, dimension from the first batch.
        assert!(index.namespace_exists("w1"));
        assert_eq!(index.namespace_count("w1").unwrap(), 1);
        assert_eq!(index.get("w1").unwrap().unwrap().dimensions(), 2);
    }

    #[test]
    fn subsequent_inserts_append() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::new(dir.path());
        index
            .add_document_to_namespace("w", &[record("a", "d1", vec![1.0, 0.0])])
            .unwrap();
        index
            .add_document_to_namespace("w", &[record("b", "d2", vec![0.0, 1.0])])
            .unwrap();
        assert_eq!(index.namespace_count("w").unwrap(), 2);
    }

    #[test]
    fn delete_document_is_targeted() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::new(dir.path());
        index
            .add_document_to_namespace(
                "w",
                &[
                    record("a", "d1", vec![1.0, 0.0]),
                    record("b", "d1", vec![0.0, 1.0]),
                ],
            )
            .unwrap();
        index
            .add_document_to_namespace("w", &[record("c", "d2", vec![0.5, 0.5])])
            .unwrap();

        assert_eq!(index.delete_document_from_namespace("w", "d1").unwrap(), 2);
        assert_eq!(index.namespace_count("w").unwrap(), 1);
    }

    #[test]
    fn totals_and_reset() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::new(dir.path());
        index
            .add_document_to_namespace("w1", &[record("a", "d", vec![1.0])])
            .unwrap();
        index
            .add_document_to_namespace("w2", &[record("b", "d", vec![1.0])])
            .unwrap();

        assert_eq!(index.list_namespaces().unwrap(), vec!["w1", "w2"]);
        assert_eq!(index.total_vectors().unwrap(), 2);

        index.reset().unwrap();
        assert_eq!(index.total_vectors().unwrap(), 0);
        assert!(!index.namespace_exists("w1"));
    }

    #[test]
    fn reopen_from_disk_after_cache_eviction() {
        let dir = TempDir::new().unwrap();
        {
            let index = VectorIndex::new(dir.path());
            index
                .add_document_to_namespace("w", &[record("a", "d", vec![1.0, 0.0])])
                .unwrap();
        }
        let fresh = VectorIndex::new(dir.path());
        assert!(fresh.namespace_exists("w"));
        assert_eq!(fresh.namespace_count("w").unwrap(), 1);
    }
}
