use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::index::types::VectorRecord;

/// On-disk cache of previously computed embeddings, keyed by source path.
///
/// The key is `uuid_v5(URL_NS, full_file_path)`, which is path-stable but
/// not content-stable: renaming a source file orphans its cache entry.
/// Entries are only removed by explicit purge.
pub struct VectorCache {
    dir: PathBuf,
}

/// Derive the cache key for a source file path.
pub fn cache_key(full_path: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, full_path.as_bytes())
}

impl VectorCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, full_path: &str) -> PathBuf {
        self.dir.join(format!("{}.json", cache_key(full_path)))
    }

    /// Cheap existence probe without deserializing the entry.
    pub fn exists(&self, full_path: &str) -> bool {
        self.entry_path(full_path).is_file()
    }

    /// Load the cached records for a source path, if any.
    ///
    /// A corrupt entry is treated as a miss and logged; re-embedding will
    /// overwrite it.
    pub fn lookup(&self, full_path: &str) -> Option<Vec<VectorRecord>> {
        let path = self.entry_path(full_path);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<Vec<VectorRecord>>(&raw) {
            Ok(records) => {
                debug!(source = %full_path, records = records.len(), "vector cache hit");
                Some(records)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt vector cache entry, treating as miss");
                None
            }
        }
    }

    /// Persist the records computed for a source path.
    pub fn store(&self, full_path: &str, records: &[VectorRecord]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.entry_path(full_path);
        let json = serde_json::to_string(records)
            .map_err(|e| crate::error::Error::Serialization(e.to_string()))?;
        std::fs::write(&path, json)?;
        debug!(source = %full_path, records = records.len(), "vector cache stored");
        Ok(())
    }

    /// Remove the cache entry for a source path, if present.
    pub fn purge(&self, full_path: &str) -> Result<bool> {
        let path = self.entry_path(full_path);
        if path.is_file() {
            std::fs::remove_file(&path)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Remove every cache entry.
    pub fn purge_all(&self) -> Result<usize> {
        let mut removed = 0;
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Ok(0);
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Whether any cache entries exist at all.
    pub fn has_cached_files(&self) -> bool {
        std::fs::read_dir(&self.dir)
            .map(|mut entries| {
                entries.any(|e| {
                    e.map(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::TempDir;

    fn record(id: &str) -> VectorRecord {
        VectorRecord {
            id: id.into(),
            vector: vec![0.6, 0.8],
            text: "chunk".into(),
            doc_id: "doc-1".into(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn key_is_deterministic_and_path_sensitive() {
        let a = cache_key("/data/documents/f/a.json");
        let b = cache_key("/data/documents/f/a.json");
        let c = cache_key("/data/documents/f/b.json");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn store_then_lookup_roundtrips() {
        let dir = TempDir::new().unwrap();
        let cache = VectorCache::new(dir.path());
        cache.store("/docs/a.json", &[record("r1"), record("r2")]).unwrap();

        assert!(cache.exists("/docs/a.json"));
        let records = cache.lookup("/docs/a.json").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "r1");
    }

    #[test]
    fn missing_entry_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = VectorCache::new(dir.path());
        assert!(!cache.exists("/docs/never.json"));
        assert!(cache.lookup("/docs/never.json").is_none());
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = VectorCache::new(dir.path());
        let key = cache_key("/docs/bad.json");
        std::fs::write(dir.path().join(format!("{key}.json")), "not json").unwrap();
        assert!(cache.lookup("/docs/bad.json").is_none());
    }

    #[test]
    fn purge_removes_single_entry() {
        let dir = TempDir::new().unwrap();
        let cache = VectorCache::new(dir.path());
        cache.store("/docs/a.json", &[record("r1")]).unwrap();
        assert!(cache.purge("/docs/a.json").unwrap());
        assert!(!cache.exists("/docs/a.json"));
        assert!(!cache.purge("/docs/a.json").unwrap());
    }

    #[test]
    fn purge_all_clears_everything() {
        let dir = TempDir::new().unwrap();
        let cache = VectorCache::new(dir.path());
        cache.store("/docs/a.json", &[record("r1")]).unwrap();
        cache.store("/docs/b.json", &[record("r2")]).unwrap();
        assert!(cache.has_cached_files());
        assert_eq!(cache.purge_all().unwrap(), 2);
        assert!(!cache.has_cached_files());
    }
}
