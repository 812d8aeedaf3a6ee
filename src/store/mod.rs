pub mod disk;
pub mod redis;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::document::{FileMetadata, FolderIndex};
use crate::error::{Error, Result};

pub use disk::DiskFolderCache;
pub use redis::RedisTier;

/// Which cache tier answered a folder lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Redis,
    Disk,
}

/// Two-tier per-folder metadata store: Redis in front, disk mirror behind.
///
/// Redis unavailability degrades the store to disk-only; reads fall through
/// and writes keep landing on disk. The first failure is logged at WARN,
/// later ones at DEBUG to keep a flapping backend from flooding the log.
pub struct MetadataStore {
    disk: DiskFolderCache,
    redis: Option<RedisTier>,
    redis_warned: AtomicBool,
    /// Transient per-file metadata handoff when Redis is absent.
    local_meta: Mutex<HashMap<String, Value>>,
}

impl MetadataStore {
    pub fn new(disk: DiskFolderCache, redis: Option<RedisTier>) -> Self {
        Self {
            disk,
            redis,
            redis_warned: AtomicBool::new(false),
            local_meta: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_redis(&self) -> bool {
        self.redis.is_some()
    }

    fn note_redis_failure(&self, op: &str, err: &Error) {
        if !self.redis_warned.swap(true, Ordering::Relaxed) {
            warn!(op, error = %err, "redis unavailable, degrading to disk-only");
        } else {
            debug!(op, error = %err, "redis still unavailable");
        }
    }

    /// Look up a folder index: Redis first, then the disk mirror.
    ///
    /// A Redis hit is synced down to disk so the tiers converge; a Redis
    /// failure falls through to disk.
    pub async fn get_folder(&self, folder: &str) -> Result<Option<(FolderIndex, CacheTier)>> {
        if let Some(redis) = &self.redis {
            match redis.get_folder(folder).await {
                Ok(Some(index)) => {
                    if let Err(e) = self.disk.save(folder, &index) {
                        warn!(folder, error = %e, "failed to sync redis folder index to disk");
                    }
                    return Ok(Some((index, CacheTier::Redis)));
                }
                Ok(None) => {}
                Err(e) => self.note_redis_failure("get_folder", &e),
            }
        }
        Ok(self.disk.load(folder)?.map(|index| (index, CacheTier::Disk)))
    }

    /// Persist a folder index to both tiers, stripping payload fields from
    /// every item first.
    pub async fn save_folder(&self, folder: &str, mut index: FolderIndex) -> Result<()> {
        index.strip_items();
        self.disk.save(folder, &index)?;
        if let Some(redis) = &self.redis {
            if let Err(e) = redis.save_folder(folder, &index).await {
                self.note_redis_failure("save_folder", &e);
            }
        }
        Ok(())
    }

    /// Insert or replace one file entry in a folder index (idempotent on
    /// item `name`) and persist both tiers.
    pub async fn add_file_to_folder(&self, folder: &str, item: FileMetadata) -> Result<()> {
        let mut index = match self.get_folder(folder).await? {
            Some((index, _)) => index,
            None => FolderIndex::new(folder),
        };
        index.upsert_item(item);
        self.save_folder(folder, index).await
    }

    /// Remove one file entry from a folder index and persist both tiers.
    /// Returns whether an entry was removed.
    pub async fn remove_file_from_folder(&self, folder: &str, file: &str) -> Result<bool> {
        let Some((mut index, _)) = self.get_folder(folder).await? else {
            return Ok(false);
        };
        let removed = index.remove_item(file);
        if removed {
            self.save_folder(folder, index).await?;
        }
        Ok(removed)
    }

    /// Delete a folder index from both tiers.
    pub async fn delete_folder(&self, folder: &str) -> Result<()> {
        self.disk.remove(folder)?;
        if let Some(redis) = &self.redis {
            if let Err(e) = redis.delete_folder(folder).await {
                self.note_redis_failure("delete_folder", &e);
            }
        }
        Ok(())
    }

    /// Stash transient per-file metadata for a downstream consumer.
    ///
    /// Refuses to overwrite an existing key (cheap dedup for bursty
    /// publishers); the consumer deletes the key after merging. Returns
    /// whether the write happened.
    pub async fn save_file_metadata(&self, folder: &str, file: &str, meta: &Value) -> Result<bool> {
        if let Some(redis) = &self.redis {
            match redis.set_file_meta_nx(folder, file, meta).await {
                Ok(written) => return Ok(written),
                Err(e) => self.note_redis_failure("save_file_metadata", &e),
            }
        }
        let key = redis::file_meta_key(folder, file);
        let mut local = self.local_meta.lock();
        if local.contains_key(&key) {
            return Ok(false);
        }
        local.insert(key, meta.clone());
        Ok(true)
    }

    pub async fn get_file_metadata(&self, folder: &str, file: &str) -> Result<Option<Value>> {
        if let Some(redis) = &self.redis {
            match redis.get_file_meta(folder, file).await {
                Ok(found) => return Ok(found),
                Err(e) => self.note_redis_failure("get_file_metadata", &e),
            }
        }
        let key = redis::file_meta_key(folder, file);
        Ok(self.local_meta.lock().get(&key).cloned())
    }

    pub async fn delete_file_metadata(&self, folder: &str, file: &str) -> Result<()> {
        if let Some(redis) = &self.redis {
            match redis.del_file_meta(folder, file).await {
                Ok(()) => return Ok(()),
                Err(e) => self.note_redis_failure("delete_file_metadata", &e),
            }
        }
        let key = redis::file_meta_key(folder, file);
        self.local_meta.lock().remove(&key);
        Ok(())
    }

    /// The legacy whole-tree aggregate dump. Deliberately a no-op: the
    /// per-folder indexes are authoritative and the aggregate caused
    /// O(whole-tree) memory spikes.
    pub async fn save_directory_aggregate(&self, _tree: &Value) -> Result<()> {
        debug!(key = redis::DIRECTORY_KEY, "aggregate directory dump is disabled, ignoring write");
        Ok(())
    }

    pub fn disk(&self) -> &DiskFolderCache {
        &self.disk
    }

    pub fn redis_tier(&self) -> Option<&RedisTier> {
        self.redis.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, MetadataStore) {
        let dir = TempDir::new().unwrap();
        let disk = DiskFolderCache::new(dir.path());
        (dir, MetadataStore::new(disk, None))
    }

    fn entry(name: &str) -> FileMetadata {
        let value = json!({
            "url": format!("file:///{name}"),
            "title": name,
            "docAuthor": "Unknown",
            "description": "d",
            "docSource": "local",
            "chunkSource": format!("localfile://{name}"),
            "published": "2024-01-01",
            "wordCount": 1,
            "pageContent": "SECRET",
            "imageBase64": "AAAA"
        });
        FileMetadata::from_disk_json(name, &value, 1, 2).unwrap()
    }

    #[tokio::test]
    async fn save_folder_strips_payload_fields() {
        let (_dir, store) = store();
        let mut index = FolderIndex::new("f");
        let mut item = entry("a.json");
        // Simulate a payload field that leaked into the extras.
        item.extra
            .insert("pageContent".into(), Value::String("SECRET".into()));
        index.items.push(item);

        store.save_folder("f", index).await.unwrap();

        let (loaded, tier) = store.get_folder("f").await.unwrap().unwrap();
        assert_eq!(tier, CacheTier::Disk);
        assert!(!loaded.items[0].extra.contains_key("pageContent"));
        assert!(!loaded.items[0].extra.contains_key("imageBase64"));
    }

    #[tokio::test]
    async fn add_file_is_idempotent_by_name() {
        let (_dir, store) = store();
        store.add_file_to_folder("f", entry("a.json")).await.unwrap();
        store.add_file_to_folder("f", entry("a.json")).await.unwrap();

        let (loaded, _) = store.get_folder("f").await.unwrap().unwrap();
        assert_eq!(loaded.items.len(), 1);
    }

    #[tokio::test]
    async fn remove_file_from_folder_persists() {
        let (_dir, store) = store();
        store.add_file_to_folder("f", entry("a.json")).await.unwrap();
        assert!(store.remove_file_from_folder("f", "a.json").await.unwrap());
        assert!(!store.remove_file_from_folder("f", "a.json").await.unwrap());

        let (loaded, _) = store.get_folder("f").await.unwrap().unwrap();
        assert!(loaded.items.is_empty());
    }

    #[tokio::test]
    async fn transient_metadata_refuses_overwrite() {
        let (_dir, store) = store();
        let first = store
            .save_file_metadata("f", "a.json", &json!({"v": 1}))
            .await
            .unwrap();
        let second = store
            .save_file_metadata("f", "a.json", &json!({"v": 2}))
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        let got = store.get_file_metadata("f", "a.json").await.unwrap().unwrap();
        assert_eq!(got["v"], 1);
    }

    #[tokio::test]
    async fn transient_metadata_consumed_then_deleted() {
        let (_dir, store) = store();
        store
            .save_file_metadata("f", "a.json", &json!({"v": 1}))
            .await
            .unwrap();
        store.delete_file_metadata("f", "a.json").await.unwrap();
        assert!(store.get_file_metadata("f", "a.json").await.unwrap().is_none());
        // The key is free again after consumption.
        assert!(store
            .save_file_metadata("f", "a.json", &json!({"v": 3}))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn aggregate_dump_is_a_noop() {
        let (_dir, store) = store();
        store
            .save_directory_aggregate(&json!({"huge": "tree"}))
            .await
            .unwrap();
        // Nothing observable; the call just must not fail or write.
        assert!(store.get_folder("huge").await.unwrap().is_none());
    }
}
