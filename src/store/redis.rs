use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::{debug, info};

use crate::document::FolderIndex;
use crate::error::{Error, Result};

/// Redis key for a folder index.
pub fn folder_key(folder: &str) -> String {
    format!("mmdex:folder:{folder}")
}

/// Redis key for transient per-file metadata handed between workers.
pub fn file_meta_key(folder: &str, file: &str) -> String {
    format!("mmdex:file:meta:{folder}:{file}")
}

/// Deprecated aggregate key. Kept only so writes to it can be refused;
/// the per-folder indexes are authoritative.
pub const DIRECTORY_KEY: &str = "mmdex:directory";

fn redis_err(e: redis::RedisError) -> Error {
    Error::BackendUnavailable {
        backend: "redis".to_string(),
        message: e.to_string(),
    }
}

/// The Redis tier of the metadata store.
///
/// All failures surface as `BackendUnavailable`; the owning store degrades
/// to disk-only when they occur. Cloning shares the underlying connection
/// manager.
#[derive(Clone)]
pub struct RedisTier {
    manager: ConnectionManager,
    client: redis::Client,
}

impl RedisTier {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(redis_err)?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(redis_err)?;
        info!(url, "connected to redis");
        Ok(Self { manager, client })
    }

    pub async fn get_folder(&self, folder: &str) -> Result<Option<FolderIndex>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(folder_key(folder)).await.map_err(redis_err)?;
        match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(index) => Ok(Some(index)),
                Err(e) => {
                    debug!(folder, error = %e, "unparseable folder index in redis, treating as miss");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn save_folder(&self, folder: &str, index: &FolderIndex) -> Result<()> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(index).map_err(|e| Error::Serialization(e.to_string()))?;
        conn.set::<_, _, ()>(folder_key(folder), json)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    pub async fn delete_folder(&self, folder: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(folder_key(folder)).await.map_err(redis_err)?;
        Ok(())
    }

    /// SET-NX semantics: refuses to overwrite an existing transient key.
    /// Returns whether the write happened.
    pub async fn set_file_meta_nx(&self, folder: &str, file: &str, meta: &Value) -> Result<bool> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(meta).map_err(|e| Error::Serialization(e.to_string()))?;
        let written: bool = conn
            .set_nx(file_meta_key(folder, file), json)
            .await
            .map_err(redis_err)?;
        Ok(written)
    }

    pub async fn get_file_meta(&self, folder: &str, file: &str) -> Result<Option<Value>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .get(file_meta_key(folder, file))
            .await
            .map_err(redis_err)?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }

    pub async fn del_file_meta(&self, folder: &str, file: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(file_meta_key(folder, file))
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    /// Open a dedicated pub/sub connection subscribed to `channel`.
    pub async fn subscribe(&self, channel: &str) -> Result<redis::aio::PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(redis_err)?;
        pubsub.subscribe(channel).await.map_err(redis_err)?;
        Ok(pubsub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_key_shape() {
        assert_eq!(folder_key("custom-documents"), "mmdex:folder:custom-documents");
    }

    #[test]
    fn file_meta_key_shape() {
        assert_eq!(
            file_meta_key("photos", "a.json"),
            "mmdex:file:meta:photos:a.json"
        );
    }
}
