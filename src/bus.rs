use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::document::FileMetadata;
use crate::error::Result;
use crate::store::{MetadataStore, RedisTier};

/// Channel carrying per-file metadata updates from the ingestion worker to
/// the index worker.
pub const FILE_METADATA_CHANNEL: &str = "file:metadata:updates";

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Add,
    Remove,
}

/// Message published on [`FILE_METADATA_CHANNEL`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub action: FileAction,
    pub folder: String,
    pub file: String,
}

/// In-process pub/sub with named channels and an optional Redis transport.
///
/// When Redis is configured the same JSON payloads cross the process
/// boundary unchanged; the bus stays fully usable without it.
pub struct ChangeBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    redis: Option<RedisTier>,
}

impl ChangeBus {
    pub fn new(redis: Option<RedisTier>) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            redis,
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Subscribe to a named channel. Messages are raw JSON payloads.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }

    /// Publish a raw payload locally and, when configured, over Redis.
    pub async fn publish_raw(&self, channel: &str, payload: &str) -> Result<()> {
        // A send error only means nobody is subscribed right now.
        let _ = self.sender(channel).send(payload.to_string());
        if let Some(redis) = &self.redis {
            if let Err(e) = redis.publish(channel, payload).await {
                warn!(channel, error = %e, "redis publish failed, local delivery only");
            }
        }
        Ok(())
    }

    /// Publish a file change on the metadata channel.
    pub async fn publish_file_change(&self, change: &FileChange) -> Result<()> {
        let payload = serde_json::to_string(change)
            .map_err(|e| crate::error::Error::Serialization(e.to_string()))?;
        debug!(?change, "publishing file change");
        self.publish_raw(FILE_METADATA_CHANNEL, &payload).await
    }

    /// Forward messages arriving on the Redis side of a channel into the
    /// local broadcast, until cancelled. No-op when Redis is absent.
    pub fn spawn_redis_forwarder(&self, channel: &'static str, cancel: CancellationToken) {
        let Some(redis) = self.redis.clone() else {
            return;
        };
        let sender = self.sender(channel);
        tokio::spawn(async move {
            let mut pubsub = match redis.subscribe(channel).await {
                Ok(p) => p,
                Err(e) => {
                    error!(channel, error = %e, "cannot subscribe redis channel");
                    return;
                }
            };
            info!(channel, "forwarding redis channel into local bus");
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    msg = stream.next() => {
                        let Some(msg) = msg else { break };
                        if let Ok(payload) = msg.get_payload::<String>() {
                            let _ = sender.send(payload);
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!(channel, "redis forwarder stopped");
        });
    }
}

/// Consume [`FILE_METADATA_CHANNEL`] and keep folder indexes coherent.
///
/// `add`: load the transient metadata key, merge it into the folder index
/// by `name` (folder level only, last-write-wins), then delete the key.
/// `remove`: drop the item from the folder index. Both are idempotent.
pub fn spawn_metadata_consumer(
    bus: &Arc<ChangeBus>,
    store: Arc<MetadataStore>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe(FILE_METADATA_CHANNEL);
    tokio::spawn(async move {
        loop {
            let payload = tokio::select! {
                received = rx.recv() => match received {
                    Ok(payload) => payload,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "metadata consumer lagged, messages dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = cancel.cancelled() => break,
            };

            let change: FileChange = match serde_json::from_str(&payload) {
                Ok(change) => change,
                Err(e) => {
                    warn!(error = %e, %payload, "unparseable file change, skipping");
                    continue;
                }
            };

            if let Err(e) = apply_file_change(&store, &change).await {
                error!(folder = %change.folder, file = %change.file, error = %e,
                    "failed to apply file change");
            }
        }
        debug!("metadata consumer stopped");
    })
}

async fn apply_file_change(store: &MetadataStore, change: &FileChange) -> Result<()> {
    match change.action {
        FileAction::Add => {
            let Some(meta) = store.get_file_metadata(&change.folder, &change.file).await? else {
                debug!(folder = %change.folder, file = %change.file,
                    "no transient metadata for add, already consumed");
                return Ok(());
            };
            let mtime_ms = meta.get("mtimeMs").and_then(|v| v.as_u64()).unwrap_or(0);
            let size = meta.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
            match FileMetadata::from_disk_json(&change.file, &meta, mtime_ms, size) {
                Some(entry) => {
                    store.add_file_to_folder(&change.folder, entry).await?;
                }
                None => {
                    warn!(folder = %change.folder, file = %change.file,
                        "transient metadata missing required fields, not merged");
                }
            }
            store.delete_file_metadata(&change.folder, &change.file).await?;
        }
        FileAction::Remove => {
            store.remove_file_from_folder(&change.folder, &change.file).await?;
        }
    }
    Ok(())
}
