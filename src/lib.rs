pub mod bus;
pub mod chunker;
pub mod config;
pub mod document;
pub mod embed_session;
pub mod embedder;
pub mod error;
pub mod index;
pub mod intake;
pub mod logging;
pub mod paths;
pub mod resync;
pub mod store;
pub mod vcache;
pub mod watcher;

pub use error::Error;

// Re-export key public types for convenience.
pub use config::Config;
pub use document::{Document, FileMetadata, FileType, FolderIndex};
pub use embed_session::{EmbedOptions, EmbedProgress, EmbeddingSessionManager};
pub use index::{DistanceMetric, SearchOptions, SearchResults, SourceDocument, VectorRecord};
pub use resync::{ProgressEvent, ResyncOptions, ResyncProgress, SessionStatus};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{ChangeBus, FileAction, FileChange};
use crate::embedder::{
    HttpMultimodalEmbedder, HttpTextEmbedder, HttpVisionDescriber, ImageEmbedder, QueryEmbedder,
    TextEmbedder,
};
use crate::embedder::vision::VisionDescriber;
use crate::index::VectorIndex;
use crate::resync::{FlagProvider, NoFlags, ResyncManager};
use crate::store::{DiskFolderCache, MetadataStore, RedisTier};
use crate::vcache::VectorCache;

/// Primary library handle: the explicitly constructed service graph.
///
/// Every collaborator (store, bus, caches, gateways, session managers) is
/// built here and shared by `Arc`; nothing lives in module globals.
pub struct Mmdex {
    config: Config,
    store: Arc<MetadataStore>,
    bus: Arc<ChangeBus>,
    vcache: Arc<VectorCache>,
    index: Arc<VectorIndex>,
    query_embedder: Arc<QueryEmbedder>,
    resync: Arc<ResyncManager>,
    embed_sessions: Arc<EmbeddingSessionManager>,
}

impl Mmdex {
    /// Open from environment configuration.
    pub async fn open() -> Result<Self> {
        let config = Config::load()?;
        Self::open_with_config(config).await
    }

    /// Open with an explicit configuration. Redis is optional: a failed
    /// connection degrades the store and bus to local-only operation.
    pub async fn open_with_config(config: Config) -> Result<Self> {
        Self::open_with_services(config, None, None, None).await
    }

    /// Open with embedder/describer overrides (used by tests and embedding
    /// setups that do not speak HTTP).
    pub async fn open_with_services(
        config: Config,
        text_embedder: Option<Arc<dyn TextEmbedder>>,
        multimodal: Option<Arc<dyn ImageEmbedder>>,
        describer: Option<Arc<dyn VisionDescriber>>,
    ) -> Result<Self> {
        config.ensure_storage_layout()?;

        let redis = match config.redis_url() {
            Some(url) => match RedisTier::connect(&url).await {
                Ok(tier) => Some(tier),
                Err(e) => {
                    warn!(error = %e, "redis unreachable at startup, running disk-only");
                    None
                }
            },
            None => None,
        };

        let store = Arc::new(MetadataStore::new(
            DiskFolderCache::new(config.folder_cache_dir()),
            redis.clone(),
        ));
        let bus = Arc::new(ChangeBus::new(redis));
        let vcache = Arc::new(VectorCache::new(config.vector_cache_dir()));
        let index = Arc::new(VectorIndex::new(config.vectordb_dir()));

        let text_embedder: Arc<dyn TextEmbedder> = text_embedder.unwrap_or_else(|| {
            Arc::new(HttpTextEmbedder::new(
                config.embedding_base_path.clone(),
                config.embedding_model_pref.clone(),
                config.embedding_model_dim,
            ))
        });

        let multimodal: Option<Arc<dyn ImageEmbedder>> = multimodal.or_else(|| {
            config
                .multimodal
                .is_active()
                .then(|| {
                    Arc::new(HttpMultimodalEmbedder::new(config.multimodal.clone()))
                        as Arc<dyn ImageEmbedder>
                })
        });

        let describer: Option<Arc<dyn VisionDescriber>> = describer.or_else(|| {
            config.image2text_base_path.as_ref().map(|base| {
                Arc::new(HttpVisionDescriber::new(
                    base.clone(),
                    config.image2text_model_pref.clone(),
                )) as Arc<dyn VisionDescriber>
            })
        });

        let query_embedder = Arc::new(QueryEmbedder::new(
            Arc::clone(&text_embedder),
            multimodal.clone(),
        ));

        let resync = Arc::new(ResyncManager::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&vcache),
            Arc::new(NoFlags),
        ));

        let embed_sessions = Arc::new(EmbeddingSessionManager::new(
            config.clone(),
            Arc::clone(&vcache),
            Arc::clone(&index),
            text_embedder,
            multimodal,
            describer,
        ));

        info!(
            storage = %config.storage_dir.display(),
            redis = store.has_redis(),
            multimodal = query_embedder.has_multimodal(),
            "mmdex opened"
        );

        Ok(Self {
            config,
            store,
            bus,
            vcache,
            index,
            query_embedder,
            resync,
            embed_sessions,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    pub fn vector_cache(&self) -> &Arc<VectorCache> {
        &self.vcache
    }

    pub fn vector_index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn resync(&self) -> &Arc<ResyncManager> {
        &self.resync
    }

    pub fn embed_sessions(&self) -> &Arc<EmbeddingSessionManager> {
        &self.embed_sessions
    }

    /// Use a real pinned/watched flag source instead of the default empty one.
    pub fn with_flag_provider(mut self, flags: Arc<dyn FlagProvider>) -> Self {
        self.resync = Arc::new(ResyncManager::new(
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.vcache),
            flags,
        ));
        self
    }

    /// Start the background change-bus plumbing: the Redis forwarder (when
    /// configured) and the metadata-merge consumer.
    pub fn start_change_plumbing(&self, cancel: CancellationToken) {
        self.bus
            .spawn_redis_forwarder(bus::FILE_METADATA_CHANNEL, cancel.clone());
        bus::spawn_metadata_consumer(&self.bus, Arc::clone(&self.store), cancel);
    }

    /// Watch the documents root and publish file changes until cancelled.
    pub async fn watch(&self, cancel: CancellationToken) -> Result<()> {
        let watcher = watcher::DocumentWatcher::new(
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
        );
        watcher.watch(cancel).await
    }

    /// Ingest an uploaded file into a folder: classify, convert, write the
    /// document record, and announce it on the change bus.
    pub async fn ingest_file(
        &self,
        source: &Path,
        original_name: &str,
        folder: &str,
    ) -> Result<PathBuf> {
        let doc = intake::process_file(&self.config, source, original_name).await?;
        let written = intake::write_document(&self.config, folder, &doc)?;
        let file_name = written
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let value = serde_json::to_value(&doc).map_err(|e| Error::Serialization(e.to_string()))?;
        self.store
            .save_file_metadata(folder, &file_name, &value)
            .await?;
        self.bus
            .publish_file_change(&FileChange {
                action: FileAction::Add,
                folder: folder.to_string(),
                file: file_name,
            })
            .await?;
        Ok(written)
    }

    /// Ingest a batch of uploads with bounded concurrency
    /// (`CONCURRENT_OPERATIONS`) and a per-batch timeout that scales with
    /// the configured batch size. Per-file failures are collected, not
    /// fatal.
    pub async fn ingest_batch(
        &self,
        uploads: Vec<(PathBuf, String)>,
        folder: &str,
    ) -> Result<Vec<(String, Result<PathBuf>)>> {
        use futures::stream::{self, StreamExt};

        let timeout =
            std::time::Duration::from_millis(self.config.batch_size as u64 * 180_000);
        let concurrency = self.config.concurrent_operations.max(1);

        let work = stream::iter(uploads.into_iter().map(|(path, name)| async move {
            let outcome = self.ingest_file(&path, &name, folder).await;
            if let Err(e) = &outcome {
                warn!(file = %name, error = %e, "batch ingest item failed");
            }
            (name, outcome)
        }))
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>();

        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| Error::BackendUnavailable {
                backend: "ingest".to_string(),
                message: format!("batch timed out after {}ms", timeout.as_millis()),
            })
    }

    /// Reranked query: wider cosine pool scored by an external cross-encoder.
    pub async fn rerank_search(
        &self,
        namespace: &str,
        query: &str,
        reranker: &dyn index::Reranker,
        options: &SearchOptions,
    ) -> Result<SearchResults> {
        let Some(collection) = self.index.get(namespace)? else {
            return Err(Error::CollectionNotFound(namespace.to_string()));
        };
        let vector = self
            .query_embedder
            .embed_query(query, namespace, Some(collection.dimensions()))
            .await?;
        index::search::rerank_search(&collection, query, &vector, reranker, options).await
    }

    /// Remove a document record and (best-effort) its derived vectors from
    /// the given workspaces.
    pub async fn remove_document(
        &self,
        folder: &str,
        file: &str,
        namespaces: &[String],
    ) -> Result<()> {
        let path = paths::resolve_sandboxed(
            &self.config.documents_dir(),
            &format!("{folder}/{file}"),
        )?;

        // The record's chunkSource addresses its derived vectors; read it
        // before the file goes away.
        let source_identifier = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .and_then(|v| {
                v.get("chunkSource")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
            });

        if path.is_file() {
            std::fs::remove_file(&path)?;
        }
        let full_path = path.display().to_string();
        let _ = self.vcache.purge(&full_path);

        if let Some(source) = source_identifier {
            for namespace in namespaces {
                match self.index.delete_source_from_namespace(namespace, &source) {
                    Ok(removed) if removed > 0 => {
                        info!(%namespace, file, removed, "derived vectors removed");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(%namespace, file, error = %e, "failed to remove derived vectors");
                    }
                }
            }
        }

        self.store.remove_file_from_folder(folder, file).await?;
        self.bus
            .publish_file_change(&FileChange {
                action: FileAction::Remove,
                folder: folder.to_string(),
                file: file.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Query one workspace collection.
    pub async fn search(
        &self,
        namespace: &str,
        query: &str,
        metric: DistanceMetric,
        options: &SearchOptions,
    ) -> Result<SearchResults> {
        let Some(collection) = self.index.get(namespace)? else {
            return Err(Error::CollectionNotFound(namespace.to_string()));
        };
        let vector = self
            .query_embedder
            .embed_query(query, namespace, Some(collection.dimensions()))
            .await?;
        index::search::search_with_metric(&collection, metric, &vector, options).await
    }

    /// Query several workspaces, merging result sets in namespace order.
    pub async fn search_many(
        &self,
        namespaces: &[String],
        query: &str,
        metric: DistanceMetric,
        options: &SearchOptions,
    ) -> Result<SearchResults> {
        let mut merged = SearchResults {
            context_texts: Vec::new(),
            sources: Vec::new(),
        };
        for namespace in namespaces {
            let results = self.search(namespace, query, metric, options).await?;
            merged.context_texts.extend(results.context_texts);
            merged.sources.extend(results.sources);
        }
        Ok(merged)
    }

    /// The local-files tree for the picker, collapsed to a summary when the
    /// serialized payload would exceed `MAX_LOCALFILES_JSON_BYTES`.
    pub async fn localfiles_json(&self) -> Result<serde_json::Value> {
        let mut folders = Vec::new();
        for name in self.store.disk().list()? {
            if let Some((index, _)) = self.store.get_folder(&name).await? {
                folders.push(index);
            }
        }
        // Primary folder first, mirroring the scan ordering.
        if let Some(pos) = folders.iter().position(|f| f.name == resync::PRIMARY_FOLDER) {
            folders[..=pos].rotate_right(1);
        }

        let tree = json!({ "localFiles": { "name": "documents", "type": "folder", "items": folders } });
        let serialized = serde_json::to_string(&tree)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        if serialized.len() as u64 <= self.config.max_localfiles_json_bytes {
            return Ok(tree);
        }

        let total_files: usize = tree["localFiles"]["items"]
            .as_array()
            .map(|folders| {
                folders
                    .iter()
                    .map(|f| f["items"].as_array().map(Vec::len).unwrap_or(0))
                    .sum()
            })
            .unwrap_or(0);
        warn!(
            bytes = serialized.len(),
            limit = self.config.max_localfiles_json_bytes,
            "local files payload oversize, collapsing to summary"
        );
        Ok(json!({
            "localFiles": {
                "name": "documents",
                "type": "folder",
                "collapsed": true,
                "folderCount": tree["localFiles"]["items"].as_array().map(Vec::len).unwrap_or(0),
                "fileCount": total_files,
            }
        }))
    }

    /// Deduplicate helper for callers assembling pinned-document filters.
    pub fn filter_set(identifiers: &[String]) -> HashSet<String> {
        identifiers.iter().cloned().collect()
    }
}
