use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunker;
use crate::config::Config;
use crate::document::{Document, FileType};
use crate::embedder::vision::VisionDescriber;
use crate::embedder::{ImageEmbedder, TextEmbedder};
use crate::error::{Error, Result};
use crate::index::types::VectorRecord;
use crate::index::VectorIndex;
use crate::resync::session::{now_ms, ControlRequest, SessionError, SessionStatus};
use crate::resync::ProgressEvent;
use crate::vcache::VectorCache;

const EVENT_CAPACITY: usize = 512;

/// Embedding mode recorded on directly embedded image vectors.
pub const MODE_MULTIMODAL_DIRECT: &str = "multimodal_direct";

/// Historical empty `chunkSource` values are repaired to this.
const REPAIRED_CHUNK_SOURCE: &str = "image-upload";

/// Options for starting an embedding session.
#[derive(Debug, Clone, Default)]
pub struct EmbedOptions {
    /// Re-embed even when a vector-cache entry exists.
    pub force_re_embed: bool,
    /// Optional prefix prepended to every text chunk (e.g. an instruct tag).
    pub prefix: Option<String>,
}

/// Progress snapshot of one embedding session.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedProgress {
    pub id: String,
    #[serde(rename = "workspaceId")]
    pub workspace_id: String,
    #[serde(rename = "workspaceName")]
    pub workspace_name: String,
    #[serde(rename = "documentPaths")]
    pub document_paths: Vec<String>,
    #[serde(rename = "currentIndex")]
    pub current_index: usize,
    pub embedded: Vec<String>,
    pub failed: Vec<String>,
    pub errors: Vec<SessionError>,
    pub status: SessionStatus,
    #[serde(rename = "forceReEmbed")]
    pub force_re_embed: bool,
    #[serde(rename = "startTime")]
    pub start_time: u64,
    #[serde(rename = "endTime")]
    pub end_time: Option<u64>,
}

impl EmbedProgress {
    pub fn progress_percent(&self) -> u8 {
        if self.document_paths.is_empty() {
            return 100;
        }
        ((self.current_index * 100) / self.document_paths.len()).min(100) as u8
    }
}

/// One workspace's embedding session: snapshot plus the control channel
/// observed between documents.
pub struct EmbeddingSession {
    progress: RwLock<EmbedProgress>,
    control_tx: watch::Sender<ControlRequest>,
    control_rx: watch::Receiver<ControlRequest>,
}

impl EmbeddingSession {
    fn new(
        workspace_id: String,
        workspace_name: String,
        document_paths: Vec<String>,
        force_re_embed: bool,
    ) -> Self {
        let (control_tx, control_rx) = watch::channel(ControlRequest::Run);
        Self {
            progress: RwLock::new(EmbedProgress {
                id: Uuid::new_v4().to_string(),
                workspace_id,
                workspace_name,
                document_paths,
                current_index: 0,
                embedded: Vec::new(),
                failed: Vec::new(),
                errors: Vec::new(),
                status: SessionStatus::Running,
                force_re_embed,
                start_time: now_ms(),
                end_time: None,
            }),
            control_tx,
            control_rx,
        }
    }

    pub fn snapshot(&self) -> EmbedProgress {
        self.progress.read().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.progress.read().status
    }

    fn update<F: FnOnce(&mut EmbedProgress)>(&self, f: F) {
        f(&mut self.progress.write());
    }

    fn set_status(&self, status: SessionStatus) {
        let mut progress = self.progress.write();
        progress.status = status;
        if status.is_terminal() {
            progress.end_time = Some(now_ms());
        }
    }

    pub fn pause(&self) {
        let _ = self.control_tx.send(ControlRequest::Pause);
    }

    pub fn resume(&self) {
        let _ = self.control_tx.send(ControlRequest::Run);
    }

    pub fn cancel(&self) {
        let _ = self.control_tx.send(ControlRequest::Cancel);
    }

    fn request(&self) -> ControlRequest {
        *self.control_rx.borrow()
    }

    async fn wait_while_paused(&self) -> ControlRequest {
        let mut rx = self.control_rx.clone();
        loop {
            let current = *rx.borrow();
            if current != ControlRequest::Pause {
                return current;
            }
            if rx.changed().await.is_err() {
                return ControlRequest::Cancel;
            }
        }
    }
}

/// Owns per-workspace embedding sessions; at most one active per workspace.
pub struct EmbeddingSessionManager {
    config: Config,
    vcache: Arc<VectorCache>,
    index: Arc<VectorIndex>,
    text_embedder: Arc<dyn TextEmbedder>,
    multimodal: Option<Arc<dyn ImageEmbedder>>,
    describer: Option<Arc<dyn VisionDescriber>>,
    sessions: RwLock<HashMap<String, Arc<EmbeddingSession>>>,
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
    events: broadcast::Sender<ProgressEvent>,
}

impl EmbeddingSessionManager {
    pub fn new(
        config: Config,
        vcache: Arc<VectorCache>,
        index: Arc<VectorIndex>,
        text_embedder: Arc<dyn TextEmbedder>,
        multimodal: Option<Arc<dyn ImageEmbedder>>,
        describer: Option<Arc<dyn VisionDescriber>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            vcache,
            index,
            text_embedder,
            multimodal,
            describer,
            sessions: RwLock::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Start embedding documents into a workspace. Rejects a second
    /// concurrent session for the same workspace.
    pub fn start(
        &self,
        workspace_id: &str,
        workspace_name: &str,
        document_paths: Vec<PathBuf>,
        options: EmbedOptions,
    ) -> Result<String> {
        {
            let sessions = self.sessions.read();
            if let Some(existing) = sessions.get(workspace_id) {
                if !existing.status().is_terminal() {
                    return Err(Error::SessionConflict {
                        workspace: workspace_name.to_string(),
                    });
                }
            }
        }

        let paths: Vec<String> = document_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let session = Arc::new(EmbeddingSession::new(
            workspace_id.to_string(),
            workspace_name.to_string(),
            paths,
            options.force_re_embed,
        ));
        let session_id = session.snapshot().id;
        self.sessions
            .write()
            .insert(workspace_id.to_string(), Arc::clone(&session));

        let worker = SessionWorker {
            config: self.config.clone(),
            vcache: Arc::clone(&self.vcache),
            index: Arc::clone(&self.index),
            text_embedder: Arc::clone(&self.text_embedder),
            multimodal: self.multimodal.clone(),
            describer: self.describer.clone(),
            events: self.events.clone(),
            namespace: crate::index::normalize_namespace(workspace_name),
            options,
        };
        let handle = tokio::spawn(worker.run(Arc::clone(&session)));
        self.handles.lock().insert(session_id.clone(), handle);

        info!(
            session = %session_id,
            workspace = workspace_name,
            documents = document_paths.len(),
            "embedding session started"
        );
        Ok(session_id)
    }

    fn session_by_id(&self, session_id: &str) -> Result<Arc<EmbeddingSession>> {
        self.sessions
            .read()
            .values()
            .find(|s| s.snapshot().id == session_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    pub fn status(&self, session_id: &str) -> Result<EmbedProgress> {
        Ok(self.session_by_id(session_id)?.snapshot())
    }

    pub fn pause(&self, session_id: &str) -> Result<()> {
        self.session_by_id(session_id)?.pause();
        Ok(())
    }

    pub fn resume(&self, session_id: &str) -> Result<()> {
        self.session_by_id(session_id)?.resume();
        Ok(())
    }

    pub fn cancel(&self, session_id: &str) -> Result<()> {
        self.session_by_id(session_id)?.cancel();
        Ok(())
    }

    /// Wait for a session's worker to finish.
    pub async fn wait(&self, session_id: &str) -> Result<EmbedProgress> {
        let handle = self.handles.lock().remove(session_id);
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| Error::Serialization(format!("embed worker panicked: {e}")))?;
        }
        self.status(session_id)
    }

    /// Drop terminal sessions older than the retention window.
    pub fn prune_finished(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        let cutoff = crate::resync::SESSION_RETENTION.as_millis() as u64;
        sessions.retain(|_, s| {
            let p = s.snapshot();
            match (p.status.is_terminal(), p.end_time) {
                (true, Some(end)) => now_ms().saturating_sub(end) < cutoff,
                _ => true,
            }
        });
        before - sessions.len()
    }
}

/// Everything one session worker needs, cloned out of the manager.
struct SessionWorker {
    config: Config,
    vcache: Arc<VectorCache>,
    index: Arc<VectorIndex>,
    text_embedder: Arc<dyn TextEmbedder>,
    multimodal: Option<Arc<dyn ImageEmbedder>>,
    describer: Option<Arc<dyn VisionDescriber>>,
    events: broadcast::Sender<ProgressEvent>,
    namespace: String,
    options: EmbedOptions,
}

impl SessionWorker {
    async fn run(self, session: Arc<EmbeddingSession>) {
        let snapshot = session.snapshot();
        let session_id = snapshot.id.clone();

        for (i, path) in snapshot.document_paths.iter().enumerate() {
            // Control requests are observed between documents only; the
            // per-document insert is the commit boundary.
            match session.request() {
                ControlRequest::Pause => {
                    session.set_status(SessionStatus::Paused);
                    let _ = self.events.send(ProgressEvent::Paused {
                        session_id: session_id.clone(),
                    });
                    if session.wait_while_paused().await == ControlRequest::Cancel {
                        session.set_status(SessionStatus::Cancelled);
                        let _ = self.events.send(ProgressEvent::Cancelled {
                            session_id: session_id.clone(),
                        });
                        return;
                    }
                    session.set_status(SessionStatus::Running);
                }
                ControlRequest::Cancel => {
                    session.set_status(SessionStatus::Cancelled);
                    let _ = self.events.send(ProgressEvent::Cancelled {
                        session_id: session_id.clone(),
                    });
                    return;
                }
                ControlRequest::Run => {}
            }

            match self.process_document(Path::new(path)).await {
                Ok(()) => session.update(|p| p.embedded.push(path.clone())),
                Err(e) => {
                    let fatal = matches!(e, Error::DimensionMismatch { .. });
                    warn!(document = %path, error = %e, "document embedding failed");
                    session.update(|p| {
                        p.failed.push(path.clone());
                        p.errors.push(SessionError {
                            file: path.clone(),
                            phase: "embed".to_string(),
                            message: e.to_string(),
                        });
                    });
                    if fatal {
                        // A wrong-dimension embedder will fail every
                        // remaining document the same way.
                        error!(session = %session_id, error = %e, "fatal session error");
                        session.set_status(SessionStatus::Failed);
                        let _ = self.events.send(ProgressEvent::Failed {
                            session_id: session_id.clone(),
                            error: e.to_string(),
                        });
                        return;
                    }
                }
            }

            session.update(|p| p.current_index = i + 1);
            let progress = session.snapshot();
            let _ = self.events.send(ProgressEvent::Progress {
                session_id: session_id.clone(),
                files_processed: progress.current_index as u64,
                total_files: progress.document_paths.len() as u64,
                progress: progress.progress_percent(),
            });
        }

        session.set_status(SessionStatus::Completed);
        let final_state = session.snapshot();
        info!(
            session = %session_id,
            embedded = final_state.embedded.len(),
            failed = final_state.failed.len(),
            "embedding session completed"
        );
        let _ = self.events.send(ProgressEvent::Complete { session_id });
    }

    async fn process_document(&self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path).map_err(|_| Error::DocumentNotFound {
            path: path.to_path_buf(),
        })?;
        let doc = Document::from_json(path, &raw)?;
        let doc_id = Uuid::new_v4().to_string();
        let full_path = path.display().to_string();

        // Vector-cache hit: re-ingestion without touching the embedder.
        if !self.options.force_re_embed {
            if let Some(cached) = self.vcache.lookup(&full_path) {
                let records: Vec<VectorRecord> = cached
                    .into_iter()
                    .map(|mut record| {
                        record.id = Uuid::new_v4().to_string();
                        record.doc_id = doc_id.clone();
                        record
                    })
                    .collect();
                self.index
                    .add_document_to_namespace(&self.namespace, &records)?;
                debug!(document = %full_path, records = records.len(), "reused cached vectors");
                return Ok(());
            }
        }

        let records = match doc.file_type {
            FileType::Text => self.embed_text_document(&doc, &doc_id).await?,
            FileType::Image => self.embed_image_document(&doc, &doc_id).await?,
        };

        self.index
            .add_document_to_namespace(&self.namespace, &records)?;
        self.vcache.store(&full_path, &records)?;
        Ok(())
    }

    async fn embed_text_document(&self, doc: &Document, doc_id: &str) -> Result<Vec<VectorRecord>> {
        let chunks = chunker::chunks_for_document(
            doc,
            self.config.chunk_size,
            self.config.chunk_overlap,
            self.options.prefix.as_deref(),
        );
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let vectors = self.text_embedder.embed_batch(&chunks).await?;
        let metadata = document_metadata(doc, None);
        Ok(chunks
            .into_iter()
            .zip(vectors)
            .map(|(text, vector)| VectorRecord {
                id: Uuid::new_v4().to_string(),
                vector,
                text,
                doc_id: doc_id.to_string(),
                metadata: metadata.clone(),
            })
            .collect())
    }

    /// Image path: direct multimodal embedding with an AI caption when the
    /// multimodal embedder is available, otherwise caption + filename as
    /// two text chunks through the standard embedder.
    async fn embed_image_document(
        &self,
        doc: &Document,
        doc_id: &str,
    ) -> Result<Vec<VectorRecord>> {
        let caption = self.caption_for(doc).await;

        if let Some(multimodal) = &self.multimodal {
            match multimodal.embed_image(&doc.page_content, &caption).await {
                Ok(vector) => {
                    let metadata = document_metadata(doc, Some(MODE_MULTIMODAL_DIRECT));
                    return Ok(vec![VectorRecord {
                        id: Uuid::new_v4().to_string(),
                        vector,
                        text: caption,
                        doc_id: doc_id.to_string(),
                        metadata,
                    }]);
                }
                Err(e) => {
                    warn!(
                        document = %doc.title,
                        error = %e,
                        "multimodal embedding failed, falling back to text embedding"
                    );
                }
            }
        }

        // Fallback: filename + caption as two text chunks.
        let texts = vec![doc.title.clone(), caption];
        let vectors = self.text_embedder.embed_batch(&texts).await?;
        let metadata = document_metadata(doc, None);
        Ok(texts
            .into_iter()
            .zip(vectors)
            .map(|(text, vector)| VectorRecord {
                id: Uuid::new_v4().to_string(),
                vector,
                text,
                doc_id: doc_id.to_string(),
                metadata: metadata.clone(),
            })
            .collect())
    }

    /// Get an AI caption for an image, falling back to the deterministic
    /// EXIF-based description when the describer is absent or fails.
    async fn caption_for(&self, doc: &Document) -> String {
        if let Some(describer) = &self.describer {
            let mut results = describer
                .describe_images(
                    std::slice::from_ref(&doc.page_content),
                    std::slice::from_ref(&doc.description),
                )
                .await;
            if let Some(Ok(caption)) = results.pop() {
                if !caption.trim().is_empty() {
                    return caption;
                }
            }
            warn!(document = %doc.title, "vision caption unavailable, using built description");
        }
        doc.description.clone()
    }
}

/// Flatten document fields into record metadata.
///
/// Empty strings are stripped, a historically empty `chunkSource` is
/// repaired, and image documents keep their base64 payload for the UI.
fn document_metadata(doc: &Document, embedding_mode: Option<&str>) -> Map<String, Value> {
    let mut metadata = Map::new();
    fn put(metadata: &mut Map<String, Value>, key: &str, value: &str) {
        if !value.is_empty() {
            metadata.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    put(&mut metadata, "title", &doc.title);
    put(&mut metadata, "url", &doc.url);
    put(&mut metadata, "docAuthor", &doc.doc_author);
    put(&mut metadata, "description", &doc.description);
    put(&mut metadata, "docSource", &doc.doc_source);
    put(&mut metadata, "published", &doc.published);
    let chunk_source = if doc.chunk_source.is_empty() {
        REPAIRED_CHUNK_SOURCE
    } else {
        &doc.chunk_source
    };
    put(&mut metadata, "chunkSource", chunk_source);
    put(&mut metadata, "sourceIdentifier", chunk_source);

    metadata.insert("wordCount".into(), Value::from(doc.word_count));
    metadata.insert(
        "token_count_estimate".into(),
        Value::from(doc.token_count_estimate),
    );

    match embedding_mode {
        Some(mode) => {
            metadata.insert("embeddingMode".into(), Value::String(mode.to_string()));
        }
        None if !doc.embedding_mode.is_empty() => {
            metadata.insert(
                "embeddingMode".into(),
                Value::String(doc.embedding_mode.clone()),
            );
        }
        None => {}
    }

    if doc.file_type == FileType::Image {
        metadata.insert("fileType".into(), Value::String("image".into()));
        if !doc.page_content.is_empty() {
            metadata.insert("imageBase64".into(), Value::String(doc.page_content.clone()));
        }
        if let Some(blur_hash) = &doc.blur_hash {
            put(&mut metadata, "blurHash", blur_hash);
        }
        if let Some(camera) = &doc.camera {
            put(&mut metadata, "camera", camera);
        }
        if let Some(lens) = &doc.lens {
            put(&mut metadata, "lens", lens);
        }
        if let Some(location) = &doc.location {
            put(&mut metadata, "location", location);
        }
        if let Some(settings) = &doc.camera_settings {
            put(&mut metadata, "cameraSettings", settings);
        }
    }

    metadata
}
