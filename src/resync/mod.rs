pub mod scan;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::document::FolderIndex;
use crate::error::{Error, Result};
use crate::store::MetadataStore;
use crate::vcache::VectorCache;

pub use scan::{FlagProvider, ItemFlags, NoFlags, Scanner, PRIMARY_FOLDER};
pub use session::{
    ControlRequest, ResyncProgress, ResyncSession, SessionError, SessionMetrics, SessionStatus,
};

/// Terminal sessions are pruned this long after they end.
pub const SESSION_RETENTION: Duration = Duration::from_secs(3600);

const EVENT_CAPACITY: usize = 512;

/// Progress events emitted over the session event stream. The `event` tag
/// doubles as the SSE event name.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ProgressEvent {
    Progress {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "filesProcessed")]
        files_processed: u64,
        #[serde(rename = "totalFiles")]
        total_files: u64,
        progress: u8,
    },
    BatchComplete {
        #[serde(rename = "sessionId")]
        session_id: String,
        folder: String,
        batch: u64,
        #[serde(rename = "totalBatches")]
        total_batches: u64,
        #[serde(rename = "filesInBatch")]
        files_in_batch: u64,
        #[serde(rename = "batchMs")]
        batch_ms: u64,
        status: SessionStatus,
    },
    Complete {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Failed {
        #[serde(rename = "sessionId")]
        session_id: String,
        error: String,
    },
    Paused {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Cancelled {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

/// Options for starting a resync session.
#[derive(Debug, Clone, Default)]
pub struct ResyncOptions {
    /// Batch size override; defaults to the configured `BATCH_SIZE`.
    pub batch_size: Option<usize>,
    /// Ignore caches and rescan everything.
    pub force_refresh: bool,
    /// Restrict the scan to a single folder.
    pub folder_filter: Option<String>,
}

/// Owns resync sessions: at most one active at a time, each driven by a
/// worker task that only observes control requests at batch boundaries.
pub struct ResyncManager {
    config: Config,
    store: Arc<MetadataStore>,
    vcache: Arc<VectorCache>,
    flags: Arc<dyn FlagProvider>,
    sessions: RwLock<HashMap<String, Arc<ResyncSession>>>,
    handles: Mutex<HashMap<String, JoinHandle<Result<Vec<FolderIndex>>>>>,
    events: broadcast::Sender<ProgressEvent>,
}

impl ResyncManager {
    pub fn new(
        config: Config,
        store: Arc<MetadataStore>,
        vcache: Arc<VectorCache>,
        flags: Arc<dyn FlagProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            store,
            vcache,
            flags,
            sessions: RwLock::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to the progress event stream (the SSE source).
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Start a new scan session. Rejects a second concurrent session.
    pub fn start(&self, options: ResyncOptions) -> Result<String> {
        {
            let sessions = self.sessions.read();
            if let Some(active) = sessions.values().find(|s| !s.status().is_terminal()) {
                return Err(Error::SessionConflict {
                    workspace: format!("resync:{}", active.snapshot().session_id),
                });
            }
        }

        let session_id = Uuid::new_v4().to_string();
        let session = Arc::new(ResyncSession::new(
            session_id.clone(),
            options.batch_size.unwrap_or(self.config.batch_size),
            options.force_refresh,
            options.folder_filter,
        ));
        self.sessions
            .write()
            .insert(session_id.clone(), Arc::clone(&session));

        let scanner = Scanner::new(
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.vcache),
            Arc::clone(&self.flags),
        );
        let events = self.events.clone();
        let worker_session = Arc::clone(&session);
        let worker_id = session_id.clone();
        let handle = tokio::spawn(async move {
            match scanner.run(Arc::clone(&worker_session), events.clone()).await {
                Ok(tree) => Ok(tree),
                Err(e) => {
                    error!(session = %worker_id, error = %e, "resync session failed");
                    worker_session.set_status(SessionStatus::Failed);
                    worker_session.update(|p| {
                        p.errors.push(SessionError {
                            file: String::new(),
                            phase: "session".to_string(),
                            message: e.to_string(),
                        });
                    });
                    let _ = events.send(ProgressEvent::Failed {
                        session_id: worker_id,
                        error: e.to_string(),
                    });
                    Err(e)
                }
            }
        });
        self.handles.lock().insert(session_id.clone(), handle);

        info!(session = %session_id, "resync session started");
        Ok(session_id)
    }

    fn session(&self, session_id: &str) -> Result<Arc<ResyncSession>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    pub fn status(&self, session_id: &str) -> Result<ResyncProgress> {
        Ok(self.session(session_id)?.snapshot())
    }

    /// Request a pause; takes effect at the next batch boundary.
    pub fn pause(&self, session_id: &str) -> Result<()> {
        self.session(session_id)?.pause();
        Ok(())
    }

    pub fn resume(&self, session_id: &str) -> Result<()> {
        self.session(session_id)?.resume();
        Ok(())
    }

    /// Request cancellation; takes effect at the next batch boundary.
    pub fn cancel(&self, session_id: &str) -> Result<()> {
        self.session(session_id)?.cancel();
        Ok(())
    }

    /// Wait for a session's worker to finish and take its tree.
    pub async fn wait(&self, session_id: &str) -> Result<Vec<FolderIndex>> {
        let handle = self
            .handles
            .lock()
            .remove(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        handle
            .await
            .map_err(|e| Error::Serialization(format!("scan worker panicked: {e}")))?
    }

    /// Drop terminal sessions older than the retention window.
    pub fn prune_finished(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.prunable(SESSION_RETENTION));
        let pruned = before - sessions.len();
        if pruned > 0 {
            info!(pruned, "pruned finished resync sessions");
        }
        pruned
    }
}
