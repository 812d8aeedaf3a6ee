use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{Config, LARGE_FILE_BYTES};
use crate::document::{FileMetadata, FolderIndex};
use crate::error::Result;
use crate::resync::session::{
    ControlRequest, ResyncSession, SessionError, SessionStatus,
};
use crate::resync::ProgressEvent;
use crate::store::{CacheTier, MetadataStore};
use crate::vcache::VectorCache;

/// Pinned/watched flags attached to scanned items.
#[derive(Debug, Clone, Default)]
pub struct ItemFlags {
    pub pinned_workspaces: Vec<String>,
    pub watched: bool,
}

/// Bulk source of pinned/watched flags, one query per batch. The workspace
/// database that backs this lives outside the core.
#[async_trait]
pub trait FlagProvider: Send + Sync {
    async fn flags_for(&self, folder: &str, names: &[String]) -> HashMap<String, ItemFlags>;
}

/// Default provider: nothing is pinned or watched.
pub struct NoFlags;

#[async_trait]
impl FlagProvider for NoFlags {
    async fn flags_for(&self, _folder: &str, _names: &[String]) -> HashMap<String, ItemFlags> {
        HashMap::new()
    }
}

/// The folder that is always hoisted to the front of the returned tree.
pub const PRIMARY_FOLDER: &str = "custom-documents";

/// Outcome of scanning one file.
struct FileScan {
    position: usize,
    entry: Option<FileMetadata>,
    error: Option<SessionError>,
    elapsed_ms: u64,
    name: String,
}

/// Walks the documents root folder-by-folder, rebuilding the per-folder
/// caches with bounded concurrency and batch-boundary checkpoints.
pub struct Scanner {
    config: Config,
    store: Arc<MetadataStore>,
    vcache: Arc<VectorCache>,
    flags: Arc<dyn FlagProvider>,
}

impl Scanner {
    pub fn new(
        config: Config,
        store: Arc<MetadataStore>,
        vcache: Arc<VectorCache>,
        flags: Arc<dyn FlagProvider>,
    ) -> Self {
        Self {
            config,
            store,
            vcache,
            flags,
        }
    }

    /// Enumerate folders under the documents root, primary folder first.
    fn enumerate_folders(&self, filter: Option<&str>) -> Result<Vec<(String, Vec<String>)>> {
        let root = self.config.documents_dir();
        let mut folders = Vec::new();

        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(folders),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(filter) = filter {
                if name != filter {
                    continue;
                }
            }
            folders.push((name.to_string(), list_json_files(&path)?));
        }

        folders.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(pos) = folders.iter().position(|(name, _)| name == PRIMARY_FOLDER) {
            let primary = folders.remove(pos);
            folders.insert(0, primary);
        }
        Ok(folders)
    }

    /// Run a full scan for the given session, emitting progress events.
    ///
    /// Pause and cancel are observed only between batches; in-flight file
    /// reads run to completion. Returns the (possibly partial) tree.
    pub async fn run(
        &self,
        session: Arc<ResyncSession>,
        events: broadcast::Sender<ProgressEvent>,
    ) -> Result<Vec<FolderIndex>> {
        let snapshot = session.snapshot();
        let folders = self.enumerate_folders(snapshot.folder_filter.as_deref())?;
        let total_files: u64 = folders.iter().map(|(_, files)| files.len() as u64).sum();
        let batch_size = snapshot.batch_size.max(1);
        let total_batches = total_files.div_ceil(batch_size as u64);

        session.update(|p| {
            p.total_files = total_files;
            p.total_batches = total_batches;
            p.status = SessionStatus::Running;
        });
        info!(
            session = %snapshot.session_id,
            folders = folders.len(),
            total_files,
            total_batches,
            "resync scan started"
        );

        let mut tree: Vec<FolderIndex> = Vec::new();

        for (folder_name, files) in &folders {
            if session.snapshot().completed_folders.contains(folder_name) {
                if let Some((index, _)) = self.store.get_folder(folder_name).await? {
                    tree.push(index);
                }
                continue;
            }

            session.update(|p| {
                p.current_folder = Some(folder_name.clone());
                p.current_folder_progress = 0;
            });

            match self
                .scan_folder(&session, &events, folder_name, files, batch_size)
                .await?
            {
                Some(index) => {
                    session.update(|p| {
                        p.completed_folders.insert(folder_name.clone());
                        p.current_folder = None;
                        p.current_folder_progress = 0;
                    });
                    tree.push(index);
                }
                // Cancelled mid-folder: return the partial tree.
                None => {
                    reorder_tree(&mut tree);
                    return Ok(tree);
                }
            }
        }

        session.set_status(SessionStatus::Completed);
        let _ = events.send(ProgressEvent::Complete {
            session_id: snapshot.session_id.clone(),
        });
        info!(session = %snapshot.session_id, "resync scan completed");

        reorder_tree(&mut tree);
        Ok(tree)
    }

    /// Scan one folder in batches. Returns `None` when the session was
    /// cancelled at a batch boundary.
    async fn scan_folder(
        &self,
        session: &Arc<ResyncSession>,
        events: &broadcast::Sender<ProgressEvent>,
        folder_name: &str,
        files: &[String],
        batch_size: usize,
    ) -> Result<Option<FolderIndex>> {
        let snapshot = session.snapshot();
        let force_refresh = snapshot.force_refresh;
        let session_id = snapshot.session_id.clone();
        let folder_path = self.config.documents_dir().join(folder_name);

        // Seed from the caches so resume dedups by name. Redis answers
        // first and syncs down to disk; hits and misses feed the metrics.
        let mut index = if force_refresh {
            session.update(|p| p.metrics.cache_misses += 1);
            FolderIndex::new(folder_name)
        } else {
            match self.store.get_folder(folder_name).await? {
                Some((index, tier)) => {
                    session.update(|p| match tier {
                        CacheTier::Redis => p.metrics.cache_hits += 1,
                        CacheTier::Disk => p.metrics.cache_misses += 1,
                    });
                    index
                }
                None => {
                    session.update(|p| p.metrics.cache_misses += 1);
                    FolderIndex::new(folder_name)
                }
            }
        };

        let disk_set: HashSet<&str> = files.iter().map(String::as_str).collect();

        for batch in files.chunks(batch_size) {
            // Batch boundary: the only place pause/cancel are observed.
            match session.request() {
                ControlRequest::Pause => {
                    session.set_status(SessionStatus::Paused);
                    let _ = events.send(ProgressEvent::Paused {
                        session_id: session_id.clone(),
                    });
                    info!(session = %session_id, folder = folder_name, "scan paused");
                    if session.wait_while_paused().await == ControlRequest::Cancel {
                        session.set_status(SessionStatus::Cancelled);
                        let _ = events.send(ProgressEvent::Cancelled {
                            session_id: session_id.clone(),
                        });
                        return Ok(None);
                    }
                    session.set_status(SessionStatus::Running);
                    info!(session = %session_id, folder = folder_name, "scan resumed");
                }
                ControlRequest::Cancel => {
                    session.set_status(SessionStatus::Cancelled);
                    let _ = events.send(ProgressEvent::Cancelled {
                        session_id: session_id.clone(),
                    });
                    info!(session = %session_id, "scan cancelled");
                    return Ok(None);
                }
                ControlRequest::Run => {}
            }

            let batch_start = Instant::now();
            let scans = self.scan_batch(&folder_path, batch).await;

            // Bulk flag fetch: one query per batch.
            let names: Vec<String> = scans
                .iter()
                .filter(|s| s.entry.is_some())
                .map(|s| s.name.clone())
                .collect();
            let flags = self.flags.flags_for(folder_name, &names).await;

            let mut processed_in_batch = 0u64;
            for scan in scans {
                processed_in_batch += 1;
                session.update(|p| {
                    p.files_processed += 1;
                    p.current_folder_progress += 1;
                    let processed = p.files_processed;
                    p.metrics.record_timing(&scan.name, scan.elapsed_ms, processed);
                    if let Some(error) = scan.error {
                        p.errors.push(error);
                    }
                });
                if let Some(mut entry) = scan.entry {
                    if let Some(item_flags) = flags.get(&entry.name) {
                        entry.pinned_workspaces = item_flags.pinned_workspaces.clone();
                        entry.watched = item_flags.watched;
                    }
                    index.upsert_item(entry);
                }
            }

            // Persist after every batch so resume is cheap and crash-safe.
            self.store.save_folder(folder_name, index.clone()).await?;

            let batch_ms = batch_start.elapsed().as_millis() as u64;
            let progress = session.snapshot();
            session.update(|p| p.current_batch += 1);
            let _ = events.send(ProgressEvent::BatchComplete {
                session_id: session_id.clone(),
                folder: folder_name.to_string(),
                batch: progress.current_batch + 1,
                total_batches: progress.total_batches,
                files_in_batch: processed_in_batch,
                batch_ms,
                status: progress.status,
            });
            let _ = events.send(ProgressEvent::Progress {
                session_id: session_id.clone(),
                files_processed: progress.files_processed,
                total_files: progress.total_files,
                progress: progress.progress_percent(),
            });
        }

        // The filesystem is the authority: anything cached but gone from
        // disk leaves the index here.
        index.items.retain(|item| disk_set.contains(item.name.as_str()));
        self.store.save_folder(folder_name, index.clone()).await?;
        index.strip_items();

        Ok(Some(index))
    }

    /// Scan one batch of files, small and large lanes concurrently so large
    /// file I/O does not starve small-file throughput.
    async fn scan_batch(&self, folder_path: &Path, batch: &[String]) -> Vec<FileScan> {
        let mut small = Vec::new();
        let mut large = Vec::new();
        for (position, name) in batch.iter().enumerate() {
            let path = folder_path.join(name);
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if size >= LARGE_FILE_BYTES {
                large.push((position, name.clone(), path));
            } else {
                small.push((position, name.clone(), path));
            }
        }

        let slow_ms = self.config.resync_slow_ms;
        let vcache = Arc::clone(&self.vcache);

        let scan_lane = |items: Vec<(usize, String, PathBuf)>, concurrency: usize| {
            let vcache = Arc::clone(&vcache);
            async move {
                stream::iter(items.into_iter().map(|(position, name, path)| {
                    let vcache = Arc::clone(&vcache);
                    async move { scan_file(position, name, path, vcache, slow_ms).await }
                }))
                .buffer_unordered(concurrency.max(1))
                .collect::<Vec<FileScan>>()
                .await
            }
        };

        let (mut small_scans, large_scans) = tokio::join!(
            scan_lane(small, self.config.resync_concurrency),
            scan_lane(large, self.config.resync_large_concurrency),
        );
        small_scans.extend(large_scans);
        // Restore filesystem enumeration order lost to buffer_unordered.
        small_scans.sort_by_key(|s| s.position);
        small_scans
    }
}

fn list_json_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("json") {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn reorder_tree(tree: &mut [FolderIndex]) {
    if let Some(pos) = tree.iter().position(|f| f.name == PRIMARY_FOLDER) {
        tree[..=pos].rotate_right(1);
    }
}

/// Stat → read → parse → flags for one file, with per-phase timings logged
/// when the total crosses the slow threshold.
async fn scan_file(
    position: usize,
    name: String,
    path: PathBuf,
    vcache: Arc<VectorCache>,
    slow_ms: u64,
) -> FileScan {
    let started = Instant::now();
    fn phase_err(file: &str, phase: &str, message: String) -> SessionError {
        SessionError {
            file: file.to_string(),
            phase: phase.to_string(),
            message,
        }
    }

    let stat_start = Instant::now();
    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(e) => {
            return FileScan {
                position,
                entry: None,
                error: Some(phase_err(&name, "stat", e.to_string())),
                elapsed_ms: started.elapsed().as_millis() as u64,
                name,
            }
        }
    };
    let stat_ms = stat_start.elapsed().as_millis() as u64;

    let read_start = Instant::now();
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) => {
            return FileScan {
                position,
                entry: None,
                error: Some(phase_err(&name, "read", e.to_string())),
                elapsed_ms: started.elapsed().as_millis() as u64,
                name,
            }
        }
    };
    let read_ms = read_start.elapsed().as_millis() as u64;

    let parse_start = Instant::now();
    let value: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            return FileScan {
                position,
                entry: None,
                error: Some(phase_err(&name, "parse", e.to_string())),
                elapsed_ms: started.elapsed().as_millis() as u64,
                name,
            }
        }
    };
    drop(raw);
    let parse_ms = parse_start.elapsed().as_millis() as u64;

    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let flags_start = Instant::now();
    let entry = FileMetadata::from_disk_json(&name, &value, mtime_ms, meta.len()).map(|mut e| {
        e.cached = vcache.exists(&path.display().to_string());
        e.can_watch = true;
        e
    });
    if entry.is_none() {
        debug!(file = %name, "dropped: missing required metadata fields");
    }
    let flags_ms = flags_start.elapsed().as_millis() as u64;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    if elapsed_ms > slow_ms {
        warn!(
            file = %name,
            total_ms = elapsed_ms,
            stat_ms,
            read_ms,
            parse_ms,
            flags_ms,
            "slow file scan"
        );
    }

    FileScan {
        position,
        entry,
        error: None,
        elapsed_ms,
        name,
    }
}
