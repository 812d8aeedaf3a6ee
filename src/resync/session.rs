use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

/// Lifecycle states of a scan or embedding session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

/// What the owner of a session has asked it to do next. Observed by the
/// worker only at batch boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Run,
    Pause,
    Cancel,
}

/// A per-file error recorded in the session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionError {
    pub file: String,
    /// Which phase failed: decode, embed, insert, read, parse.
    pub phase: String,
    pub message: String,
}

/// Timing metrics accumulated over the session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionMetrics {
    #[serde(rename = "avgProcessingTime")]
    pub avg_processing_ms: f64,
    /// The slowest files seen so far, worst first, capped at five.
    #[serde(rename = "slowestFiles")]
    pub slowest_files: Vec<(String, u64)>,
    #[serde(rename = "cacheHits")]
    pub cache_hits: u64,
    #[serde(rename = "cacheMisses")]
    pub cache_misses: u64,
}

impl SessionMetrics {
    pub fn record_timing(&mut self, file: &str, elapsed_ms: u64, processed_so_far: u64) {
        let n = processed_so_far.max(1) as f64;
        self.avg_processing_ms += (elapsed_ms as f64 - self.avg_processing_ms) / n;
        self.slowest_files.push((file.to_string(), elapsed_ms));
        self.slowest_files.sort_by(|a, b| b.1.cmp(&a.1));
        self.slowest_files.truncate(5);
    }
}

/// Mutable progress state of a resync session.
#[derive(Debug, Clone, Serialize)]
pub struct ResyncProgress {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(rename = "totalFiles")]
    pub total_files: u64,
    #[serde(rename = "filesProcessed")]
    pub files_processed: u64,
    #[serde(rename = "currentBatch")]
    pub current_batch: u64,
    #[serde(rename = "totalBatches")]
    pub total_batches: u64,
    #[serde(rename = "currentFolder")]
    pub current_folder: Option<String>,
    /// Index of the next unprocessed file within the current folder.
    #[serde(rename = "currentFolderProgress")]
    pub current_folder_progress: u64,
    #[serde(rename = "completedFolders")]
    pub completed_folders: BTreeSet<String>,
    pub errors: Vec<SessionError>,
    #[serde(rename = "startTime")]
    pub start_time: u64,
    #[serde(rename = "endTime")]
    pub end_time: Option<u64>,
    #[serde(rename = "batchSize")]
    pub batch_size: usize,
    #[serde(rename = "forceRefresh")]
    pub force_refresh: bool,
    #[serde(rename = "folderFilter")]
    pub folder_filter: Option<String>,
    pub metrics: SessionMetrics,
}

impl ResyncProgress {
    /// Whole-percentage progress, 100 only when every file is processed.
    pub fn progress_percent(&self) -> u8 {
        if self.total_files == 0 {
            return 100;
        }
        ((self.files_processed * 100) / self.total_files).min(100) as u8
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Shared handle to one resync session: progress snapshot plus the control
/// channel its worker observes at batch boundaries.
pub struct ResyncSession {
    progress: RwLock<ResyncProgress>,
    control_tx: watch::Sender<ControlRequest>,
    control_rx: watch::Receiver<ControlRequest>,
}

impl ResyncSession {
    pub fn new(
        session_id: String,
        batch_size: usize,
        force_refresh: bool,
        folder_filter: Option<String>,
    ) -> Self {
        let (control_tx, control_rx) = watch::channel(ControlRequest::Run);
        Self {
            progress: RwLock::new(ResyncProgress {
                session_id,
                status: SessionStatus::Initializing,
                total_files: 0,
                files_processed: 0,
                current_batch: 0,
                total_batches: 0,
                current_folder: None,
                current_folder_progress: 0,
                completed_folders: BTreeSet::new(),
                errors: Vec::new(),
                start_time: now_ms(),
                end_time: None,
                batch_size,
                force_refresh,
                folder_filter,
                metrics: SessionMetrics::default(),
            }),
            control_tx,
            control_rx,
        }
    }

    pub fn snapshot(&self) -> ResyncProgress {
        self.progress.read().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.progress.read().status
    }

    /// Mutate the progress under the lock. Only the owning worker calls this.
    pub fn update<F: FnOnce(&mut ResyncProgress)>(&self, f: F) {
        f(&mut self.progress.write());
    }

    pub fn set_status(&self, status: SessionStatus) {
        let mut progress = self.progress.write();
        progress.status = status;
        if status.is_terminal() {
            progress.end_time = Some(now_ms());
        }
    }

    pub fn request(&self) -> ControlRequest {
        *self.control_rx.borrow()
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

    /// Block until the control request leaves `Pause`. Returns the request
    /// that ended the wait.
    pub async fn wait_while_paused(&self) -> ControlRequest {
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

    /// Whether this terminal session is old enough to be pruned.
    pub fn prunable(&self, max_age: Duration) -> bool {
        let progress = self.progress.read();
        match (progress.status.is_terminal(), progress.end_time) {
            (true, Some(end)) => now_ms().saturating_sub(end) >= max_age.as_millis() as u64,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_percent_rounds_down() {
        let session = ResyncSession::new("s1".into(), 50, false, None);
        session.update(|p| {
            p.total_files = 1000;
            p.files_processed = 250;
        });
        assert_eq!(session.snapshot().progress_percent(), 25);
    }

    #[test]
    fn progress_percent_handles_empty_scan() {
        let session = ResyncSession::new("s1".into(), 50, false, None);
        assert_eq!(session.snapshot().progress_percent(), 100);
    }

    #[test]
    fn terminal_states_record_end_time() {
        let session = ResyncSession::new("s1".into(), 50, false, None);
        assert!(session.snapshot().end_time.is_none());
        session.set_status(SessionStatus::Completed);
        assert!(session.snapshot().end_time.is_some());
    }

    #[test]
    fn control_requests_are_observable() {
        let session = ResyncSession::new("s1".into(), 50, false, None);
        assert_eq!(session.request(), ControlRequest::Run);
        session.pause();
        assert_eq!(session.request(), ControlRequest::Pause);
        session.resume();
        assert_eq!(session.request(), ControlRequest::Run);
        session.cancel();
        assert_eq!(session.request(), ControlRequest::Cancel);
    }

    #[tokio::test]
    async fn wait_while_paused_returns_on_resume() {
        let session = std::sync::Arc::new(ResyncSession::new("s1".into(), 50, false, None));
        session.pause();

        let waiter = {
            let session = std::sync::Arc::clone(&session);
            tokio::spawn(async move { session.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.resume();
        assert_eq!(waiter.await.unwrap(), ControlRequest::Run);
    }

    #[test]
    fn metrics_track_slowest_files() {
        let mut metrics = SessionMetrics::default();
        for (i, ms) in [10u64, 500, 20, 900, 30, 40, 700].iter().enumerate() {
            metrics.record_timing(&format!("f{i}"), *ms, (i + 1) as u64);
        }
        assert_eq!(metrics.slowest_files.len(), 5);
        assert_eq!(metrics.slowest_files[0].1, 900);
        assert!(metrics.avg_processing_ms > 0.0);
    }

    #[test]
    fn prunable_only_after_age() {
        let session = ResyncSession::new("s1".into(), 50, false, None);
        session.set_status(SessionStatus::Cancelled);
        assert!(session.prunable(Duration::from_millis(0)));
        assert!(!session.prunable(Duration::from_secs(3600)));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Paused).unwrap();
        assert_eq!(json, r#""paused""#);
    }
}
