use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_full::notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify_debouncer_full::notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::{ChangeBus, FileAction, FileChange};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::MetadataStore;

const DEBOUNCE_MS: u64 = 300;

/// A filesystem event on a document record.
#[derive(Debug, Clone)]
enum DocEvent {
    Upserted(PathBuf),
    Removed(PathBuf),
}

/// Watches the documents root for record changes and publishes
/// `file:metadata:updates` messages, feeding the change-bus consumer that
/// keeps folder indexes coherent.
pub struct DocumentWatcher {
    config: Config,
    store: Arc<MetadataStore>,
    bus: Arc<ChangeBus>,
}

impl DocumentWatcher {
    pub fn new(config: Config, store: Arc<MetadataStore>, bus: Arc<ChangeBus>) -> Self {
        Self { config, store, bus }
    }

    /// Watch until the cancel token fires. Events are debounced and only
    /// `.json` records one level under a folder are considered.
    pub async fn watch(&self, cancel: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DocEvent>();
        let root = self.config.documents_dir();
        let cb_root = root.clone();

        let mut debouncer = new_debouncer(
            Duration::from_millis(DEBOUNCE_MS),
            None,
            move |result: DebounceEventResult| {
                let events = match result {
                    Ok(events) => events,
                    Err(errs) => {
                        for e in errs {
                            error!("debouncer error: {e}");
                        }
                        return;
                    }
                };
                for event in events {
                    for doc_event in classify_event(&event.event.kind, &event.paths, &cb_root) {
                        if tx.send(doc_event).is_err() {
                            debug!("watcher channel closed, stopping event forwarding");
                            return;
                        }
                    }
                }
            },
        )
        .map_err(|e| Error::Watch(format!("failed to create debouncer: {e}")))?;

        debouncer
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::Watch(format!("failed to watch {}: {e}", root.display())))?;
        info!(root = %root.display(), "document watcher started");

        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    if let Err(e) = self.handle_event(&event).await {
                        error!("error handling event {event:?}: {e}");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("document watcher stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_event(&self, event: &DocEvent) -> Result<()> {
        match event {
            DocEvent::Upserted(path) => {
                let Some((folder, file)) = split_folder_file(&self.config.documents_dir(), path)
                else {
                    return Ok(());
                };
                // Stash the transient metadata first so the consumer can
                // merge it, then announce the change.
                let raw = match std::fs::read_to_string(path) {
                    Ok(raw) => raw,
                    // Gone again before we read it; the remove event follows.
                    Err(_) => return Ok(()),
                };
                let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
                    debug!(%file, "unparseable document record, not publishing");
                    return Ok(());
                };
                self.store.save_file_metadata(&folder, &file, &value).await?;
                self.bus
                    .publish_file_change(&FileChange {
                        action: FileAction::Add,
                        folder,
                        file,
                    })
                    .await
            }
            DocEvent::Removed(path) => {
                let Some((folder, file)) = split_folder_file(&self.config.documents_dir(), path)
                else {
                    return Ok(());
                };
                self.bus
                    .publish_file_change(&FileChange {
                        action: FileAction::Remove,
                        folder,
                        file,
                    })
                    .await
            }
        }
    }
}

/// Map a notify event to document events, keeping only `.json` records.
fn classify_event(kind: &EventKind, paths: &[PathBuf], root: &Path) -> Vec<DocEvent> {
    let is_record = |p: &PathBuf| {
        p.extension().and_then(|e| e.to_str()) == Some("json") && p.starts_with(root)
    };

    match kind {
        EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => paths
            .iter()
            .filter(|p| is_record(p))
            .map(|p| DocEvent::Upserted(p.clone()))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            let mut events = Vec::new();
            if is_record(&paths[0]) {
                events.push(DocEvent::Removed(paths[0].clone()));
            }
            if is_record(&paths[1]) {
                events.push(DocEvent::Upserted(paths[1].clone()));
            }
            events
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => paths
            .iter()
            .filter(|p| is_record(p))
            .map(|p| DocEvent::Removed(p.clone()))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) | EventKind::Modify(_) => paths
            .iter()
            .filter(|p| is_record(p))
            .map(|p| DocEvent::Upserted(p.clone()))
            .collect(),
        EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => paths
            .iter()
            .filter(|p| is_record(p))
            .map(|p| DocEvent::Removed(p.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Split an absolute record path into `(folder, file)` relative to the
/// documents root. Records outside a folder are ignored.
fn split_folder_file(root: &Path, path: &Path) -> Option<(String, String)> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let folder = components.next()?.as_os_str().to_str()?.to_string();
    let file = components.next()?.as_os_str().to_str()?.to_string();
    // Anything nested deeper than folder/file is not a document record.
    if components.next().is_some() {
        return None;
    }
    Some((folder, file))
}
