use std::path::{Path, PathBuf};

use tracing::warn;

use crate::document::FolderIndex;
use crate::error::{Error, Result};
use crate::paths::normalize_path;

/// Disk mirror of the per-folder indexes at `<storage>/cache/folders/<folder>.json`.
///
/// Single-writer per folder (the session holding that folder); readers
/// tolerate stale data. Writes are atomic via tmp-rename so a crashed
/// writer never leaves a half-written mirror.
pub struct DiskFolderCache {
    dir: PathBuf,
}

impl DiskFolderCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn cache_path(&self, folder: &str) -> Result<PathBuf> {
        let name = normalize_path(folder)?;
        if name.contains('/') {
            return Err(Error::InvalidPath(folder.to_string()));
        }
        Ok(self.dir.join(format!("{name}.json")))
    }

    /// Load a folder index from the mirror. Corrupt files are a miss.
    pub fn load(&self, folder: &str) -> Result<Option<FolderIndex>> {
        let path = self.cache_path(folder)?;
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<FolderIndex>(&raw) {
            Ok(index) => Ok(Some(index)),
            Err(e) => {
                warn!(folder, error = %e, "corrupt folder cache on disk, ignoring");
                Ok(None)
            }
        }
    }

    /// Persist a folder index to the mirror (atomic tmp-rename).
    pub fn save(&self, folder: &str, index: &FolderIndex) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.cache_path(folder)?;
        let json = serde_json::to_string(index).map_err(|e| Error::Serialization(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Drop a folder's mirror file, if present.
    pub fn remove(&self, folder: &str) -> Result<bool> {
        let path = self.cache_path(folder)?;
        if path.is_file() {
            std::fs::remove_file(&path)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// List the folder names that have mirror files.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_then_load_roundtrips() {
        let dir = TempDir::new().unwrap();
        let cache = DiskFolderCache::new(dir.path());
        let folder = FolderIndex::new("custom-documents");
        cache.save("custom-documents", &folder).unwrap();

        let loaded = cache.load("custom-documents").unwrap().unwrap();
        assert_eq!(loaded.name, "custom-documents");
        assert!(loaded.items.is_empty());
    }

    #[test]
    fn load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let cache = DiskFolderCache::new(dir.path());
        assert!(cache.load("ghost").unwrap().is_none());
    }

    #[test]
    fn corrupt_mirror_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = DiskFolderCache::new(dir.path());
        std::fs::write(dir.path().join("bad.json"), "{truncated").unwrap();
        assert!(cache.load("bad").unwrap().is_none());
    }

    #[test]
    fn rejects_path_escape_in_folder_name() {
        let dir = TempDir::new().unwrap();
        let cache = DiskFolderCache::new(dir.path());
        assert!(cache.load("../outside").is_err());
        assert!(cache.load("a/b").is_err());
    }

    #[test]
    fn remove_and_list() {
        let dir = TempDir::new().unwrap();
        let cache = DiskFolderCache::new(dir.path());
        cache.save("alpha", &FolderIndex::new("alpha")).unwrap();
        cache.save("beta", &FolderIndex::new("beta")).unwrap();
        assert_eq!(cache.list().unwrap(), vec!["alpha", "beta"]);
        assert!(cache.remove("alpha").unwrap());
        assert_eq!(cache.list().unwrap(), vec!["beta"]);
        assert!(!cache.remove("alpha").unwrap());
    }
}
