use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Discriminator for how a document's content should be embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    #[default]
    Text,
    Image,
}

/// JSON keys that must be present for a file to appear in the picker.
///
/// `name` and `type` are attached by the scanner from the directory entry;
/// the remainder must exist in the document JSON itself.
pub const REQUIRED_METADATA_FIELDS: &[&str] = &[
    "url",
    "title",
    "docAuthor",
    "description",
    "docSource",
    "chunkSource",
    "published",
    "wordCount",
];

/// A document record as stored on disk at `documents/<folder>/<slug>-<uuid>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub url: String,
    pub title: String,
    pub doc_author: String,
    pub description: String,
    pub doc_source: String,
    pub chunk_source: String,
    pub published: String,
    pub word_count: u64,
    #[serde(rename = "token_count_estimate", default)]
    pub token_count_estimate: u64,
    pub page_content: String,
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub file_type: FileType,
    #[serde(default)]
    pub embedding_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blur_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lens: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_settings: Option<String>,
    #[serde(default)]
    pub mtime_ms: u64,
    #[serde(default)]
    pub size: u64,
}

impl Document {
    /// Parse a document from raw JSON, verifying the picker-required fields.
    pub fn from_json(path: &Path, raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw).map_err(|e| Error::DocumentParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let missing: Vec<&str> = REQUIRED_METADATA_FIELDS
            .iter()
            .filter(|field| value.get(**field).is_none())
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(Error::DocumentParse {
                path: path.to_path_buf(),
                message: format!("missing required fields: {}", missing.join(", ")),
            });
        }

        serde_json::from_value(value).map_err(|e| Error::DocumentParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// A per-file entry in a [`FolderIndex`]: the document metadata with the
/// heavyweight fields stripped and picker/runtime flags attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// File name within the folder (unique key for merges).
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub url: String,
    pub title: String,
    pub doc_author: String,
    pub description: String,
    pub doc_source: String,
    pub chunk_source: String,
    pub published: String,
    pub word_count: u64,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub can_watch: bool,
    #[serde(default)]
    pub watched: bool,
    #[serde(default)]
    pub pinned_workspaces: Vec<String>,
    #[serde(default)]
    pub mtime_ms: u64,
    #[serde(default)]
    pub size: u64,
    /// Remaining optional fields (token_count_estimate, blurHash, EXIF …)
    /// carried through untouched for the UI.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FileMetadata {
    /// Build an entry from a parsed on-disk document JSON value.
    ///
    /// Returns `None` when any picker-required field is absent; such files
    /// are dropped from the index rather than failing the scan.
    pub fn from_disk_json(name: &str, value: &Value, mtime_ms: u64, size: u64) -> Option<Self> {
        for field in REQUIRED_METADATA_FIELDS {
            value.get(*field)?;
        }

        let get_str = |key: &str| -> Option<String> {
            value.get(key).and_then(Value::as_str).map(str::to_string)
        };

        let mut extra = Map::new();
        if let Some(obj) = value.as_object() {
            for (key, val) in obj {
                let known = matches!(
                    key.as_str(),
                    "id" | "url"
                        | "title"
                        | "docAuthor"
                        | "description"
                        | "docSource"
                        | "chunkSource"
                        | "published"
                        | "wordCount"
                        | "pageContent"
                        | "imageBase64"
                        | "name"
                        | "type"
                        | "mtimeMs"
                        | "size"
                );
                if !known {
                    extra.insert(key.clone(), val.clone());
                }
            }
        }
        strip_heavy_fields(&mut extra);

        Some(Self {
            name: name.to_string(),
            entry_type: "file".to_string(),
            url: get_str("url")?,
            title: get_str("title")?,
            doc_author: get_str("docAuthor")?,
            description: get_str("description")?,
            doc_source: get_str("docSource")?,
            chunk_source: get_str("chunkSource")?,
            published: get_str("published")?,
            word_count: value.get("wordCount").and_then(Value::as_u64).unwrap_or(0),
            cached: false,
            can_watch: false,
            watched: false,
            pinned_workspaces: Vec::new(),
            mtime_ms,
            size,
            extra,
        })
    }
}

/// Remove the payload fields that must never be serialized into a folder
/// index or Redis key.
pub fn strip_heavy_fields(extra: &mut Map<String, Value>) {
    extra.remove("pageContent");
    extra.remove("imageBase64");
}

/// Index of one folder under the document root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderIndex {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub items: Vec<FileMetadata>,
}

impl FolderIndex {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry_type: "folder".to_string(),
            items: Vec::new(),
        }
    }

    /// Insert or replace an item by `name`. Replacement preserves position.
    pub fn upsert_item(&mut self, item: FileMetadata) {
        match self.items.iter_mut().find(|i| i.name == item.name) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    /// Remove an item by `name`. Returns whether anything was removed.
    pub fn remove_item(&mut self, name: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.name != name);
        self.items.len() != before
    }

    /// Strip payload fields from every item. Called before any serialization
    /// to Redis or the disk mirror.
    pub fn strip_items(&mut self) {
        for item in &mut self.items {
            strip_heavy_fields(&mut item.extra);
        }
    }
}
