pub mod exif;
pub mod image;
pub mod text;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::UNIX_EPOCH;

use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunker::count_tokens;
use crate::config::Config;
use crate::document::{Document, FileType};
use crate::error::{Error, Result};
use crate::paths::resolve_sandboxed;

/// Extensions routed to the text parsers.
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "pdf"];

/// Extensions routed to the image pipeline (plus the RAW set).
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tga"];

/// Which pipeline a file routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Text,
    Image,
}

/// Extension-based routing decision. `None` means unsupported.
pub fn route_for(extension: &str) -> Option<Route> {
    let ext = extension.to_lowercase();
    if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        return Some(Route::Text);
    }
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) || image::RAW_EXTENSIONS.contains(&ext.as_str()) {
        return Some(Route::Image);
    }
    None
}

fn file_extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

fn file_times(path: &Path) -> (u64, u64) {
    let Ok(meta) = std::fs::metadata(path) else {
        return (0, 0);
    };
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    (mtime_ms, meta.len())
}

/// Ingest one uploaded file: classify by extension and run the matching
/// pipeline, producing a [`Document`] ready to be written under a folder.
pub async fn process_file(config: &Config, path: &Path, original_name: &str) -> Result<Document> {
    let extension = file_extension(original_name);
    let route = route_for(&extension).ok_or_else(|| Error::DocumentParse {
        path: path.to_path_buf(),
        message: format!("unsupported file type '.{extension}'"),
    })?;

    match route {
        Route::Text => process_text(path, original_name, &extension),
        Route::Image => process_image(config, path, original_name, &extension).await,
    }
}

fn base_document(path: &Path, original_name: &str, extension: &str) -> Document {
    let (mtime_ms, size) = file_times(path);
    Document {
        id: Uuid::new_v4().to_string(),
        url: format!("file://{}", path.display()),
        title: original_name.to_string(),
        doc_author: "Unknown".to_string(),
        description: String::new(),
        doc_source: "local file upload".to_string(),
        chunk_source: format!("localfile://{}", path.display()),
        published: chrono::Utc::now().to_rfc3339(),
        word_count: 0,
        token_count_estimate: 0,
        page_content: String::new(),
        extension: extension.to_string(),
        file_type: FileType::Text,
        embedding_mode: String::new(),
        image_base64: None,
        blur_hash: None,
        camera: None,
        lens: None,
        location: None,
        camera_settings: None,
        mtime_ms,
        size,
    }
}

fn process_text(path: &Path, original_name: &str, extension: &str) -> Result<Document> {
    let content = text::extract_text(path, extension)?;
    let mut doc = base_document(path, original_name, extension);
    doc.description = format!("{original_name} ({extension} file)");
    doc.word_count = text::word_count(&content);
    doc.token_count_estimate = count_tokens(&content) as u64;
    doc.page_content = content;
    info!(file = original_name, words = doc.word_count, "text file ingested");
    Ok(doc)
}

async fn process_image(
    config: &Config,
    path: &Path,
    original_name: &str,
    extension: &str,
) -> Result<Document> {
    // EXIF comes from the original file; transcoding drops it.
    let exif_summary = exif::read_exif(path);

    let decoded = match image::decode_to_png(config, path, extension).await {
        Ok(decoded) => decoded,
        Err(e @ Error::InvalidImage { .. }) => {
            // Explicitly invalid content: out of the documents tree it goes.
            if let Err(trash_err) = image::move_to_trash(config, path) {
                warn!(file = original_name, error = %trash_err, "failed to trash invalid image");
            }
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let base64_png = image::base64_file_chunked(&decoded.path)?;

    let blur_hash = match ::image::open(&decoded.path) {
        Ok(img) => image::compute_blurhash(&img),
        Err(_) => None,
    };

    let mut doc = base_document(path, original_name, extension);
    doc.description = exif::build_description(original_name, &exif_summary);
    doc.file_type = FileType::Image;
    doc.embedding_mode = "server-decided".to_string();
    doc.page_content = base64_png;
    doc.blur_hash = blur_hash;
    doc.camera = exif_summary.camera;
    doc.lens = exif_summary.lens;
    doc.location = exif_summary.location;
    doc.camera_settings = exif_summary.camera_settings;

    let converted = decoded.path != path;
    drop(decoded);
    if converted {
        // Conversion succeeded; the original leaves the intake area.
        if let Err(e) = image::move_to_trash(config, path) {
            warn!(file = original_name, error = %e, "failed to trash converted original");
        }
    }

    info!(
        file = original_name,
        camera = doc.camera.as_deref().unwrap_or("-"),
        "image ingested"
    );
    Ok(doc)
}

static SLUG_RE: OnceLock<Regex> = OnceLock::new();

/// Filesystem-safe slug for document file names.
pub fn slugify(title: &str) -> String {
    let re = SLUG_RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9]+").expect("static regex"));
    let slug = re.replace_all(title, "-").trim_matches('-').to_lowercase();
    if slug.is_empty() {
        "document".to_string()
    } else {
        slug
    }
}

/// Write a document record to `documents/<folder>/<slug>-<uuid>.json`.
pub fn write_document(config: &Config, folder: &str, doc: &Document) -> Result<PathBuf> {
    let documents_dir = config.documents_dir();
    let file_name = format!("{}-{}.json", slugify(&doc.title), doc.id);
    let target = resolve_sandboxed(&documents_dir, &format!("{folder}/{file_name}"))?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json =
        serde_json::to_string_pretty(doc).map_err(|e| Error::Serialization(e.to_string()))?;
    std::fs::write(&target, json)?;
    Ok(target)
}
