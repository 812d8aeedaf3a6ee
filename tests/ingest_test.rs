use std::sync::Arc;
use std::time::Duration;

use image::{ImageFormat, Rgb, RgbImage};
use mmdex::config::Config;
use mmdex::document::Document;
use mmdex::embedder::MockEmbedder;
use mmdex::Mmdex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn open_app(dir: &TempDir) -> Mmdex {
    let config = Config::with_storage_dir(dir.path());
    let text = Arc::new(MockEmbedder::new(32));
    Mmdex::open_with_services(config, Some(text), None, None)
        .await
        .unwrap()
}

#[tokio::test]
async fn ingest_text_file_writes_document_record() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir).await;

    let upload = dir.path().join("notes.txt");
    std::fs::write(&upload, "the quick brown fox jumps").unwrap();

    let written = app
        .ingest_file(&upload, "notes.txt", "custom-documents")
        .await
        .unwrap();

    assert!(written.starts_with(app.config().documents_dir().join("custom-documents")));
    let raw = std::fs::read_to_string(&written).unwrap();
    let doc = Document::from_json(&written, &raw).unwrap();
    assert_eq!(doc.title, "notes.txt");
    assert_eq!(doc.word_count, 5);
    assert_eq!(doc.page_content, "the quick brown fox jumps");
    assert!(doc.token_count_estimate > 0);
}

#[tokio::test]
async fn ingest_png_writes_image_record() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir).await;

    let mut img = RgbImage::new(20, 10);
    for pixel in img.pixels_mut() {
        *pixel = Rgb([220, 30, 30]);
    }
    let upload = dir.path().join("apple.png");
    img.save_with_format(&upload, ImageFormat::Png).unwrap();

    let written = app
        .ingest_file(&upload, "apple.png", "photos")
        .await
        .unwrap();

    let raw = std::fs::read_to_string(&written).unwrap();
    let doc = Document::from_json(&written, &raw).unwrap();
    assert_eq!(doc.file_type, mmdex::FileType::Image);
    assert_eq!(doc.embedding_mode, "server-decided");
    assert!(!doc.page_content.is_empty());
    assert!(doc.blur_hash.is_some());
    assert!(doc.description.contains("apple"));
}

#[tokio::test]
async fn ingest_announcement_reaches_folder_index() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir).await;
    let cancel = CancellationToken::new();
    app.start_change_plumbing(cancel.clone());

    let upload = dir.path().join("report.txt");
    std::fs::write(&upload, "quarterly numbers").unwrap();
    let written = app
        .ingest_file(&upload, "report.txt", "custom-documents")
        .await
        .unwrap();
    let file_name = written.file_name().unwrap().to_str().unwrap().to_string();

    // The bus consumer merges asynchronously.
    let mut merged = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if let Some((index, _)) = app.store().get_folder("custom-documents").await.unwrap() {
            if index.items.iter().any(|i| i.name == file_name) {
                merged = Some(index);
                break;
            }
        }
    }
    let index = merged.expect("ingested file never appeared in the folder index");
    let item = index.items.iter().find(|i| i.name == file_name).unwrap();
    assert_eq!(item.title, "report.txt");
    // Folder indexes never carry payloads.
    assert!(!item.extra.contains_key("pageContent"));

    // The transient handoff key was consumed.
    assert!(app
        .store()
        .get_file_metadata("custom-documents", &file_name)
        .await
        .unwrap()
        .is_none());

    cancel.cancel();
}

#[tokio::test]
async fn batch_ingest_collects_per_file_outcomes() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir).await;

    let good = dir.path().join("a.txt");
    std::fs::write(&good, "first file").unwrap();
    let bad = dir.path().join("b.exe");
    std::fs::write(&bad, [0u8; 4]).unwrap();

    let outcomes = app
        .ingest_batch(
            vec![
                (good, "a.txt".to_string()),
                (bad, "b.exe".to_string()),
            ],
            "custom-documents",
        )
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    let ok = outcomes.iter().find(|(name, _)| name == "a.txt").unwrap();
    assert!(ok.1.is_ok());
    let failed = outcomes.iter().find(|(name, _)| name == "b.exe").unwrap();
    assert!(failed.1.is_err());
}

#[tokio::test]
async fn unsupported_extension_is_rejected() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir).await;
    let upload = dir.path().join("binary.exe");
    std::fs::write(&upload, [0u8; 16]).unwrap();

    let err = app
        .ingest_file(&upload, "binary.exe", "custom-documents")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unsupported"));
}

#[tokio::test]
async fn localfiles_payload_collapses_when_oversize() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::with_storage_dir(dir.path());
    config.max_localfiles_json_bytes = 200;
    let app = Mmdex::open_with_services(
        config,
        Some(Arc::new(MockEmbedder::new(8))),
        None,
        None,
    )
    .await
    .unwrap();

    let upload = dir.path().join("big.txt");
    std::fs::write(&upload, "lots of words here to make items").unwrap();
    app.ingest_file(&upload, "big.txt", "custom-documents")
        .await
        .unwrap();
    // Put the folder index in place directly (no consumer running).
    let raw = std::fs::read_to_string(
        std::fs::read_dir(app.config().documents_dir().join("custom-documents"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path(),
    )
    .unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let entry = mmdex::FileMetadata::from_disk_json("big.json", &value, 1, 2).unwrap();
    app.store()
        .add_file_to_folder("custom-documents", entry)
        .await
        .unwrap();

    let tree = app.localfiles_json().await.unwrap();
    assert_eq!(tree["localFiles"]["collapsed"], true);
    assert_eq!(tree["localFiles"]["fileCount"], 1);
}
