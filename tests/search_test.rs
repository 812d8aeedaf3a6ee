use std::sync::Arc;

use mmdex::config::Config;
use mmdex::embedder::MockEmbedder;
use mmdex::error::Error;
use mmdex::index::search::SearchOptions;
use mmdex::{DistanceMetric, EmbedOptions, Mmdex};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn doc_json(title: &str, content: &str) -> String {
    serde_json::json!({
        "id": format!("id-{title}"),
        "url": format!("file:///{title}"),
        "title": title,
        "docAuthor": "Unknown",
        "description": "a text document",
        "docSource": "local file upload",
        "chunkSource": format!("localfile://{title}"),
        "published": "2024-01-01T00:00:00Z",
        "wordCount": content.split_whitespace().count(),
        "pageContent": content,
        "fileType": "text"
    })
    .to_string()
}

async fn open_app(dir: &TempDir, text_dims: usize, multimodal_dims: Option<usize>) -> Mmdex {
    let config = Config::with_storage_dir(dir.path());
    let text = Arc::new(MockEmbedder::new(text_dims));
    let multimodal = multimodal_dims
        .map(|d| Arc::new(MockEmbedder::new(d)) as Arc<dyn mmdex::embedder::ImageEmbedder>);
    Mmdex::open_with_services(config, Some(text), multimodal, None)
        .await
        .unwrap()
}

async fn embed_one(app: &Mmdex, workspace: &str, name: &str, content: &str) {
    let path = app
        .config()
        .documents_dir()
        .join("custom-documents")
        .join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, doc_json(name, content)).unwrap();

    let session = app
        .embed_sessions()
        .start(workspace, workspace, vec![path], EmbedOptions::default())
        .unwrap();
    let progress = app.embed_sessions().wait(&session).await.unwrap();
    assert!(progress.failed.is_empty(), "{:?}", progress.errors);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn end_to_end_text_search_returns_sources() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, 64, None).await;
    embed_one(&app, "w1", "fox.json", "the quick brown fox").await;

    let results = app
        .search(
            "w1",
            "the quick brown fox",
            DistanceMetric::Cosine,
            &SearchOptions {
                top_n: 3,
                threshold: 0.2,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!results.sources.is_empty());
    assert!(results.context_texts[0].contains("fox"));
    assert!(results.sources[0].score >= 0.2);
}

#[tokio::test]
async fn all_three_metrics_answer() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, 32, None).await;
    embed_one(&app, "w1", "a.json", "alpha beta gamma").await;

    for (metric, threshold) in [
        (DistanceMetric::Cosine, 0.0),
        (DistanceMetric::L2, 2.0),
        (DistanceMetric::Dot, -1.0),
    ] {
        let results = app
            .search(
                "w1",
                "alpha beta gamma",
                metric,
                &SearchOptions {
                    top_n: 2,
                    threshold,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!results.sources.is_empty(), "no results for {metric:?}");
    }
}

#[tokio::test]
async fn dimension_mismatch_names_both_dimensions() {
    let dir = TempDir::new().unwrap();

    // Collection created through a 1024-dim text embedder.
    {
        let app = open_app(&dir, 1024, None).await;
        embed_one(&app, "w1", "a.json", "original content").await;
    }

    // Reopen with an active 2048-dim multimodal embedder; queries now go
    // through it and can no longer fit the collection.
    let app = open_app(&dir, 1024, Some(2048)).await;
    let err = app
        .search(
            "w1",
            "anything",
            DistanceMetric::Cosine,
            &SearchOptions::default(),
        )
        .await
        .unwrap_err();

    match err {
        Error::DimensionMismatch {
            expected, actual, ..
        } => {
            assert_eq!(expected, 1024);
            assert_eq!(actual, 2048);
        }
        other => panic!("expected DimensionMismatch, got {other}"),
    }
    let message = format!(
        "{}",
        Error::DimensionMismatch {
            namespace: "w1".into(),
            expected: 1024,
            actual: 2048
        }
    );
    assert!(message.contains("1024"));
    assert!(message.contains("2048"));
}

#[tokio::test]
async fn unknown_namespace_is_an_error() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, 16, None).await;
    let err = app
        .search(
            "ghost",
            "query",
            DistanceMetric::Cosine,
            &SearchOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CollectionNotFound(_)));
}

#[tokio::test]
async fn search_many_merges_namespaces() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, 32, None).await;
    embed_one(&app, "w1", "a.json", "first workspace content").await;
    embed_one(&app, "w2", "b.json", "second workspace content").await;

    let results = app
        .search_many(
            &["w1".to_string(), "w2".to_string()],
            "workspace content",
            DistanceMetric::Cosine,
            &SearchOptions {
                top_n: 2,
                threshold: -1.0,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(results.sources.len(), 2);
}

#[tokio::test]
async fn remove_document_purges_vectors_and_cache() {
    let dir = TempDir::new().unwrap();
    let app = open_app(&dir, 32, None).await;
    embed_one(&app, "w1", "a.json", "ephemeral content").await;
    assert_eq!(app.vector_index().namespace_count("w1").unwrap(), 1);
    assert!(app.vector_cache().has_cached_files());

    app.remove_document("custom-documents", "a.json", &["w1".to_string()])
        .await
        .unwrap();

    assert_eq!(app.vector_index().namespace_count("w1").unwrap(), 0);
    assert!(!app.vector_cache().has_cached_files());
    assert!(!app
        .config()
        .documents_dir()
        .join("custom-documents/a.json")
        .exists());
}
