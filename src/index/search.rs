use std::collections::HashSet;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::index::collection::Collection;
use crate::index::types::DistanceMetric;

/// Hard cap on the candidate pool fetched from the KNN backend.
const MAX_CANDIDATES: usize = 200;

/// Options shared by all query operations.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Maximum results returned.
    pub top_n: usize,
    /// Metric-specific threshold (similarity floor, distance ceiling, or
    /// dot-product floor).
    pub threshold: f32,
    /// `sourceIdentifier` values to drop, used to keep pinned documents
    /// from being double-cited.
    pub filter_identifiers: HashSet<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_n: 4,
            threshold: 0.0,
            filter_identifiers: HashSet::new(),
        }
    }
}

/// One retrieved source, shaped for response payloads: the stored metadata
/// keeps `imageBase64` (the UI needs it) but the raw vector never leaves
/// the index layer.
#[derive(Debug, Clone, Serialize)]
pub struct SourceDocument {
    pub id: String,
    #[serde(rename = "docId")]
    pub doc_id: String,
    pub text: String,
    pub score: f32,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Results of one query operation.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    /// Chunk texts fed to the LLM; payload fields are stripped.
    #[serde(rename = "contextTexts")]
    pub context_texts: Vec<String>,
    /// Full source documents for the UI.
    #[serde(rename = "sourceDocuments")]
    pub sources: Vec<SourceDocument>,
}

/// A candidate handed to an external reranker.
#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub record_id: String,
    pub text: String,
}

/// Cross-encoder reranking seam. The model itself is an external
/// collaborator; implementations score `(query, candidate)` pairs.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Return one relevance score per candidate, higher is better.
    async fn rerank(&self, query: &str, candidates: &[RerankCandidate]) -> Result<Vec<f32>>;
}

fn candidate_limit(top_n: usize) -> usize {
    (2 * top_n).clamp(1, MAX_CANDIDATES)
}

/// Qualitative bucket for a cosine similarity, used in diagnostics.
fn similarity_bucket(similarity: f32) -> &'static str {
    match similarity {
        s if s >= 0.85 => "excellent",
        s if s >= 0.65 => "good",
        s if s >= 0.45 => "moderate",
        s if s >= 0.2 => "low",
        s if s >= -0.2 => "orthogonal",
        _ => "opposite",
    }
}

fn log_first_result(metric: DistanceMetric, raw_distance: f32, score: f32) {
    let cosine = 1.0 - raw_distance;
    debug!(
        ?metric,
        distance = raw_distance,
        score,
        cosine,
        bucket = similarity_bucket(cosine),
        "first result diagnostics"
    );
}

/// Convert a candidate list into shaped results, applying the identifier
/// filter and assembling context texts.
fn shape_results(
    collection: &Collection,
    scored: Vec<(String, f32, f32)>,
    options: &SearchOptions,
) -> SearchResults {
    let mut context_texts = Vec::new();
    let mut sources = Vec::new();

    for (record_id, score, raw_distance) in scored {
        if sources.len() >= options.top_n {
            break;
        }
        let Some(record) = collection.get_record(&record_id) else {
            continue;
        };
        let mut metadata = record.metadata();

        if !options.filter_identifiers.is_empty() {
            let identifier = metadata
                .get("sourceIdentifier")
                .and_then(Value::as_str)
                .unwrap_or("");
            if options.filter_identifiers.contains(identifier) {
                debug!(%record_id, identifier, "dropped pinned source from results");
                continue;
            }
        }

        if sources.is_empty() {
            log_first_result(DistanceMetric::Cosine, raw_distance, score);
        }

        // Context texts must never carry payload blobs.
        context_texts.push(record.text.clone());
        metadata.remove("pageContent");

        sources.push(SourceDocument {
            id: record.id.clone(),
            doc_id: record.doc_id.clone(),
            text: record.text,
            score,
            metadata,
        });
    }

    SearchResults {
        context_texts,
        sources,
    }
}

/// Cosine similarity search: similarity = clamp(1 − distance, −1, 1),
/// results at or above the threshold, ordered descending.
pub fn similarity_search(
    collection: &Collection,
    query_vector: &[f32],
    options: &SearchOptions,
) -> Result<SearchResults> {
    let candidates = collection.search(query_vector, candidate_limit(options.top_n))?;

    let scored: Vec<(String, f32, f32)> = candidates
        .into_iter()
        .filter_map(|(id, distance)| {
            if distance.is_nan() {
                warn!(record_id = %id, "NaN distance from KNN backend");
                return None;
            }
            let similarity = (1.0 - distance).clamp(-1.0, 1.0);
            (similarity >= options.threshold).then_some((id, similarity, distance))
        })
        .collect();

    let results = shape_results(collection, scored, options);
    info!(
        namespace = collection.namespace(),
        results = results.sources.len(),
        "similarity search complete"
    );
    Ok(results)
}

/// L2 distance search over unit vectors: `‖a−b‖ = √(2·d_cos)`. Results at
/// or below the threshold, ordered ascending, scored by distance.
pub fn distance_search(
    collection: &Collection,
    query_vector: &[f32],
    options: &SearchOptions,
) -> Result<SearchResults> {
    let candidates = collection.search(query_vector, candidate_limit(options.top_n))?;

    let mut scored: Vec<(String, f32, f32)> = candidates
        .into_iter()
        .filter_map(|(id, distance)| {
            if distance.is_nan() {
                warn!(record_id = %id, "NaN distance from KNN backend");
                return None;
            }
            let l2 = (2.0 * distance.max(0.0)).sqrt();
            (l2 <= options.threshold).then_some((id, l2, distance))
        })
        .collect();
    scored.sort_by(|a, b| a.1.total_cmp(&b.1));

    Ok(shape_results(collection, scored, options))
}

/// Dot-product search over unit vectors: score = 1 − d_cos, range −1…1.
/// Results at or above the threshold, ordered descending.
pub fn dot_product_search(
    collection: &Collection,
    query_vector: &[f32],
    options: &SearchOptions,
) -> Result<SearchResults> {
    let candidates = collection.search(query_vector, candidate_limit(options.top_n))?;

    let mut scored: Vec<(String, f32, f32)> = candidates
        .into_iter()
        .filter_map(|(id, distance)| {
            if distance.is_nan() {
                warn!(record_id = %id, "NaN distance from KNN backend");
                return None;
            }
            let score = (1.0 - distance).clamp(-1.0, 1.0);
            (score >= options.threshold).then_some((id, score, distance))
        })
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    Ok(shape_results(collection, scored, options))
}

/// Reranked search: fetch a wider cosine pool sized
/// `max(10, min(50, ⌈0.1·|collection|⌉))`, score it with the external
/// reranker, keep the top N.
pub async fn rerank_search(
    collection: &Collection,
    query_text: &str,
    query_vector: &[f32],
    reranker: &dyn Reranker,
    options: &SearchOptions,
) -> Result<SearchResults> {
    let pool_size = ((collection.vector_count() as f32 * 0.1).ceil() as usize).clamp(10, 50);
    let candidates = collection.search(query_vector, pool_size)?;

    let pool: Vec<RerankCandidate> = candidates
        .iter()
        .filter_map(|(id, _)| {
            collection.get_record(id).map(|record| RerankCandidate {
                record_id: id.clone(),
                text: record.text,
            })
        })
        .collect();
    if pool.is_empty() {
        return Ok(SearchResults {
            context_texts: Vec::new(),
            sources: Vec::new(),
        });
    }

    let scores = reranker.rerank(query_text, &pool).await?;
    let mut scored: Vec<(String, f32, f32)> = pool
        .iter()
        .zip(scores)
        .zip(candidates.iter())
        .map(|((candidate, score), (_, distance))| (candidate.record_id.clone(), score, *distance))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    debug!(
        pool = pool.len(),
        top_n = options.top_n,
        "rerank pool scored"
    );
    Ok(shape_results(collection, scored, options))
}

/// Dispatch a query over the requested metric.
pub async fn search_with_metric(
    collection: &Collection,
    metric: DistanceMetric,
    query_vector: &[f32],
    options: &SearchOptions,
) -> Result<SearchResults> {
    match metric {
        DistanceMetric::Cosine => similarity_search(collection, query_vector, options),
        DistanceMetric::L2 => distance_search(collection, query_vector, options),
        DistanceMetric::Dot => dot_product_search(collection, query_vector, options),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::types::VectorRecord;
    use serde_json::json;
    use tempfile::TempDir;

    fn unit(v: Vec<f32>) -> Vec<f32> {
        let mag = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.into_iter().map(|x| x / mag).collect()
    }

    fn record(id: &str, doc: &str, vector: Vec<f32>, identifier: &str) -> VectorRecord {
        let mut metadata = Map::new();
        metadata.insert("sourceIdentifier".into(), json!(identifier));
        metadata.insert("pageContent".into(), json!("HUGE"));
        metadata.insert("imageBase64".into(), json!("IMGDATA"));
        VectorRecord {
            id: id.into(),
            vector,
            text: format!("text-{id}"),
            doc_id: doc.into(),
            metadata,
        }
    }

    fn seeded_collection(dir: &TempDir) -> Collection {
        let collection =
            Collection::create(&dir.path().join("w.collection"), "w", 3).unwrap();
        collection
            .add_records(&[
                record("a", "d1", unit(vec![1.0, 0.0, 0.0]), "src-a"),
                record("b", "d2", unit(vec![0.9, 0.1, 0.0]), "src-b"),
                record("c", "d3", unit(vec![0.0, 0.0, 1.0]), "src-c"),
            ])
            .unwrap();
        collection
    }

    #[test]
    fn similarity_orders_and_thresholds() {
        let dir = TempDir::new().unwrap();
        let collection = seeded_collection(&dir);
        let options = SearchOptions {
            top_n: 3,
            threshold: 0.5,
            ..Default::default()
        };

        let results =
            similarity_search(&collection, &unit(vec![1.0, 0.05, 0.0]), &options).unwrap();
        // The orthogonal vector "c" falls below the threshold.
        assert_eq!(results.sources.len(), 2);
        assert_eq!(results.sources[0].id, "a");
        assert!(results.sources[0].score >= results.sources[1].score);
        assert!(results.sources.iter().all(|s| s.score >= 0.5));
    }

    #[test]
    fn similarity_respects_top_n() {
        let dir = TempDir::new().unwrap();
        let collection = seeded_collection(&dir);
        let options = SearchOptions {
            top_n: 1,
            threshold: -1.0,
            ..Default::default()
        };
        let results =
            similarity_search(&collection, &unit(vec![1.0, 0.0, 0.0]), &options).unwrap();
        assert_eq!(results.sources.len(), 1);
    }

    #[test]
    fn filter_identifiers_drop_pinned_sources() {
        let dir = TempDir::new().unwrap();
        let collection = seeded_collection(&dir);
        let options = SearchOptions {
            top_n: 3,
            threshold: -1.0,
            filter_identifiers: HashSet::from(["src-a".to_string()]),
        };
        let results =
            similarity_search(&collection, &unit(vec![1.0, 0.0, 0.0]), &options).unwrap();
        assert!(results.sources.iter().all(|s| s.id != "a"));
    }

    #[test]
    fn context_texts_are_stripped_sources_keep_image() {
        let dir = TempDir::new().unwrap();
        let collection = seeded_collection(&dir);
        let options = SearchOptions {
            top_n: 1,
            threshold: -1.0,
            ..Default::default()
        };
        let results =
            similarity_search(&collection, &unit(vec![1.0, 0.0, 0.0]), &options).unwrap();

        assert_eq!(results.context_texts, vec!["text-a".to_string()]);
        let source = &results.sources[0];
        assert!(!source.metadata.contains_key("pageContent"));
        assert_eq!(source.metadata.get("imageBase64"), Some(&json!("IMGDATA")));
    }

    #[test]
    fn distance_search_keeps_below_threshold_ascending() {
        let dir = TempDir::new().unwrap();
        let collection = seeded_collection(&dir);
        let options = SearchOptions {
            top_n: 3,
            threshold: 0.5,
            ..Default::default()
        };
        let results = distance_search(&collection, &unit(vec![1.0, 0.0, 0.0]), &options).unwrap();
        // Only "a" (d=0) and "b" (small angle) sit within L2 0.5 of the query.
        assert_eq!(results.sources.len(), 2);
        assert!(results.sources[0].score <= results.sources[1].score);
    }

    #[test]
    fn dot_search_keeps_above_threshold_descending() {
        let dir = TempDir::new().unwrap();
        let collection = seeded_collection(&dir);
        let options = SearchOptions {
            top_n: 3,
            threshold: 0.8,
            ..Default::default()
        };
        let results =
            dot_product_search(&collection, &unit(vec![1.0, 0.0, 0.0]), &options).unwrap();
        assert_eq!(results.sources.len(), 2);
        assert!(results.sources[0].score >= results.sources[1].score);
        assert!(results.sources.iter().all(|s| s.score >= 0.8));
    }

    struct ReverseReranker;

    #[async_trait]
    impl Reranker for ReverseReranker {
        async fn rerank(&self, _query: &str, candidates: &[RerankCandidate]) -> Result<Vec<f32>> {
            // Score candidates in reverse of their pool order.
            Ok((0..candidates.len()).map(|i| i as f32).collect())
        }
    }

    #[tokio::test]
    async fn rerank_reorders_the_pool() {
        let dir = TempDir::new().unwrap();
        let collection = seeded_collection(&dir);
        let options = SearchOptions {
            top_n: 2,
            threshold: -1.0,
            ..Default::default()
        };
        let results = rerank_search(
            &collection,
            "query",
            &unit(vec![1.0, 0.0, 0.0]),
            &ReverseReranker,
            &options,
        )
        .await
        .unwrap();

        assert_eq!(results.sources.len(), 2);
        // The cosine-closest candidate "a" is scored lowest by the reranker.
        assert_ne!(results.sources[0].id, "a");
    }

    #[test]
    fn candidate_limit_is_capped() {
        assert_eq!(candidate_limit(4), 8);
        assert_eq!(candidate_limit(150), 200);
    }

    #[test]
    fn buckets_cover_the_range() {
        assert_eq!(similarity_bucket(0.95), "excellent");
        assert_eq!(similarity_bucket(0.7), "good");
        assert_eq!(similarity_bucket(0.5), "moderate");
        assert_eq!(similarity_bucket(0.3), "low");
        assert_eq!(similarity_bucket(0.0), "orthogonal");
        assert_eq!(similarity_bucket(-0.9), "opposite");
    }
}
