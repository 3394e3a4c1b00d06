use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::TaskId;
use crate::model::Learning;
use crate::store::Store;

pub mod embedding;

pub use embedding::{EmbeddingProvider, EmbeddingService, NoopEmbedding};

pub const MAX_SEARCH_LIMIT: usize = 100;
pub const DEFAULT_SEARCH_LIMIT: usize = 20;
/// Fixed floor used by `context_for_task`.
pub const CONTEXT_MIN_SCORE: f64 = 0.2;
pub const CONTEXT_LIMIT: usize = 10;

const WEIGHTS_CONFIG_KEY: &str = "search_weights";
const RECENCY_HORIZON_DAYS: f64 = 30.0;
const OUTCOME_BOOST_FACTOR: f64 = 0.1;
const FREQUENCY_BOOST_FACTOR: f64 = 0.05;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SearchWeights {
    pub bm25: f64,
    pub vector: f64,
    pub recency: f64,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            bm25: 0.4,
            vector: 0.3,
            recency: 0.2,
        }
    }
}

impl SearchWeights {
    /// Weights come from the `config` row; a missing or malformed row falls
    /// back to the defaults.
    pub fn load(store: &Store) -> Self {
        store
            .config_get(WEIGHTS_CONFIG_KEY)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, store: &Store) -> Result<()> {
        store.config_set(WEIGHTS_CONFIG_KEY, &serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub limit: usize,
    pub min_score: f64,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: DEFAULT_SEARCH_LIMIT,
            min_score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub learning: Learning,
    pub score: f64,
    pub bm25: f64,
    pub vector: f64,
    pub recency: f64,
}

/// BM25 + dense-vector + recency fusion over the learnings corpus.
pub struct SearchService {
    store: Arc<Store>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl SearchService {
    pub fn new(store: Arc<Store>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, provider }
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let limit = query.limit.clamp(1, MAX_SEARCH_LIMIT);
        let min_score = query.min_score.clamp(0.0, 1.0);
        let weights = SearchWeights::load(&self.store);

        // 1. BM25 candidate set, normalized by the maximum raw score.
        let candidates = self.store.bm25_candidates(&query.query, 3 * limit)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let max_raw = candidates
            .iter()
            .map(|c| c.raw_score)
            .fold(f64::NEG_INFINITY, f64::max);

        // 2. Optional query embedding; unavailability contributes zero.
        let query_embedding =
            embedding::embed_with_retry(self.provider.as_ref(), &query.query).unwrap_or(None);

        let now = Utc::now();
        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .map(|candidate| {
                let bm25 = if max_raw > 0.0 {
                    (candidate.raw_score / max_raw).clamp(0.0, 1.0)
                } else {
                    0.0
                };

                let vector = match (&query_embedding, &candidate.learning.embedding) {
                    (Some(q), Some(e)) => (cosine(q, e) + 1.0) / 2.0,
                    _ => 0.0,
                };

                let age_days = (now - candidate.learning.created_at).num_seconds() as f64 / 86_400.0;
                let recency = (1.0 - age_days / RECENCY_HORIZON_DAYS).max(0.0);

                let outcome_boost = candidate
                    .learning
                    .outcome_score
                    .map(|s| OUTCOME_BOOST_FACTOR * s)
                    .unwrap_or(0.0);
                let frequency_boost =
                    FREQUENCY_BOOST_FACTOR * (1.0 + candidate.learning.usage_count as f64).ln();

                let score = weights.bm25 * bm25
                    + weights.vector * vector
                    + weights.recency * recency
                    + outcome_boost
                    + frequency_boost;

                SearchHit {
                    learning: candidate.learning,
                    score,
                    bm25,
                    vector,
                    recency,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.learning.id.cmp(&b.learning.id))
        });
        hits.retain(|h| h.score >= min_score);
        hits.truncate(limit);
        Ok(hits)
    }

    /// Learnings relevant to a task, queried from its title and description
    /// with a fixed floor. Returned learnings get a usage bump.
    pub fn context_for_task(&self, task_id: &TaskId) -> Result<Vec<SearchHit>> {
        let task = self.store.get_task(task_id)?;
        let hits = self.search(&SearchQuery {
            query: format!("{} {}", task.title, task.description),
            limit: CONTEXT_LIMIT,
            min_score: CONTEXT_MIN_SCORE,
        })?;

        let ids: Vec<i64> = hits.iter().map(|h| h.learning.id).collect();
        self.store.increment_learning_usage(&ids)?;
        Ok(hits)
    }
}

/// Cosine similarity; zero for mismatched dimensions or zero-norm vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64).powi(2);
        norm_b += (*y as f64).powi(2);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::learnings::NewLearning;
    use crate::store::tasks::NewTask;

    struct FixedEmbedding(Vec<f32>);

    impl EmbeddingProvider for FixedEmbedding {
        fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>> {
            Ok(Some(self.0.clone()))
        }
    }

    fn service() -> (Arc<Store>, SearchService) {
        let store = Arc::new(Store::open_memory().unwrap());
        let svc = SearchService::new(Arc::clone(&store), Arc::new(NoopEmbedding));
        (store, svc)
    }

    fn learn(store: &Store, content: &str) -> Learning {
        store
            .create_learning(NewLearning {
                content: content.into(),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!((cosine(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-9);
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn empty_query_or_corpus_yields_nothing() {
        let (_store, svc) = service();
        assert!(svc.search(&SearchQuery::new("anything")).unwrap().is_empty());
        assert!(svc.search(&SearchQuery::new("   ")).unwrap().is_empty());
    }

    #[test]
    fn matches_rank_above_min_score() {
        let (store, svc) = service();
        learn(&store, "atomic rename prevents partial jsonl files");
        learn(&store, "unrelated topic entirely");

        let hits = svc.search(&SearchQuery::new("jsonl rename")).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].learning.content.contains("jsonl"));
        assert!(hits[0].bm25 > 0.0);
        // Fresh learning: recency near 1.
        assert!(hits[0].recency > 0.9);
    }

    #[test]
    fn outcome_boost_never_decreases_score() {
        let (store, svc) = service();
        let l = learn(&store, "outcome sensitive learning");

        let before = svc.search(&SearchQuery::new("outcome")).unwrap()[0].score;
        store.set_learning_outcome(l.id, 1.0).unwrap();
        let after = svc.search(&SearchQuery::new("outcome")).unwrap()[0].score;
        assert!(after >= before);
        assert!((after - before - OUTCOME_BOOST_FACTOR).abs() < 1e-9);
    }

    #[test]
    fn usage_boost_is_logarithmic() {
        let (store, svc) = service();
        let l = learn(&store, "frequently used learning");

        let base = svc.search(&SearchQuery::new("frequently")).unwrap()[0].score;
        store.increment_learning_usage(&[l.id]).unwrap();
        let bumped = svc.search(&SearchQuery::new("frequently")).unwrap()[0].score;
        let expected = FREQUENCY_BOOST_FACTOR * (2.0_f64.ln() - 1.0_f64.ln());
        assert!((bumped - base - expected).abs() < 1e-9);
    }

    #[test]
    fn vector_component_uses_stored_embeddings() {
        let store = Arc::new(Store::open_memory().unwrap());
        let svc = SearchService::new(
            Arc::clone(&store),
            Arc::new(FixedEmbedding(vec![1.0, 0.0])),
        );

        let aligned = learn(&store, "vector aligned entry");
        let opposed = learn(&store, "vector opposed entry");
        store.set_learning_embedding(aligned.id, &[1.0, 0.0]).unwrap();
        store.set_learning_embedding(opposed.id, &[-1.0, 0.0]).unwrap();

        let hits = svc.search(&SearchQuery::new("vector entry")).unwrap();
        let aligned_hit = hits.iter().find(|h| h.learning.id == aligned.id).unwrap();
        let opposed_hit = hits.iter().find(|h| h.learning.id == opposed.id).unwrap();
        assert!((aligned_hit.vector - 1.0).abs() < 1e-6);
        assert!(opposed_hit.vector.abs() < 1e-6);
        assert!(aligned_hit.score > opposed_hit.score);
    }

    #[test]
    fn unavailable_embeddings_contribute_zero() {
        let (store, svc) = service();
        let l = learn(&store, "has stored embedding");
        store.set_learning_embedding(l.id, &[1.0, 0.0]).unwrap();

        let hits = svc.search(&SearchQuery::new("stored embedding")).unwrap();
        assert_eq!(hits[0].vector, 0.0);
    }

    #[test]
    fn limit_and_min_score_are_applied() {
        let (store, svc) = service();
        for i in 0..8 {
            learn(&store, &format!("pagination fodder number {i}"));
        }

        let hits = svc
            .search(&SearchQuery {
                query: "pagination fodder".into(),
                limit: 3,
                min_score: 0.0,
            })
            .unwrap();
        assert_eq!(hits.len(), 3);

        let hits = svc
            .search(&SearchQuery {
                query: "pagination fodder".into(),
                limit: 10,
                min_score: 0.99,
            })
            .unwrap();
        assert!(hits.len() <= 8);
        for hit in &hits {
            assert!(hit.score >= 0.99);
        }
    }

    #[test]
    fn custom_weights_row_is_honored() {
        let (store, svc) = service();
        learn(&store, "weight sensitive");

        SearchWeights {
            bm25: 0.0,
            vector: 0.0,
            recency: 0.0,
        }
        .save(&store)
        .unwrap();
        let hits = svc.search(&SearchQuery::new("weight")).unwrap();
        // Only boosts remain; fresh learning with no usage scores zero.
        assert!(hits[0].score.abs() < 1e-9);

        assert_eq!(SearchWeights::load(&store).bm25, 0.0);
    }

    #[test]
    fn context_for_task_bumps_usage() {
        let (store, svc) = service();
        let l = learn(&store, "codec details for the jsonl exporter");
        let task = store
            .create_task(NewTask {
                title: "fix jsonl exporter".into(),
                description: "codec".into(),
                ..Default::default()
            })
            .unwrap();

        let hits = svc.context_for_task(&task.id).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(store.get_learning(l.id).unwrap().usage_count, 1);
        for hit in &hits {
            assert!(hit.score >= CONTEXT_MIN_SCORE);
        }
    }
}
