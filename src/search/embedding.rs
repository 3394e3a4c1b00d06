use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;
use crate::store::Store;

/// Seam to the external embedding-model process. `Ok(None)` means the
/// backend is unavailable; `Err` means a transient failure worth retrying.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Option<Vec<f32>>>;
}

/// Provider used when `TX_EMBEDDINGS` is off: always unavailable.
pub struct NoopEmbedding;

impl EmbeddingProvider for NoopEmbedding {
    fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>> {
        Ok(None)
    }
}

const MAX_EMBED_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 50;

/// Bounded exponential retry around the provider. Unavailability is not
/// retried; only transient errors are.
pub(crate) fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    text: &str,
) -> Result<Option<Vec<f32>>> {
    let mut last_err = None;
    for attempt in 0..MAX_EMBED_ATTEMPTS {
        match provider.embed(text) {
            Ok(result) => return Ok(result),
            Err(err) => {
                tracing::debug!(attempt, error = %err, "embedding attempt failed");
                last_err = Some(err);
                if attempt + 1 < MAX_EMBED_ATTEMPTS {
                    std::thread::sleep(Duration::from_millis(RETRY_BASE_MS << attempt));
                }
            }
        }
    }
    Err(last_err.unwrap_or(crate::error::TxError::ServiceUnavailable("embedding")))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmbedAllReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EmbeddingCoverage {
    pub with_embedding: i64,
    pub total: i64,
    pub ratio: f64,
}

/// Embedding lifecycle over the learnings corpus.
pub struct EmbeddingService {
    store: Arc<Store>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingService {
    pub fn new(store: Arc<Store>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, provider }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Try to embed one learning, persisting on success. Returns whether an
    /// embedding was stored; unavailability is non-fatal.
    pub fn embed_learning(&self, id: i64) -> Result<bool> {
        let learning = self.store.get_learning(id)?;
        match embed_with_retry(self.provider.as_ref(), &learning.content)? {
            Some(vector) => {
                self.store.set_learning_embedding(id, &vector)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Backfill embeddings for learnings lacking them, or all with `force`.
    pub fn embed_all(&self, force_all: bool) -> Result<EmbedAllReport> {
        let candidates = self.store.learnings_for_embedding(force_all)?;
        let mut report = EmbedAllReport {
            total: candidates.len(),
            ..Default::default()
        };

        for learning in candidates {
            match embed_with_retry(self.provider.as_ref(), &learning.content) {
                Ok(Some(vector)) => {
                    self.store.set_learning_embedding(learning.id, &vector)?;
                    report.processed += 1;
                }
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    tracing::warn!(learning = learning.id, error = %err, "embedding failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    pub fn coverage(&self) -> Result<EmbeddingCoverage> {
        let (with_embedding, total) = self.store.embedding_coverage()?;
        let ratio = if total > 0 {
            with_embedding as f64 / total as f64
        } else {
            0.0
        };
        Ok(EmbeddingCoverage {
            with_embedding,
            total,
            ratio,
        })
    }
}
