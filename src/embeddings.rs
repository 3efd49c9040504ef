use crate::cancel::CancelToken;
use crate::error::{RagError, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Representation of a vector embedding
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Embedding { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// False if any component is NaN or infinite
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// Distance function an index ranks neighbors by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Cosine,
    L2,
}

impl DistanceMetric {
    /// Distance between two equal-length vectors; smaller is closer
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
            DistanceMetric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }

    /// Relevance derived from a distance; larger is more relevant
    pub fn relevance(&self, distance: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::L2 => 1.0 / (1.0 + distance),
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Identity of the model behind an embedder; stored with every persisted index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingModel {
    pub name: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
}

/// External text-to-vector capability
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model this embedder produces vectors for
    fn model(&self) -> &EmbeddingModel;

    /// Embed several texts; the output has the same length and order as the input
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::permanent_embedding("No embedding returned"))
    }
}

/// Bounded retry with exponential backoff for transient embedding failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Knobs for how embedding requests are issued
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingOptions {
    /// Texts per embedding request
    pub batch_size: usize,
    /// Requests in flight at once while building an index
    pub concurrency: usize,
    /// Deadline for a single request
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        EmbeddingOptions {
            batch_size: 100,
            concurrency: 4,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Wraps an [`Embedder`] with batching, timeouts, retries and output validation
#[derive(Clone)]
pub struct BatchEmbedder {
    embedder: Arc<dyn Embedder>,
    options: EmbeddingOptions,
}

impl BatchEmbedder {
    pub fn new(embedder: Arc<dyn Embedder>, options: EmbeddingOptions) -> Self {
        BatchEmbedder { embedder, options }
    }

    pub fn model(&self) -> &EmbeddingModel {
        self.embedder.model()
    }

    /// Embed a query text
    pub async fn embed_query(&self, text: &str, cancel: &CancelToken) -> Result<Embedding> {
        self.embed_with_retry(&[text.to_string()], cancel)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::permanent_embedding("No embedding returned for query"))
    }

    /// Embed every text, issuing batches concurrently and merging them back in input order
    pub async fn embed_all(&self, texts: &[String], cancel: &CancelToken) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (batch_index, batch) in texts.chunks(self.options.batch_size.max(1)).enumerate() {
            let batch = batch.to_vec();
            let embedder = self.clone();
            let cancel = cancel.clone();
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| RagError::Cancelled)?;
                let vectors = embedder.embed_with_retry(&batch, &cancel).await?;
                Ok::<_, RagError>((batch_index, vectors))
            });
        }

        let mut batches = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(batch)) => batches.push(batch),
                Ok(Err(e)) => return Err(e),
                Err(e) => {
                    return Err(RagError::permanent_embedding(format!(
                        "Embedding task failed: {}",
                        e
                    )))
                }
            }
        }

        batches.sort_by_key(|(batch_index, _)| *batch_index);
        debug!("Embedded {} texts in {} batches", texts.len(), batches.len());

        Ok(batches.into_iter().flat_map(|(_, vectors)| vectors).collect())
    }

    async fn embed_with_retry(&self, batch: &[String], cancel: &CancelToken) -> Result<Vec<Embedding>> {
        let retry = self.options.retry;
        let timeout = self.options.timeout;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = cancel
                .run(timeout, self.embedder.embed_batch(batch), || {
                    RagError::transient_embedding(format!(
                        "Embedding request timed out after {:?}",
                        timeout
                    ))
                })
                .await
                .and_then(|vectors| self.validate(batch.len(), vectors));

            match outcome {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        "Embedding attempt {} of {} failed: {}; retrying in {:?}",
                        attempt, retry.max_attempts, e, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RagError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn validate(&self, expected: usize, vectors: Vec<Embedding>) -> Result<Vec<Embedding>> {
        if vectors.len() != expected {
            return Err(RagError::permanent_embedding(format!(
                "Expected {} embeddings, service returned {}",
                expected,
                vectors.len()
            )));
        }

        let dimension = self.model().dimension;
        if let Some(bad) = vectors.iter().find(|v| v.dimension() != dimension) {
            return Err(RagError::permanent_embedding(format!(
                "Model {} returned a {}-dimensional vector, expected {}",
                self.model().name,
                bad.dimension(),
                dimension
            )));
        }

        if vectors.iter().any(|v| !v.is_finite()) {
            return Err(RagError::permanent_embedding(format!(
                "Model {} returned a vector with NaN or infinite values",
                self.model().name
            )));
        }

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyEmbedder {
        model: EmbeddingModel,
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        transient: bool,
    }

    impl FlakyEmbedder {
        fn new(failures: usize, transient: bool) -> Self {
            FlakyEmbedder {
                model: EmbeddingModel {
                    name: "flaky".to_string(),
                    dimension: 2,
                    metric: DistanceMetric::Cosine,
                },
                failures_left: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                transient,
            }
        }
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model(&self) -> &EmbeddingModel {
            &self.model
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(RagError::Embedding {
                    message: "flaky".to_string(),
                    transient: self.transient,
                });
            }
            Ok(texts
                .iter()
                .map(|t| Embedding::new(vec![t.len() as f32, 1.0]))
                .collect())
        }
    }

    fn fast_options(batch_size: usize) -> EmbeddingOptions {
        EmbeddingOptions {
            batch_size,
            concurrency: 3,
            timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_metrics_rank_identical_vectors_closest() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        for metric in [DistanceMetric::Cosine, DistanceMetric::L2] {
            assert!(metric.distance(&a, &a) < metric.distance(&a, &b));
            assert!(metric.relevance(metric.distance(&a, &a)) > metric.relevance(metric.distance(&a, &b)));
        }
    }

    #[tokio::test]
    async fn test_embed_all_preserves_order_across_batches() {
        let embedder = Arc::new(FlakyEmbedder::new(0, true));
        let batcher = BatchEmbedder::new(embedder.clone(), fast_options(2));
        let texts: Vec<String> = (1..=7).map(|n| "x".repeat(n)).collect();

        let vectors = batcher.embed_all(&texts, &CancelToken::new()).await.unwrap();

        let lengths: Vec<f32> = vectors.iter().map(|v| v.values[0]).collect();
        assert_eq!(lengths, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let embedder = Arc::new(FlakyEmbedder::new(2, true));
        let batcher = BatchEmbedder::new(embedder.clone(), fast_options(10));

        let vector = batcher.embed_query("hello", &CancelToken::new()).await.unwrap();

        assert_eq!(vector.values, vec![5.0, 1.0]);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let embedder = Arc::new(FlakyEmbedder::new(5, true));
        let batcher = BatchEmbedder::new(embedder.clone(), fast_options(10));

        let result = batcher.embed_query("hello", &CancelToken::new()).await;

        assert!(matches!(result, Err(RagError::Embedding { .. })));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let embedder = Arc::new(FlakyEmbedder::new(1, false));
        let batcher = BatchEmbedder::new(embedder.clone(), fast_options(10));

        assert!(batcher.embed_query("hello", &CancelToken::new()).await.is_err());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejects_wrong_dimension() {
        struct WideEmbedder(EmbeddingModel);

        #[async_trait]
        impl Embedder for WideEmbedder {
            fn model(&self) -> &EmbeddingModel {
                &self.0
            }

            async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
                Ok(texts.iter().map(|_| Embedding::new(vec![0.5; 3])).collect())
            }
        }

        let embedder = Arc::new(WideEmbedder(EmbeddingModel {
            name: "wide".to_string(),
            dimension: 2,
            metric: DistanceMetric::L2,
        }));
        let batcher = BatchEmbedder::new(embedder, fast_options(10));

        let result = batcher.embed_query("hello", &CancelToken::new()).await;
        assert!(matches!(result, Err(RagError::Embedding { transient: false, .. })));
    }

    #[tokio::test]
    async fn test_rejects_non_finite_values() {
        struct NanEmbedder(EmbeddingModel);

        #[async_trait]
        impl Embedder for NanEmbedder {
            fn model(&self) -> &EmbeddingModel {
                &self.0
            }

            async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
                Ok(texts
                    .iter()
                    .map(|_| Embedding::new(vec![f32::NAN, 1.0]))
                    .collect())
            }
        }

        let embedder = Arc::new(NanEmbedder(EmbeddingModel {
            name: "nan".to_string(),
            dimension: 2,
            metric: DistanceMetric::Cosine,
        }));
        let batcher = BatchEmbedder::new(embedder, fast_options(10));

        let texts = vec!["hello".to_string()];
        let result = batcher.embed_all(&texts, &CancelToken::new()).await;
        assert!(matches!(result, Err(RagError::Embedding { transient: false, .. })));
    }
}
