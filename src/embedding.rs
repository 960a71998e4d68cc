//! Embedding client: content-hash cache, bounded concurrency, retries.
//!
//! Wraps a [`ModelProvider`] with the process-wide behaviors every caller
//! shares: cache hits bypass the provider entirely, provider-bound work is
//! gated by a counting semaphore, and transient upstream failures retry
//! with exponential backoff. Sessions never talk to the provider directly.

use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{cache_key, CacheStats, EmbeddingCache};
use crate::config::EmbeddingClientConfig;
use crate::error::{Error, Result};
use crate::provider::ModelProvider;

pub struct EmbeddingClient {
    provider: Arc<dyn ModelProvider>,
    cache: Arc<EmbeddingCache>,
    semaphore: Arc<Semaphore>,
    config: EmbeddingClientConfig,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn ModelProvider>, config: EmbeddingClientConfig) -> Self {
        let cache = Arc::new(EmbeddingCache::new(
            config.cache_duration,
            config.cache_max_bytes,
        ));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        Self {
            provider,
            cache,
            semaphore,
            config,
        }
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub fn provider(&self) -> &Arc<dyn ModelProvider> {
        &self.provider
    }

    /// Embed one text, consulting the cache first. Only a cache miss takes
    /// a semaphore permit and contacts the provider.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = cache_key(text);
        if let Some(embedding) = self.cache.get(&key) {
            return Ok(embedding);
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;

        // Another task may have embedded the same text while we waited.
        if let Some(embedding) = self.cache.get_quiet(&key) {
            return Ok(embedding);
        }

        let embedding = self.embed_with_retries(text).await?;
        self.cache.insert(key, embedding.clone());
        Ok(embedding)
    }

    /// Embed with a cancellation signal; the signal wins races against
    /// both the semaphore wait and the provider call.
    pub async fn embed_cancellable(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.embed(text) => result,
        }
    }

    async fn embed_with_retries(&self, text: &str) -> Result<Vec<f32>> {
        let mut last_err: Option<Error> = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // Backoff 1s, 2s, 4s, ... capped at 32s.
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }
            match self.provider.embed(text).await {
                Ok(embedding) => {
                    if attempt > 0 {
                        debug!(attempt, "embedding succeeded after retry");
                    }
                    return Ok(embedding);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    warn!(attempt, error = %e, "embedding attempt failed, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::ProviderUnavailable("embedding retries exhausted".into())))
    }

    /// Embed a batch concurrently (bounded by the shared semaphore).
    ///
    /// Returns one slot per input, `None` where that input failed; fails as
    /// a whole only when every input failed. Completion counts stream to
    /// `progress` as inputs finish, in completion order.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        progress: Option<mpsc::Sender<usize>>,
    ) -> Result<Vec<Option<Vec<f32>>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let completed = AtomicUsize::new(0);
        let outcomes: Vec<(usize, Result<Vec<f32>>)> =
            stream::iter(texts.iter().cloned().enumerate())
                .map(|(i, text)| {
                    let progress = progress.clone();
                    let completed = &completed;
                    async move {
                        let result = self.embed(&text).await;
                        let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                        if let Some(tx) = progress {
                            let _ = tx.send(done).await;
                        }
                        (i, result)
                    }
                })
                .buffer_unordered(self.config.max_concurrent_requests.max(1))
                .collect()
                .await;

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut failures = 0usize;
        let mut last_err: Option<Error> = None;
        for (i, outcome) in outcomes {
            match outcome {
                Ok(embedding) => slots[i] = Some(embedding),
                Err(e) => {
                    warn!(index = i, error = %e, "batch embedding slot failed");
                    failures += 1;
                    last_err = Some(e);
                }
            }
        }

        if failures == texts.len() {
            let detail = last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(Error::ProviderUnavailable(format!(
                "all {} embedding requests failed; last error: {}",
                texts.len(),
                detail
            )));
        }
        Ok(slots)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// (hits, misses) process-wide counters.
    pub fn cache_counters(&self) -> (u64, u64) {
        self.cache.counters()
    }

    pub fn purge_expired_cache(&self) -> usize {
        self.cache.purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{GenerationChunk, GenerationOptions};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use std::sync::atomic::AtomicU32;

    /// Provider stub: deterministic embeddings, scriptable failures.
    struct FlakyProvider {
        calls: AtomicU32,
        fail_first: u32,
        error_kind: fn() -> Error,
    }

    impl FlakyProvider {
        fn new(fail_first: u32, error_kind: fn() -> Error) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                error_kind,
            }
        }
    }

    #[async_trait]
    impl crate::provider::ModelProvider for FlakyProvider {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err((self.error_kind)());
            }
            Ok(vec![text.len() as f32, 1.0, 0.0])
        }

        async fn generate(&self, _prompt: &str, _options: &GenerationOptions) -> Result<String> {
            Ok("stub".to_string())
        }

        async fn generate_stream(
            &self,
            _prompt: &str,
            _options: &GenerationOptions,
            _cancel: CancellationToken,
        ) -> Result<BoxStream<'static, Result<GenerationChunk>>> {
            Ok(futures::stream::empty().boxed())
        }

        fn dimension(&self) -> usize {
            3
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    fn client(provider: Arc<FlakyProvider>) -> EmbeddingClient {
        EmbeddingClient::new(provider, EmbeddingClientConfig::default())
    }

    #[tokio::test]
    async fn cache_hit_bypasses_provider() {
        let provider = Arc::new(FlakyProvider::new(0, || Error::Cancelled));
        let c = client(provider.clone());
        c.embed("same text").await.unwrap();
        c.embed("same text").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        let (hits, misses) = c.cache_counters();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_on_transient_failure() {
        let provider = Arc::new(FlakyProvider::new(2, || {
            Error::ProviderUnavailable("429".into())
        }));
        let c = client(provider.clone());
        let embedding = c.embed("retry me").await.unwrap();
        assert_eq!(embedding.len(), 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_do_not_retry() {
        let provider = Arc::new(FlakyProvider::new(u32::MAX, || Error::Provider {
            status: 400,
            body: "bad request".into(),
        }));
        let c = client(provider.clone());
        assert!(c.embed("no retry").await.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_last_error() {
        let provider = Arc::new(FlakyProvider::new(u32::MAX, || {
            Error::ProviderUnavailable("503".into())
        }));
        let c = client(provider.clone());
        let err = c.embed("always fails").await.unwrap_err();
        assert!(err.is_retryable());
        // initial attempt + max_retries
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn batch_reports_progress_and_aligns_slots() {
        let provider = Arc::new(FlakyProvider::new(0, || Error::Cancelled));
        let c = client(provider);
        let texts: Vec<String> = (0..5).map(|i| format!("text {}", i)).collect();
        let (tx, mut rx) = mpsc::channel(16);
        let slots = c.embed_batch(&texts, Some(tx)).await.unwrap();
        assert_eq!(slots.len(), 5);
        assert!(slots.iter().all(|s| s.is_some()));
        let mut seen = Vec::new();
        while let Some(done) = rx.recv().await {
            seen.push(done);
        }
        // Completion order may interleave, but every count arrives once.
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_fails_only_when_all_slots_fail() {
        let provider = Arc::new(FlakyProvider::new(u32::MAX, || {
            Error::ProviderUnavailable("down".into())
        }));
        let c = client(provider);
        let texts: Vec<String> = (0..3).map(|i| format!("t{}", i)).collect();
        let err = c.embed_batch(&texts, None).await.unwrap_err();
        assert!(err.to_string().contains("all 3 embedding requests failed"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_embed() {
        let provider = Arc::new(FlakyProvider::new(0, || Error::Cancelled));
        let c = client(provider);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = c.embed_cancellable("text", &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
