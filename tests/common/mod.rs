//! Shared test doubles for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use rag_session_engine::{
    Error, GenerationChunk, GenerationOptions, ModelProvider, Result, TokenUsage,
};

pub const STUB_ANSWER_FRAGMENTS: [&str; 2] = ["Based on the context, ", "here is the answer."];
pub const STUB_TOTAL_TOKENS: u64 = 42;

/// Deterministic provider stub.
///
/// Embeddings derive from a hash of the text (stable across calls) unless a
/// fixed mapping was registered. Generation failures are scriptable per
/// operation: `fail_hypothesis` breaks the plain `generate` call (the HyDE
/// path) while leaving streamed generation working; `fail_stream` breaks
/// the streamed call.
pub struct StubProvider {
    dimension: usize,
    table: RwLock<HashMap<String, Vec<f32>>>,
    pub embed_calls: AtomicU32,
    pub fail_hypothesis: AtomicBool,
    pub fail_stream: AtomicBool,
    pub embed_delay: Option<Duration>,
}

impl StubProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            table: RwLock::new(HashMap::new()),
            embed_calls: AtomicU32::new(0),
            fail_hypothesis: AtomicBool::new(false),
            fail_stream: AtomicBool::new(false),
            embed_delay: None,
        }
    }

    pub fn with_embed_delay(mut self, delay: Duration) -> Self {
        self.embed_delay = Some(delay);
        self
    }

    /// Pin the embedding returned for an exact text.
    pub fn map(&self, text: &str, embedding: Vec<f32>) {
        self.table.write().insert(text.to_string(), embedding);
    }

    fn derive_embedding(&self, text: &str) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let seed = hasher.finish();
        let mut v: Vec<f32> = (0..self.dimension)
            .map(|i| {
                let x = seed.wrapping_mul(i as u64 + 1).wrapping_add(0x9E3779B9);
                (x % 10_000) as f32 / 10_000.0 * 2.0 - 1.0
            })
            .collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(f32::EPSILON);
        for x in &mut v {
            *x /= norm;
        }
        v
    }
}

#[async_trait]
impl ModelProvider for StubProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(delay) = self.embed_delay {
            tokio::time::sleep(delay).await;
        }
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fixed) = self.table.read().get(text) {
            return Ok(fixed.clone());
        }
        Ok(self.derive_embedding(text))
    }

    async fn generate(&self, _prompt: &str, _options: &GenerationOptions) -> Result<String> {
        if self.fail_hypothesis.load(Ordering::SeqCst) {
            return Err(Error::ProviderUnavailable(
                "generation endpoint unavailable".to_string(),
            ));
        }
        Ok("A plausible reference passage answering the question.".to_string())
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _options: &GenerationOptions,
        _cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<GenerationChunk>>> {
        if self.fail_stream.load(Ordering::SeqCst) {
            return Err(Error::ProviderUnavailable(
                "streaming generation unavailable".to_string(),
            ));
        }
        let mut chunks: Vec<Result<GenerationChunk>> = STUB_ANSWER_FRAGMENTS
            .iter()
            .map(|s| Ok(GenerationChunk::Text(s.to_string())))
            .collect();
        chunks.push(Ok(GenerationChunk::Usage(TokenUsage {
            prompt_tokens: 30,
            candidate_tokens: 12,
            total_tokens: STUB_TOTAL_TOKENS,
        })));
        Ok(futures::stream::iter(chunks).boxed())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "stub-model"
    }
}
