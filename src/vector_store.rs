//! Per-session append-only vector index with SIMD cosine top-K search.
//!
//! Appenders may be concurrent; readers take a snapshot (a consistent
//! prefix of the insertion sequence). Scores tie-break by insertion order,
//! which keeps results deterministic even when scoring runs in parallel.

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::document::Chunk;
use crate::error::{Error, Result};
use crate::simd::SimdDispatcher;

/// Above this snapshot size, scoring fans out across the rayon pool.
const PARALLEL_SCORING_THRESHOLD: usize = 100;

#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResult {
    pub chunk: Chunk,
    pub similarity_score: f32,
    pub rank: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub vector_count: usize,
    pub dimension: usize,
    pub memory_usage_bytes: usize,
    pub total_searches: u64,
    pub avg_search_time_us: u64,
}

pub struct VectorIndex {
    entries: RwLock<Vec<Arc<EmbeddedChunk>>>,
    /// Fixed on first insert; 0 while the index is empty.
    dimension: AtomicUsize,
    simd: SimdDispatcher,
    total_searches: AtomicU64,
    total_search_micros: AtomicU64,
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            dimension: AtomicUsize::new(0),
            simd: SimdDispatcher::new(),
            total_searches: AtomicU64::new(0),
            total_search_micros: AtomicU64::new(0),
        }
    }

    /// Append one embedded chunk. The first insert fixes the index
    /// dimension; any later mismatch is an invariant violation.
    pub fn push(&self, chunk: Chunk, embedding: Vec<f32>) -> Result<()> {
        let dim = embedding.len();
        if dim == 0 {
            return Err(Error::Validation("embedding must not be empty".to_string()));
        }
        let known = self
            .dimension
            .compare_exchange(0, dim, Ordering::AcqRel, Ordering::Acquire)
            .unwrap_or_else(|prev| prev);
        if known != dim && known != 0 {
            tracing::error!(expected = known, actual = dim, chunk_id = %chunk.id,
                "embedding dimension mismatch in session index");
            return Err(Error::DimensionMismatch {
                expected: known,
                actual: dim,
            });
        }
        self.entries
            .write()
            .push(Arc::new(EmbeddedChunk { chunk, embedding }));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension.load(Ordering::Acquire)
    }

    /// Consistent snapshot of the current contents.
    pub fn snapshot(&self) -> Vec<Arc<EmbeddedChunk>> {
        self.entries.read().clone()
    }

    pub fn chunk_count_for_document(&self, document_id: &str) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|e| e.chunk.document_id == document_id)
            .count()
    }

    /// Top-K cosine search over a snapshot of the index.
    ///
    /// Entries scoring below `min_score` are discarded; the rest are sorted
    /// by score descending with insertion order breaking ties, and the
    /// first `top_k` get ranks `1..=k`.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<RetrievalResult>> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let dim = self.dimension();
        if query.len() != dim {
            return Err(Error::DimensionMismatch {
                expected: dim,
                actual: query.len(),
            });
        }

        let started = Instant::now();

        let mut scored: Vec<(usize, f32)> = if snapshot.len() >= PARALLEL_SCORING_THRESHOLD {
            snapshot
                .par_iter()
                .enumerate()
                .map(|(i, e)| Ok((i, self.simd.cosine_similarity(query, &e.embedding)?)))
                .collect::<Result<Vec<_>>>()?
        } else {
            snapshot
                .iter()
                .enumerate()
                .map(|(i, e)| Ok((i, self.simd.cosine_similarity(query, &e.embedding)?)))
                .collect::<Result<Vec<_>>>()?
        };

        scored.retain(|(_, score)| *score >= min_score);
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(top_k);

        let results = scored
            .into_iter()
            .enumerate()
            .map(|(pos, (idx, score))| RetrievalResult {
                chunk: snapshot[idx].chunk.clone(),
                similarity_score: score,
                rank: pos + 1,
            })
            .collect();

        let elapsed = started.elapsed().as_micros() as u64;
        self.total_searches.fetch_add(1, Ordering::Relaxed);
        self.total_search_micros.fetch_add(elapsed, Ordering::Relaxed);

        Ok(results)
    }

    pub fn stats(&self) -> IndexStats {
        let searches = self.total_searches.load(Ordering::Relaxed);
        let micros = self.total_search_micros.load(Ordering::Relaxed);
        IndexStats {
            vector_count: self.len(),
            dimension: self.dimension(),
            memory_usage_bytes: self.estimate_memory_usage(),
            total_searches: searches,
            avg_search_time_us: if searches > 0 { micros / searches } else { 0 },
        }
    }

    /// Rough live-bytes estimate: embedding payload plus chunk text plus
    /// per-entry bookkeeping overhead.
    pub fn estimate_memory_usage(&self) -> usize {
        let entries = self.entries.read();
        entries
            .iter()
            .map(|e| e.embedding.len() * 4 + e.chunk.content.len() + 96)
            .sum()
    }
}
