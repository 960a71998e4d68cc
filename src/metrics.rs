//! Query and session metrics, plus a live-memory probe.
//!
//! [`QueryMetrics`] is the wire payload attached to a query stream's
//! terminal event; it is computed fresh per query. [`SessionMetrics`]
//! accumulates across every query and ingestion in a session using plain
//! atomics so readers never block writers.

use serde::Serialize;
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static LIVE_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Allocator shim that maintains a single live-bytes gauge, enabling the
/// `memory_used_bytes` metric without any bookkeeping beyond one atomic
/// add or sub per heap operation. Installed by the server binary:
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: MeteredAllocator = MeteredAllocator;
/// ```
pub struct MeteredAllocator;

unsafe impl GlobalAlloc for MeteredAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            LIVE_BYTES.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        LIVE_BYTES.fetch_sub(layout.size(), Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let ret = System.realloc(ptr, layout, new_size);
        if !ret.is_null() {
            // Grow before shrink so the gauge never dips below zero under
            // concurrent reallocs.
            LIVE_BYTES.fetch_add(new_size, Ordering::Relaxed);
            LIVE_BYTES.fetch_sub(layout.size(), Ordering::Relaxed);
        }
        ret
    }
}

/// Bytes currently allocated by the process, or 0 when the metered
/// allocator is not installed (callers fall back to index estimates).
pub fn live_memory_bytes() -> u64 {
    LIVE_BYTES.load(Ordering::Relaxed) as u64
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetrics {
    pub chunking_time_ms: u64,
    pub embedding_time_ms: u64,
    pub retrieval_time_ms: u64,
    pub generation_time_ms: u64,
    pub total_time_ms: u64,
    pub total_chunks: u64,
    pub chunks_retrieved: u64,
    pub embedding_cache_hits: u64,
    pub embedding_cache_misses: u64,
    pub total_tokens_used: u64,
    pub memory_used_bytes: u64,
}

/// Accumulated per-session counters.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    chunking_time_ms: AtomicU64,
    embedding_time_ms: AtomicU64,
    retrieval_time_ms: AtomicU64,
    generation_time_ms: AtomicU64,
    total_time_ms: AtomicU64,
    total_chunks: AtomicU64,
    chunks_retrieved: AtomicU64,
    total_tokens_used: AtomicU64,
    queries: AtomicU64,
    ingestions: AtomicU64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ingest(&self, chunking_ms: u64, embedding_ms: u64, chunks: u64) {
        self.chunking_time_ms.fetch_add(chunking_ms, Ordering::Relaxed);
        self.embedding_time_ms.fetch_add(embedding_ms, Ordering::Relaxed);
        self.total_time_ms
            .fetch_add(chunking_ms + embedding_ms, Ordering::Relaxed);
        self.total_chunks.fetch_add(chunks, Ordering::Relaxed);
        self.ingestions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self, metrics: &QueryMetrics) {
        self.retrieval_time_ms
            .fetch_add(metrics.retrieval_time_ms, Ordering::Relaxed);
        self.generation_time_ms
            .fetch_add(metrics.generation_time_ms, Ordering::Relaxed);
        self.total_time_ms
            .fetch_add(metrics.total_time_ms, Ordering::Relaxed);
        self.chunks_retrieved
            .fetch_add(metrics.chunks_retrieved, Ordering::Relaxed);
        self.total_tokens_used
            .fetch_add(metrics.total_tokens_used, Ordering::Relaxed);
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> QueryMetrics {
        QueryMetrics {
            chunking_time_ms: self.chunking_time_ms.load(Ordering::Relaxed),
            embedding_time_ms: self.embedding_time_ms.load(Ordering::Relaxed),
            retrieval_time_ms: self.retrieval_time_ms.load(Ordering::Relaxed),
            generation_time_ms: self.generation_time_ms.load(Ordering::Relaxed),
            total_time_ms: self.total_time_ms.load(Ordering::Relaxed),
            total_chunks: self.total_chunks.load(Ordering::Relaxed),
            chunks_retrieved: self.chunks_retrieved.load(Ordering::Relaxed),
            embedding_cache_hits: 0,
            embedding_cache_misses: 0,
            total_tokens_used: self.total_tokens_used.load(Ordering::Relaxed),
            memory_used_bytes: live_memory_bytes(),
        }
    }
}
