//! Process-wide embedding cache with sliding expiration.
//!
//! Keyed purely by text content (SHA-256), so identical text embeds once
//! regardless of which session asked. Capacity is byte-weighted; when full,
//! the least recently touched entries are evicted first. The cache stores
//! value copies only; sessions own their embeddings.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cache key for a text: `"emb_"` + lowercase hex SHA-256.
pub fn cache_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("emb_{:x}", hasher.finalize())
}

struct CacheEntry {
    embedding: Arc<Vec<f32>>,
    size_bytes: usize,
    last_access: Mutex<Instant>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub size_bytes: usize,
}

pub struct EmbeddingCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_bytes: usize,
    current_bytes: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(ttl: Duration, max_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_bytes,
            current_bytes: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up an embedding; a hit slides the entry's expiration forward.
    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                let mut last = entry.last_access.lock();
                if last.elapsed() > self.ttl {
                    true
                } else {
                    *last = Instant::now();
                    let value = entry.embedding.as_ref().clone();
                    drop(last);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            self.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Re-check after acquiring a concurrency permit: a hit still counts
    /// (another task filled the entry), but a miss was already counted by
    /// the first lookup and is not double-counted here.
    pub fn get_quiet(&self, key: &str) -> Option<Vec<f32>> {
        let entry = self.entries.get(key)?;
        let mut last = entry.last_access.lock();
        if last.elapsed() > self.ttl {
            return None;
        }
        *last = Instant::now();
        let value = entry.embedding.as_ref().clone();
        drop(last);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Insert an embedding, evicting least recently touched entries until
    /// the byte budget fits.
    pub fn insert(&self, key: String, embedding: Vec<f32>) {
        let size = embedding.len() * 4 + key.len();
        if size > self.max_bytes {
            return;
        }
        self.evict_until_fits(size);
        let entry = CacheEntry {
            embedding: Arc::new(embedding),
            size_bytes: size,
            last_access: Mutex::new(Instant::now()),
        };
        if let Some(old) = self.entries.insert(key, entry) {
            self.current_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }
        self.current_bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn remove(&self, key: &str) {
        if let Some((_, old)) = self.entries.remove(key) {
            self.current_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }
    }

    fn evict_until_fits(&self, incoming: usize) {
        while self.current_bytes.load(Ordering::Relaxed) + incoming > self.max_bytes {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| *e.last_access.lock())
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => self.remove(&key),
                None => break,
            }
        }
    }

    /// Drop every entry whose sliding window has lapsed.
    pub fn purge_expired(&self) -> usize {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.last_access.lock().elapsed() > self.ttl)
            .map(|e| e.key().clone())
            .collect();
        let count = stale.len();
        for key in stale {
            self.remove(&key);
        }
        count
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
            size_bytes: self.current_bytes.load(Ordering::Relaxed),
        }
    }

    /// (hits, misses) counter pair.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
