//! Session lifecycle: creation, sliding-TTL lookup, eviction.
//!
//! A [`Session`] exclusively owns its documents and vector index; evicting
//! the session releases both. The [`SessionManager`] holds the only
//! cross-session state, a concurrent map of live sessions, and runs a
//! background sweeper that evicts entries whose sliding window has lapsed.
//! Any successful lookup extends the window.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::document::{new_hex_id, Document};
use crate::error::{Error, Result};
use crate::metrics::SessionMetrics;
use crate::vector_store::VectorIndex;

/// 20-character URL-safe session id.
pub fn new_session_id() -> String {
    format!("rag_{}", new_hex_id())
}

struct Expiry {
    deadline: Instant,
    at: DateTime<Utc>,
}

pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub config: SessionConfig,
    expiry: RwLock<Expiry>,
    documents: RwLock<Vec<Document>>,
    pub vector_index: VectorIndex,
    pub metrics: SessionMetrics,
}

impl Session {
    fn new(config: SessionConfig) -> Self {
        let ttl = config.session_ttl;
        Self {
            session_id: new_session_id(),
            created_at: Utc::now(),
            config,
            expiry: RwLock::new(Expiry {
                deadline: Instant::now() + ttl,
                at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            }),
            documents: RwLock::new(Vec::new()),
            vector_index: VectorIndex::new(),
            metrics: SessionMetrics::new(),
        }
    }

    /// Slide the expiration window forward to now + TTL.
    pub fn touch(&self) {
        let ttl = self.config.session_ttl;
        let mut expiry = self.expiry.write();
        expiry.deadline = Instant::now() + ttl;
        expiry.at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expiry.read().deadline
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expiry.read().at
    }

    pub fn document_count(&self) -> usize {
        self.documents.read().len()
    }

    pub fn chunk_count(&self) -> usize {
        self.vector_index.len()
    }

    pub fn documents(&self) -> Vec<Document> {
        self.documents.read().clone()
    }

    /// Register a fully ingested document, enforcing the per-session cap.
    pub fn add_document(&self, document: Document) -> Result<()> {
        let mut documents = self.documents.write();
        if documents.len() >= self.config.max_documents {
            return Err(Error::Validation(format!(
                "document limit reached ({} documents). Maximum: {}",
                documents.len(),
                self.config.max_documents
            )));
        }
        documents.push(document);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub active_sessions: usize,
    pub total_documents: usize,
    pub total_chunks: usize,
}

type EvictionHook = Box<dyn Fn(&Arc<Session>) + Send + Sync>;

pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    defaults: SessionConfig,
    sweep_interval: Duration,
    eviction_hook: RwLock<Option<EvictionHook>>,
    shutdown: broadcast::Sender<()>,
}

impl SessionManager {
    pub fn new(defaults: SessionConfig, sweep_interval: Duration) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            sessions: DashMap::new(),
            defaults,
            sweep_interval,
            eviction_hook: RwLock::new(None),
            shutdown,
        })
    }

    /// Create a session with the given config (or the process defaults)
    /// and install it with a fresh TTL window.
    pub fn create(&self, config: Option<SessionConfig>) -> Arc<Session> {
        let session = Arc::new(Session::new(config.unwrap_or_else(|| self.defaults.clone())));
        info!(session_id = %session.session_id, ttl_secs = session.config.session_ttl.as_secs(),
            "session created");
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        session
    }

    /// Look up a live session, sliding its TTL. Expired sessions are
    /// evicted on contact and reported as absent.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.get(session_id)?.value().clone();
        if session.is_expired() {
            self.evict(session_id);
            return None;
        }
        session.touch();
        Some(session)
    }

    /// Explicit deletion; fires the eviction hook.
    pub fn remove(&self, session_id: &str) -> bool {
        self.evict(session_id)
    }

    fn evict(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, session)) => {
                debug!(session_id, documents = session.document_count(),
                    chunks = session.chunk_count(), "session evicted");
                if let Some(hook) = self.eviction_hook.read().as_ref() {
                    hook(&session);
                }
                true
            }
            None => false,
        }
    }

    /// Register a callback fired whenever a session leaves the store
    /// (expiry or explicit removal).
    pub fn set_eviction_hook(&self, hook: impl Fn(&Arc<Session>) + Send + Sync + 'static) {
        *self.eviction_hook.write() = Some(Box::new(hook));
    }

    /// Evict every expired session; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();
        let mut evicted = 0;
        for id in expired {
            if self.evict(&id) {
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, "session sweep complete");
        }
        evicted
    }

    /// Spawn the background sweeper; it runs until [`Self::shutdown`].
    pub fn start_sweeper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep_expired();
                    }
                    _ = shutdown.recv() => {
                        debug!("session sweeper stopped");
                        break;
                    }
                }
            }
        });
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Sums across live (non-expired) sessions only.
    pub fn global_stats(&self) -> GlobalStats {
        let mut stats = GlobalStats {
            active_sessions: 0,
            total_documents: 0,
            total_chunks: 0,
        };
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.is_expired() {
                continue;
            }
            stats.active_sessions += 1;
            stats.total_documents += session.document_count();
            stats.total_chunks += session.chunk_count();
        }
        stats
    }

    pub fn defaults(&self) -> &SessionConfig {
        &self.defaults
    }
}
