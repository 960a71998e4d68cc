use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::document::ChunkingStrategy;
use crate::retrieval::RetrievalStrategy;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub session: SessionConfig,
    pub embedding: EmbeddingClientConfig,
    pub provider: ProviderConfig,
    pub server: ServerConfig,
}

/// Per-session limits and defaults. Immutable once a session is created;
/// a caller may override individual fields at session creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub session_ttl: Duration,
    pub max_documents: usize,
    pub max_file_size_bytes: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub min_similarity_score: f32,
    pub default_strategy: RetrievalStrategy,
    pub default_chunking_strategy: ChunkingStrategy,
    pub max_concurrent_embeddings: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(env_parse("RAG_SESSION_TTL_SECS", 900)),
            max_documents: env_parse("RAG_MAX_DOCUMENTS", 2),
            max_file_size_bytes: env_parse("RAG_MAX_FILE_SIZE_BYTES", 102_400),
            chunk_size: env_parse("RAG_CHUNK_SIZE", 512),
            chunk_overlap: env_parse("RAG_CHUNK_OVERLAP", 50),
            top_k: env_parse("RAG_TOP_K", 5),
            min_similarity_score: env_parse("RAG_MIN_SIMILARITY_SCORE", 0.3),
            default_strategy: RetrievalStrategy::Direct,
            default_chunking_strategy: ChunkingStrategy::FixedSize,
            max_concurrent_embeddings: env_parse("RAG_MAX_CONCURRENT_EMBEDDINGS", 5),
        }
    }
}

/// Caller-supplied overrides for session creation. Unset fields fall back
/// to the process defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfigPatch {
    pub session_ttl_secs: Option<u64>,
    pub max_documents: Option<usize>,
    pub max_file_size_bytes: Option<usize>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub top_k: Option<usize>,
    pub min_similarity_score: Option<f32>,
    pub default_strategy: Option<RetrievalStrategy>,
    pub default_chunking_strategy: Option<ChunkingStrategy>,
    pub max_concurrent_embeddings: Option<usize>,
}

impl SessionConfig {
    pub fn apply_patch(&self, patch: &SessionConfigPatch) -> SessionConfig {
        let mut cfg = self.clone();
        if let Some(secs) = patch.session_ttl_secs {
            cfg.session_ttl = Duration::from_secs(secs);
        }
        if let Some(v) = patch.max_documents {
            cfg.max_documents = v;
        }
        if let Some(v) = patch.max_file_size_bytes {
            cfg.max_file_size_bytes = v;
        }
        if let Some(v) = patch.chunk_size {
            cfg.chunk_size = v;
        }
        if let Some(v) = patch.chunk_overlap {
            cfg.chunk_overlap = v;
        }
        if let Some(v) = patch.top_k {
            cfg.top_k = v;
        }
        if let Some(v) = patch.min_similarity_score {
            cfg.min_similarity_score = v;
        }
        if let Some(v) = patch.default_strategy {
            cfg.default_strategy = v;
        }
        if let Some(v) = patch.default_chunking_strategy {
            cfg.default_chunking_strategy = v;
        }
        if let Some(v) = patch.max_concurrent_embeddings {
            cfg.max_concurrent_embeddings = v;
        }
        cfg
    }
}

/// Process-wide embedding client behavior: cache, concurrency, retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingClientConfig {
    pub max_concurrent_requests: usize,
    pub max_retries: u32,
    pub cache_duration: Duration,
    pub cache_max_bytes: usize,
}

impl Default for EmbeddingClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: env_parse("RAG_EMBEDDING_MAX_CONCURRENT", 5),
            max_retries: env_parse("RAG_EMBEDDING_MAX_RETRIES", 3),
            cache_duration: Duration::from_secs(
                env_parse("RAG_EMBEDDING_CACHE_MINUTES", 30u64) * 60,
            ),
            cache_max_bytes: env_parse("RAG_EMBEDDING_CACHE_MAX_BYTES", 64 * 1024 * 1024),
        }
    }
}

/// Remote model provider endpoints and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub embedding_model: String,
    pub generation_model: String,
    pub embedding_dimension: usize,
    pub embed_timeout: Duration,
    pub generate_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("RAG_PROVIDER_BASE_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            api_key: std::env::var("RAG_PROVIDER_API_KEY").unwrap_or_default(),
            embedding_model: std::env::var("RAG_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-004".to_string()),
            generation_model: std::env::var("RAG_GENERATION_MODEL")
                .unwrap_or_else(|_| "gemini-1.5-flash".to_string()),
            embedding_dimension: env_parse("RAG_EMBEDDING_DIMENSION", 768),
            embed_timeout: Duration::from_secs(env_parse("RAG_EMBED_TIMEOUT_SECS", 30)),
            generate_timeout: Duration::from_secs(env_parse("RAG_GENERATE_TIMEOUT_SECS", 60)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub sweep_interval: Duration,
    pub generation_max_output_tokens: u32,
    pub generation_temperature: f32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("RAG_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_parse("RAG_PORT", 8080),
            sweep_interval: Duration::from_secs(env_parse("RAG_SWEEP_INTERVAL_SECS", 60)),
            generation_max_output_tokens: env_parse("RAG_GENERATION_MAX_TOKENS", 1024),
            generation_temperature: env_parse("RAG_GENERATION_TEMPERATURE", 0.7),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.provider.embedding_dimension == 0 {
            return Err(crate::error::Error::Config(
                "embedding dimension must be > 0".to_string(),
            ));
        }
        if self.session.chunk_size == 0 {
            return Err(crate::error::Error::Config(
                "chunk size must be > 0".to_string(),
            ));
        }
        if self.session.chunk_overlap >= self.session.chunk_size {
            return Err(crate::error::Error::Config(
                "chunk overlap must be smaller than chunk size".to_string(),
            ));
        }
        if self.session.max_documents == 0 {
            return Err(crate::error::Error::Config(
                "session must allow at least one document".to_string(),
            ));
        }
        Ok(())
    }
}
