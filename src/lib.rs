//! In-memory, session-scoped RAG engine with streaming ingestion and query
//! pipelines.
//!
//! The [`RagEngine`] facade owns the cross-session state (session manager,
//! embedding client, model provider) and exposes the two public streaming
//! operations: [`RagEngine::ingest_stream`] relays ingestion progress and
//! [`RagEngine::query_stream`] emits retrieval, generation, citation and
//! metrics events in a fixed order. The HTTP layer in [`server`] bridges
//! both onto server-sent events.

pub mod cache;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod provider;
pub mod retrieval;
pub mod server;
pub mod session;
pub mod simd;
pub mod vector_store;

pub use cache::CacheStats;
pub use config::{Config, SessionConfig, SessionConfigPatch};
pub use document::{Chunk, ChunkingStrategy, Document};
pub use embedding::EmbeddingClient;
pub use error::{Error, Result};
pub use metrics::{MeteredAllocator, QueryMetrics};
pub use pipeline::{IngestPhase, IngestProgressUpdate, IngestRequest, IngestionPipeline};
pub use provider::{GenerationChunk, GenerationOptions, HttpProvider, ModelProvider, TokenUsage};
pub use retrieval::{RetrievalStrategy, Retriever};
pub use session::{GlobalStats, Session, SessionManager};
pub use vector_store::{EmbeddedChunk, IndexStats, RetrievalResult, VectorIndex};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CHUNK_PREVIEW_MAX_CHARS: usize = 200;
const EMPTY_SESSION_MESSAGE: &str =
    "No documents in session. Please upload documents first.";
const NO_RESULTS_MESSAGE: &str =
    "No relevant information found in the uploaded documents for this query.";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub strategy: Option<RetrievalStrategy>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub document_name: String,
    pub chunk_preview: String,
    pub relevance_score: f32,
    pub chunk_index: usize,
}

impl Citation {
    fn from_result(result: &RetrievalResult) -> Self {
        Self {
            document_name: result.chunk.document_name.clone(),
            chunk_preview: chunk_preview(&result.chunk.content),
            relevance_score: result.similarity_score,
            chunk_index: result.chunk.chunk_index,
        }
    }
}

/// First 200 characters of a chunk, with an ellipsis when truncated.
fn chunk_preview(content: &str) -> String {
    let mut preview: String = content.chars().take(CHUNK_PREVIEW_MAX_CHARS).collect();
    if content.chars().count() > CHUNK_PREVIEW_MAX_CHARS {
        preview.push_str("...");
    }
    preview
}

/// One event on a query stream, in wire order: an optional `retrieval`,
/// zero or more `generation` fragments, one `citation` per retrieved chunk,
/// then exactly one `done`, or a single terminal `error`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueryEvent {
    #[serde(rename_all = "camelCase")]
    Retrieval {
        retrieved_chunks: Vec<RetrievalResult>,
        content: String,
    },
    Generation {
        content: String,
    },
    Citation {
        citation: Citation,
    },
    Done {
        metrics: QueryMetrics,
    },
    Error {
        content: String,
    },
}

/// Public façade over the session, ingestion, and retrieval machinery.
#[derive(Clone)]
pub struct RagEngine {
    config: Arc<Config>,
    sessions: Arc<SessionManager>,
    embedding: Arc<EmbeddingClient>,
    provider: Arc<dyn ModelProvider>,
    retriever: Arc<Retriever>,
    pipeline: Arc<IngestionPipeline>,
}

impl RagEngine {
    pub fn new(config: Config, provider: Arc<dyn ModelProvider>) -> Self {
        let config = Arc::new(config);
        let embedding = Arc::new(EmbeddingClient::new(
            provider.clone(),
            config.embedding.clone(),
        ));
        let sessions = SessionManager::new(config.session.clone(), config.server.sweep_interval);
        let retriever = Arc::new(Retriever::new(embedding.clone(), provider.clone()));
        let pipeline = Arc::new(IngestionPipeline::new(embedding.clone()));
        Self {
            config,
            sessions,
            embedding,
            provider,
            retriever,
            pipeline,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn embedding(&self) -> &Arc<EmbeddingClient> {
        &self.embedding
    }

    /// Spawn the session sweeper. Call once after construction.
    pub fn start_background_tasks(&self) {
        self.sessions.start_sweeper();
    }

    pub fn shutdown(&self) {
        self.sessions.shutdown();
    }

    /// Ingest one document into a session, streaming progress updates.
    /// Cancelling stops the pipeline; already-indexed chunks remain.
    pub fn ingest_stream(
        &self,
        session: Arc<Session>,
        request: IngestRequest,
        cancel: CancellationToken,
    ) -> ReceiverStream<IngestProgressUpdate> {
        let (tx, rx) = mpsc::channel(32);
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            pipeline.run(session, request, tx, cancel).await;
        });
        ReceiverStream::new(rx)
    }

    /// Answer a query against a session's index, streaming events in the
    /// fixed order documented on [`QueryEvent`].
    pub fn query_stream(
        &self,
        session: Arc<Session>,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> ReceiverStream<QueryEvent> {
        let (tx, rx) = mpsc::channel(32);
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_query(session, request, tx, cancel).await;
        });
        ReceiverStream::new(rx)
    }

    async fn run_query(
        &self,
        session: Arc<Session>,
        request: QueryRequest,
        tx: mpsc::Sender<QueryEvent>,
        cancel: CancellationToken,
    ) {
        let total_started = Instant::now();
        let (hits_before, misses_before) = self.embedding.cache_counters();
        session.touch();

        if session.chunk_count() == 0 {
            let _ = tx
                .send(QueryEvent::Error {
                    content: EMPTY_SESSION_MESSAGE.to_string(),
                })
                .await;
            return;
        }

        let strategy = request.strategy.unwrap_or(session.config.default_strategy);
        let top_k = request.top_k.unwrap_or(session.config.top_k);

        let retrieval_started = Instant::now();
        let retrieved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = self
                .retriever
                .retrieve(&session, &request.query, top_k, strategy) => result,
        };
        let retrieval_time_ms = retrieval_started.elapsed().as_millis() as u64;

        let results = match retrieved {
            Ok(results) => results,
            Err(e) => {
                let _ = tx
                    .send(QueryEvent::Error {
                        content: format!("Retrieval failed: {}", e),
                    })
                    .await;
                return;
            }
        };

        debug!(session_id = %session.session_id, strategy = %strategy,
            retrieved = results.len(), retrieval_time_ms, "retrieval complete");

        if tx
            .send(QueryEvent::Retrieval {
                content: format!(
                    "Retrieved {} chunks using {} strategy",
                    results.len(),
                    strategy
                ),
                retrieved_chunks: results.clone(),
            })
            .await
            .is_err()
        {
            return;
        }

        let mut total_tokens = 0u64;
        let mut generation_time_ms = 0u64;

        if results.is_empty() {
            if tx
                .send(QueryEvent::Generation {
                    content: NO_RESULTS_MESSAGE.to_string(),
                })
                .await
                .is_err()
            {
                return;
            }
        } else {
            let prompt = build_prompt(&request.query, &results);
            let options = GenerationOptions {
                max_output_tokens: self.config.server.generation_max_output_tokens,
                temperature: self.config.server.generation_temperature,
            };

            let generation_started = Instant::now();
            let stream = self
                .provider
                .generate_stream(&prompt, &options, cancel.clone())
                .await;
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx
                        .send(QueryEvent::Error {
                            content: format!("Generation failed: {}", e),
                        })
                        .await;
                    return;
                }
            };

            use futures::StreamExt;
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    item = stream.next() => item,
                };
                match item {
                    None => break,
                    Some(Ok(GenerationChunk::Text(fragment))) => {
                        if tx
                            .send(QueryEvent::Generation { content: fragment })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Ok(GenerationChunk::Usage(usage))) => {
                        total_tokens = usage.total_tokens;
                    }
                    Some(Err(e)) => {
                        let _ = tx
                            .send(QueryEvent::Error {
                                content: format!("Generation failed: {}", e),
                            })
                            .await;
                        return;
                    }
                }
            }
            generation_time_ms = generation_started.elapsed().as_millis() as u64;

            for result in &results {
                if tx
                    .send(QueryEvent::Citation {
                        citation: Citation::from_result(result),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }

        let (hits_after, misses_after) = self.embedding.cache_counters();
        let memory_used_bytes = match metrics::live_memory_bytes() {
            0 => session.vector_index.estimate_memory_usage() as u64,
            live => live,
        };
        let query_metrics = QueryMetrics {
            chunking_time_ms: 0,
            embedding_time_ms: 0,
            retrieval_time_ms,
            generation_time_ms,
            total_time_ms: total_started.elapsed().as_millis() as u64,
            total_chunks: session.chunk_count() as u64,
            chunks_retrieved: results.len() as u64,
            embedding_cache_hits: hits_after.saturating_sub(hits_before),
            embedding_cache_misses: misses_after.saturating_sub(misses_before),
            total_tokens_used: total_tokens,
            memory_used_bytes,
        };
        session.metrics.record_query(&query_metrics);

        let _ = tx
            .send(QueryEvent::Done {
                metrics: query_metrics,
            })
            .await;
    }
}

/// Assemble the grounded generation prompt: preamble, one source block per
/// retrieved chunk, then the question.
fn build_prompt(query: &str, results: &[RetrievalResult]) -> String {
    let mut prompt = String::from(
        "You are a helpful assistant. Answer the question using only the \
         provided context. If the context does not contain the answer, say so.\n\n\
         Context:\n",
    );
    for result in results {
        prompt.push_str(&format!(
            "[Source: {}, Relevance: {:.1}%]\n{}\n\n",
            result.chunk.document_name,
            result.similarity_score * 100.0,
            result.chunk.content
        ));
    }
    prompt.push_str(&format!("Question: {}\nAnswer:", query));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Chunk;

    fn result(doc: &str, content: &str, score: f32, rank: usize) -> RetrievalResult {
        RetrievalResult {
            chunk: Chunk {
                id: format!("d_chunk_{}", rank),
                document_id: "d".into(),
                document_name: doc.into(),
                content: content.into(),
                start_index: 0,
                end_index: content.chars().count(),
                chunk_index: rank - 1,
            },
            similarity_score: score,
            rank,
        }
    }

    #[test]
    fn preview_truncates_at_200_chars() {
        let short = chunk_preview("short text");
        assert_eq!(short, "short text");

        let long_src = "y".repeat(250);
        let long = chunk_preview(&long_src);
        assert_eq!(long.chars().count(), 203);
        assert!(long.ends_with("..."));
    }

    #[test]
    fn prompt_contains_source_blocks_and_question() {
        let results = vec![
            result("a.txt", "alpha content", 0.91, 1),
            result("b.txt", "beta content", 0.42, 2),
        ];
        let prompt = build_prompt("what is alpha?", &results);
        assert!(prompt.contains("[Source: a.txt, Relevance: 91.0%]"));
        assert!(prompt.contains("[Source: b.txt, Relevance: 42.0%]"));
        assert!(prompt.contains("alpha content"));
        assert!(prompt.ends_with("Question: what is alpha?\nAnswer:"));
    }

    #[test]
    fn query_events_serialize_with_type_tags() {
        let event = QueryEvent::Generation {
            content: "hello".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "generation");
        assert_eq!(json["content"], "hello");

        let event = QueryEvent::Retrieval {
            retrieved_chunks: vec![result("a.txt", "x", 0.9, 1)],
            content: "Retrieved 1 chunks using Direct strategy".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "retrieval");
        assert!(json["retrievedChunks"].is_array());
        assert_eq!(json["retrievedChunks"][0]["similarityScore"], 0.9f32);

        let event = QueryEvent::Done {
            metrics: QueryMetrics::default(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "done");
        assert!(json["metrics"]["totalTimeMs"].is_number());
    }

    #[test]
    fn citation_shape() {
        let citation = Citation::from_result(&result("doc.txt", &"z".repeat(300), 0.77, 1));
        assert_eq!(citation.document_name, "doc.txt");
        assert!(citation.chunk_preview.ends_with("..."));
        assert_eq!(citation.chunk_index, 0);
        let json = serde_json::to_value(&citation).unwrap();
        assert!(json.get("chunkPreview").is_some());
        assert!(json.get("relevanceScore").is_some());
    }
}
