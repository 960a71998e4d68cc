//! Staged ingestion: chunk → embed → index, with bounded backpressure.
//!
//! One pipeline run processes exactly one document into exactly one
//! session. Chunks flow through a bounded channel to a pool of embedding
//! workers, whose output flows through a second bounded channel to a single
//! indexer, so memory stays bounded however large the document. Progress
//! updates go to a caller-supplied sink rather than being returned in-band.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::document::{Chunk, Chunker, ChunkingStrategy, Document};
use crate::embedding::EmbeddingClient;
use crate::error::{Error, Result};
use crate::session::Session;

/// Chunker → embedder buffer; writers await when full.
pub const CHUNK_CHANNEL_CAPACITY: usize = 50;
/// Embedder → indexer buffer.
pub const EMBEDDING_CHANNEL_CAPACITY: usize = 20;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub file_name: String,
    pub content: String,
    #[serde(default)]
    pub chunking_strategy: Option<ChunkingStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IngestPhase {
    Starting,
    Chunking,
    Embedding,
    Indexing,
    Complete,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestProgressUpdate {
    pub phase: IngestPhase,
    pub current_step: u32,
    pub total_steps: u32,
    pub message: String,
    pub percent_complete: f32,
}

impl IngestProgressUpdate {
    fn new(phase: IngestPhase, step: u32, message: impl Into<String>, percent: f32) -> Self {
        Self {
            phase,
            current_step: step,
            total_steps: 4,
            message: message.into(),
            percent_complete: percent,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(IngestPhase::Error, 0, message, 0.0)
    }
}

pub struct IngestionPipeline {
    embedding: Arc<EmbeddingClient>,
}

impl IngestionPipeline {
    pub fn new(embedding: Arc<EmbeddingClient>) -> Self {
        Self { embedding }
    }

    /// Run the full pipeline, reporting progress to `progress`. Failures
    /// and cancellation surface as a terminal `Error` update; the session
    /// keeps whatever chunks were already indexed.
    pub async fn run(
        &self,
        session: Arc<Session>,
        request: IngestRequest,
        progress: mpsc::Sender<IngestProgressUpdate>,
        cancel: CancellationToken,
    ) {
        if let Err(e) = self.run_inner(&session, request, &progress, &cancel).await {
            let message = match &e {
                Error::Cancelled => "document processing was cancelled".to_string(),
                other => other.to_string(),
            };
            warn!(session_id = %session.session_id, error = %message, "ingestion failed");
            let _ = progress.send(IngestProgressUpdate::error(message)).await;
        }
    }

    async fn run_inner(
        &self,
        session: &Arc<Session>,
        request: IngestRequest,
        progress: &mpsc::Sender<IngestProgressUpdate>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cfg = &session.config;
        let _ = progress
            .send(IngestProgressUpdate::new(
                IngestPhase::Starting,
                0,
                "Starting document processing",
                0.0,
            ))
            .await;

        // Pre-flight validation.
        if request.content.len() > cfg.max_file_size_bytes {
            return Err(Error::Validation(format!(
                "File too large ({}KB). Maximum: {}KB",
                request.content.len() / 1024,
                cfg.max_file_size_bytes / 1024
            )));
        }
        if session.document_count() >= cfg.max_documents {
            return Err(Error::Validation(format!(
                "document limit reached ({} documents). Maximum: {}",
                session.document_count(),
                cfg.max_documents
            )));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Stage 1: chunking.
        let _ = progress
            .send(IngestProgressUpdate::new(
                IngestPhase::Chunking,
                1,
                "Chunking document",
                10.0,
            ))
            .await;

        let document = Document::new(request.file_name, request.content);
        let strategy = request
            .chunking_strategy
            .unwrap_or(cfg.default_chunking_strategy);
        let chunking_started = Instant::now();
        let chunks = Chunker::new(strategy, cfg.chunk_size, cfg.chunk_overlap).chunk(&document);
        let chunking_ms = chunking_started.elapsed().as_millis() as u64;

        if chunks.is_empty() {
            return Err(Error::Validation("document produced no chunks".to_string()));
        }
        let total = chunks.len();
        debug!(session_id = %session.session_id, document_id = %document.id, total,
            strategy = ?strategy, "document chunked");

        let _ = progress
            .send(IngestProgressUpdate::new(
                IngestPhase::Embedding,
                2,
                format!("Embedding 0/{} chunks", total),
                30.0,
            ))
            .await;

        // Stages 2-3: producer feeds the chunk channel; a worker pool
        // embeds and forwards into the embedding channel.
        let (chunk_tx, chunk_rx) = mpsc::channel::<Chunk>(CHUNK_CHANNEL_CAPACITY);
        let (embedded_tx, mut embedded_rx) =
            mpsc::channel::<(Chunk, Vec<f32>)>(EMBEDDING_CHANNEL_CAPACITY);
        let chunk_rx = Arc::new(Mutex::new(chunk_rx));

        let producer_cancel = cancel.clone();
        let producer = tokio::spawn(async move {
            for chunk in chunks {
                tokio::select! {
                    _ = producer_cancel.cancelled() => return,
                    sent = chunk_tx.send(chunk) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let embed_started = Instant::now();
        let done = Arc::new(AtomicUsize::new(0));
        let workers = cfg.max_concurrent_embeddings.max(1);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = chunk_rx.clone();
            let tx = embedded_tx.clone();
            let client = self.embedding.clone();
            let cancel = cancel.clone();
            let done = done.clone();
            let progress = progress.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let chunk = { rx.lock().await.recv().await };
                    let Some(chunk) = chunk else { return };
                    match client.embed_cancellable(&chunk.content, &cancel).await {
                        Ok(embedding) => {
                            let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                            let percent = 30.0 + (finished as f32 / total as f32) * 50.0;
                            let _ = progress
                                .send(IngestProgressUpdate::new(
                                    IngestPhase::Embedding,
                                    2,
                                    format!("Embedded {}/{} chunks", finished, total),
                                    percent,
                                ))
                                .await;
                            if tx.send((chunk, embedding)).await.is_err() {
                                return;
                            }
                        }
                        Err(Error::Cancelled) => return,
                        Err(e) => {
                            warn!(chunk_id = %chunk.id, error = %e,
                                "chunk embedding failed, dropping chunk");
                        }
                    }
                }
            }));
        }
        drop(embedded_tx);

        // Stage 4: single indexer.
        let mut indexed = 0usize;
        while let Some((chunk, embedding)) = embedded_rx.recv().await {
            session.vector_index.push(chunk, embedding)?;
            indexed += 1;
        }
        for handle in handles {
            let _ = handle.await;
        }
        let _ = producer.await;
        let embedding_ms = embed_started.elapsed().as_millis() as u64;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if indexed == 0 {
            return Err(Error::Validation(
                "all chunks failed to embed; document was not ingested".to_string(),
            ));
        }

        let _ = progress
            .send(IngestProgressUpdate::new(
                IngestPhase::Indexing,
                3,
                "Indexing embedded chunks",
                90.0,
            ))
            .await;

        // Finalize: register the document, slide the TTL, fold metrics.
        let document_id = document.id.clone();
        session.add_document(document)?;
        session.touch();
        session
            .metrics
            .record_ingest(chunking_ms, embedding_ms, indexed as u64);

        debug!(session_id = %session.session_id, document_id = %document_id,
            indexed, total, "document ingested");
        let _ = progress
            .send(IngestProgressUpdate::new(
                IngestPhase::Complete,
                4,
                format!("Ingested {} of {} chunks", indexed, total),
                100.0,
            ))
            .await;
        Ok(())
    }
}
