//! End-to-end engine scenarios against a stub provider.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use common::{StubProvider, STUB_ANSWER_FRAGMENTS, STUB_TOTAL_TOKENS};
use rag_session_engine::{
    Config, IngestPhase, IngestProgressUpdate, IngestRequest, QueryEvent, QueryRequest, RagEngine,
    RetrievalStrategy, SessionConfig,
};

fn engine() -> (RagEngine, Arc<StubProvider>) {
    let stub = Arc::new(StubProvider::new(8));
    (RagEngine::new(Config::default(), stub.clone()), stub)
}

async fn run_ingest(
    engine: &RagEngine,
    session: &Arc<rag_session_engine::Session>,
    file_name: &str,
    content: &str,
) -> Vec<IngestProgressUpdate> {
    engine
        .ingest_stream(
            session.clone(),
            IngestRequest {
                file_name: file_name.to_string(),
                content: content.to_string(),
                chunking_strategy: None,
            },
            CancellationToken::new(),
        )
        .collect()
        .await
}

async fn run_query(
    engine: &RagEngine,
    session: &Arc<rag_session_engine::Session>,
    query: &str,
    strategy: Option<RetrievalStrategy>,
) -> Vec<QueryEvent> {
    engine
        .query_stream(
            session.clone(),
            QueryRequest {
                query: query.to_string(),
                strategy,
                top_k: None,
            },
            CancellationToken::new(),
        )
        .collect()
        .await
}

/// Phase sequence with consecutive repeats collapsed.
fn phase_outline(updates: &[IngestProgressUpdate]) -> Vec<IngestPhase> {
    let mut outline: Vec<IngestPhase> = Vec::new();
    for update in updates {
        if outline.last() != Some(&update.phase) {
            outline.push(update.phase);
        }
    }
    outline
}

#[tokio::test]
async fn ingest_lifecycle_happy_path() {
    let (engine, _stub) = engine();
    let session = engine.sessions().create(Some(SessionConfig {
        chunk_size: 10,
        chunk_overlap: 5,
        ..SessionConfig::default()
    }));

    let updates = run_ingest(&engine, &session, "a.txt", "AAAA_BBBB_CCCC_DDDD_EEEE").await;
    assert_eq!(
        phase_outline(&updates),
        vec![
            IngestPhase::Starting,
            IngestPhase::Chunking,
            IngestPhase::Embedding,
            IngestPhase::Indexing,
            IngestPhase::Complete,
        ]
    );
    assert_eq!(updates.last().unwrap().percent_complete, 100.0);

    assert_eq!(session.document_count(), 1);
    assert!(session.chunk_count() >= 4, "got {}", session.chunk_count());
}

#[tokio::test]
async fn third_document_hits_the_cap() {
    let (engine, _stub) = engine();
    let session = engine.sessions().create(None); // max_documents = 2

    for (name, text) in [("one.txt", "first document body."), ("two.txt", "second document body.")] {
        let updates = run_ingest(&engine, &session, name, text).await;
        assert_eq!(updates.last().unwrap().phase, IngestPhase::Complete);
    }

    let updates = run_ingest(&engine, &session, "three.txt", "third document body.").await;
    let last = updates.last().unwrap();
    assert_eq!(last.phase, IngestPhase::Error);
    assert!(last.message.contains("document limit reached"));
    assert_eq!(session.document_count(), 2);
}

#[tokio::test]
async fn oversized_file_is_rejected_with_sizes() {
    let (engine, _stub) = engine();
    let session = engine.sessions().create(None);

    let updates = run_ingest(&engine, &session, "big.txt", &"x".repeat(150 * 1024)).await;
    let last = updates.last().unwrap();
    assert_eq!(last.phase, IngestPhase::Error);
    assert!(last.message.contains("File too large (150KB)"));
    assert!(last.message.contains("Maximum: 100KB"));
    assert_eq!(session.document_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn expired_session_disappears() {
    let (engine, _stub) = engine();
    let session = engine.sessions().create(Some(SessionConfig {
        session_ttl: Duration::from_secs(5),
        ..SessionConfig::default()
    }));
    let id = session.session_id.clone();
    assert_eq!(engine.sessions().global_stats().active_sessions, 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(engine.sessions().get(&id).is_none());
    assert_eq!(engine.sessions().global_stats().active_sessions, 0);
}

#[tokio::test]
async fn query_with_empty_index_errors_immediately() {
    let (engine, _stub) = engine();
    let session = engine.sessions().create(None);

    let events = run_query(&engine, &session, "anything at all", None).await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        QueryEvent::Error { content } => {
            assert!(content.contains("No documents in session"));
        }
        other => panic!("expected error event, got {:?}", other),
    }
}

// HyDE falls back to direct retrieval when hypothesis generation fails.
#[tokio::test]
async fn hyde_fallback_matches_direct() {
    let (engine, stub) = engine();
    let session = engine.sessions().create(None);

    let content = "The mitochondria is the powerhouse of the cell.";
    let query = "what is the powerhouse of the cell?";
    let shared = vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    stub.map(content, shared.clone());
    stub.map(query, shared);

    let updates = run_ingest(&engine, &session, "bio.txt", content).await;
    assert_eq!(updates.last().unwrap().phase, IngestPhase::Complete);

    stub.fail_hypothesis.store(true, Ordering::SeqCst);

    let direct = run_query(&engine, &session, query, Some(RetrievalStrategy::Direct)).await;
    let hyde = run_query(
        &engine,
        &session,
        query,
        Some(RetrievalStrategy::HypotheticalDocument),
    )
    .await;

    let retrieved_ids = |events: &[QueryEvent]| -> Vec<String> {
        events
            .iter()
            .find_map(|e| match e {
                QueryEvent::Retrieval {
                    retrieved_chunks, ..
                } => Some(
                    retrieved_chunks
                        .iter()
                        .map(|r| r.chunk.id.clone())
                        .collect(),
                ),
                _ => None,
            })
            .unwrap_or_default()
    };

    assert!(!retrieved_ids(&hyde).is_empty(), "HyDE stream retrieved chunks");
    assert_eq!(retrieved_ids(&hyde), retrieved_ids(&direct));
    assert!(matches!(hyde.last(), Some(QueryEvent::Done { .. })));
    assert!(hyde
        .iter()
        .any(|e| matches!(e, QueryEvent::Generation { .. })));
    assert!(hyde.iter().any(|e| matches!(e, QueryEvent::Citation { .. })));
}

#[tokio::test]
async fn cancel_mid_ingest_keeps_session_usable() {
    let stub = Arc::new(StubProvider::new(8).with_embed_delay(Duration::from_millis(15)));
    let engine = RagEngine::new(Config::default(), stub.clone());
    let session = engine.sessions().create(None);

    let content = "The quick brown fox jumps over the lazy dog. ".repeat(1100); // ~49 KiB
    let cancel = CancellationToken::new();
    let mut stream = engine.ingest_stream(
        session.clone(),
        IngestRequest {
            file_name: "big.txt".to_string(),
            content,
            chunking_strategy: None,
        },
        cancel.clone(),
    );

    let first = stream.next().await.expect("first progress update");
    assert_eq!(first.phase, IngestPhase::Starting);
    cancel.cancel();

    let rest: Vec<IngestProgressUpdate> = stream.collect().await;
    let last = rest.last().expect("terminal update after cancellation");
    assert_eq!(last.phase, IngestPhase::Error);
    assert!(last.message.contains("cancelled"));

    // The session survives with whatever prefix was indexed.
    assert!(engine.sessions().get(&session.session_id).is_some());
    let events = run_query(&engine, &session, "still alive?", None).await;
    assert!(!events.is_empty());
    assert!(matches!(
        events.last(),
        Some(QueryEvent::Done { .. }) | Some(QueryEvent::Error { .. })
    ));
}

// A successful query stream keeps the fixed event order.
#[tokio::test]
async fn query_stream_event_order_is_fixed() {
    let (engine, stub) = engine();
    let session = engine.sessions().create(None);

    let content = "Rust ownership prevents data races at compile time.";
    let query = "how does rust prevent data races?";
    let shared = vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    stub.map(content, shared.clone());
    stub.map(query, shared);

    run_ingest(&engine, &session, "rust.txt", content).await;
    let events = run_query(&engine, &session, query, None).await;

    // Shape: retrieval, generation+, citation+, done.
    assert!(matches!(events.first(), Some(QueryEvent::Retrieval { .. })));
    assert!(matches!(events.last(), Some(QueryEvent::Done { .. })));

    let kinds: Vec<u8> = events
        .iter()
        .map(|e| match e {
            QueryEvent::Retrieval { .. } => 0,
            QueryEvent::Generation { .. } => 1,
            QueryEvent::Citation { .. } => 2,
            QueryEvent::Done { .. } => 3,
            QueryEvent::Error { .. } => 4,
        })
        .collect();
    assert!(
        kinds.windows(2).all(|w| w[0] <= w[1]),
        "events out of order: {:?}",
        kinds
    );
    assert!(!kinds.contains(&4));

    let generated: String = events
        .iter()
        .filter_map(|e| match e {
            QueryEvent::Generation { content } => Some(content.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(generated, STUB_ANSWER_FRAGMENTS.concat());

    let citations = kinds.iter().filter(|k| **k == 2).count();
    match events.last().unwrap() {
        QueryEvent::Done { metrics } => {
            assert_eq!(metrics.chunks_retrieved as usize, citations);
            assert_eq!(metrics.total_tokens_used, STUB_TOTAL_TOKENS);
            assert!(metrics.memory_used_bytes > 0);
        }
        _ => unreachable!(),
    }
}

// Mid-stream generation failure surfaces as a terminal error event.
#[tokio::test]
async fn generation_failure_ends_stream_with_error() {
    let (engine, stub) = engine();
    let session = engine.sessions().create(None);

    let content = "Some indexed knowledge.";
    let query = "tell me about the knowledge";
    let shared = vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    stub.map(content, shared.clone());
    stub.map(query, shared);

    run_ingest(&engine, &session, "k.txt", content).await;
    stub.fail_stream.store(true, Ordering::SeqCst);

    let events = run_query(&engine, &session, query, None).await;
    assert!(matches!(events.first(), Some(QueryEvent::Retrieval { .. })));
    match events.last() {
        Some(QueryEvent::Error { content }) => {
            assert!(content.contains("Generation failed"));
        }
        other => panic!("expected terminal error, got {:?}", other),
    }
    assert!(!events.iter().any(|e| matches!(e, QueryEvent::Done { .. })));

    // The session remains usable afterwards.
    stub.fail_stream.store(false, Ordering::SeqCst);
    let events = run_query(&engine, &session, query, None).await;
    assert!(matches!(events.last(), Some(QueryEvent::Done { .. })));
}

// The embedding cache is process-wide: a second session ingesting the same
// text never re-contacts the provider.
#[tokio::test]
async fn embedding_cache_is_shared_across_sessions() {
    let (engine, stub) = engine();

    let content = "Identical document body shared by two sessions.";
    let first = engine.sessions().create(None);
    run_ingest(&engine, &first, "a.txt", content).await;
    let calls_after_first = stub.embed_calls.load(Ordering::SeqCst);

    let second = engine.sessions().create(None);
    let updates = run_ingest(&engine, &second, "a.txt", content).await;
    assert_eq!(updates.last().unwrap().phase, IngestPhase::Complete);
    assert_eq!(
        stub.embed_calls.load(Ordering::SeqCst),
        calls_after_first,
        "second ingest should be served from cache"
    );
    assert_eq!(second.chunk_count(), first.chunk_count());

    let (hits, _misses) = engine.embedding().cache_counters();
    assert!(hits >= 1);
}

// Query expansion completes end-to-end and keeps the event contract.
#[tokio::test]
async fn query_expansion_stream_completes() {
    let (engine, stub) = engine();
    let session = engine.sessions().create(Some(SessionConfig {
        min_similarity_score: 0.0,
        ..SessionConfig::default()
    }));

    let content = "Concurrency in Rust uses async tasks and channels.";
    let query = "rust concurrency";
    let shared = vec![0.5, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.5];
    stub.map(content, shared.clone());
    stub.map(query, shared);

    run_ingest(&engine, &session, "c.txt", content).await;
    let events = run_query(
        &engine,
        &session,
        query,
        Some(RetrievalStrategy::QueryExpansion),
    )
    .await;

    assert!(matches!(events.first(), Some(QueryEvent::Retrieval { .. })));
    assert!(matches!(events.last(), Some(QueryEvent::Done { .. })));
    match events.first().unwrap() {
        QueryEvent::Retrieval { content, .. } => {
            assert!(content.contains("QueryExpansion strategy"));
        }
        _ => unreachable!(),
    }
}
