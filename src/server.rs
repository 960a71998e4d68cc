//! Session-scoped HTTP surface with SSE streaming.
//!
//! All routes live under `/api/rag`. Ingestion and query responses are
//! server-sent event streams framed as `data: <json>\n\n` records with a
//! terminal `data: [DONE]\n\n`; a client disconnect drops the stream, which
//! cancels the underlying work through a [`CancellationToken`] drop guard.
//!
//! Validation failures surface before any stream begins (HTTP 400/404);
//! mid-stream failures arrive as terminal error events inside the stream.
//! Authentication belongs to the outer host; this router carries none and
//! can be mounted behind any tower auth layer.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::cache::CacheStats;
use crate::config::SessionConfigPatch;
use crate::pipeline::IngestRequest;
use crate::session::Session;
use crate::vector_store::IndexStats;
use crate::{QueryRequest, RagEngine};

#[derive(Clone)]
pub struct AppState {
    engine: RagEngine,
}

/// Timeout for the request/response routes. The SSE routes are exempt:
/// an ingest or query stream legitimately outlives any fixed deadline and
/// is bounded instead by client disconnect and provider timeouts.
const CONTROL_ROUTE_TIMEOUT: Duration = Duration::from_secs(30);

pub fn router(engine: RagEngine) -> Router {
    let control = Router::new()
        .route("/api/rag/session", post(create_session))
        .route("/api/rag/stats", get(session_stats))
        .route("/api/rag/global-stats", get(global_stats))
        .route("/api/rag/session/:session_id", delete(delete_session))
        .route("/api/rag/health", get(health))
        .layer(TimeoutLayer::new(CONTROL_ROUTE_TIMEOUT));
    let streaming = Router::new()
        .route("/api/rag/ingest", post(ingest))
        .route("/api/rag/query", post(query));

    control
        .merge(streaming)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(AppState { engine })
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn not_found(session_id: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        crate::Error::SessionNotFound(session_id.to_string()).to_string(),
    )
}

/// Frame a finite event stream as SSE: one `data:` record per item, then a
/// terminal `data: [DONE]`. The drop guard cancels the producing pipeline
/// when the client goes away.
fn sse_response<S, T>(events: S, guard: DropGuard) -> Response
where
    S: Stream<Item = T> + Send + 'static,
    T: Serialize,
{
    let data = events.map(|item| {
        let payload = serde_json::to_string(&item).unwrap_or_else(|_| "{}".to_string());
        Ok::<Event, Infallible>(Event::default().data(payload))
    });
    let done = stream::once(async { Ok::<Event, Infallible>(Event::default().data("[DONE]")) });
    let framed = data.chain(done).inspect(move |_| {
        let _held = &guard;
    });
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(framed),
    )
        .into_response()
}

// ---- session creation ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    #[serde(default)]
    config: Option<SessionConfigPatch>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: String,
    expires_at: DateTime<Utc>,
    max_documents: usize,
    max_file_size_bytes: usize,
}

async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionBody>>,
) -> Response {
    let patch = body.and_then(|Json(b)| b.config);
    let config = patch.map(|p| state.engine.sessions().defaults().apply_patch(&p));
    let session = state.engine.sessions().create(config);
    (
        StatusCode::OK,
        Json(CreateSessionResponse {
            session_id: session.session_id.clone(),
            expires_at: session.expires_at(),
            max_documents: session.config.max_documents,
            max_file_size_bytes: session.config.max_file_size_bytes,
        }),
    )
        .into_response()
}

// ---- ingestion ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestBody {
    session_id: String,
    #[serde(flatten)]
    request: IngestRequest,
}

async fn ingest(State(state): State<AppState>, Json(body): Json<IngestBody>) -> Response {
    if body.request.file_name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "file name must not be empty");
    }
    if body.request.content.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "content must not be empty");
    }
    let Some(session) = state.engine.sessions().get(&body.session_id) else {
        return not_found(&body.session_id);
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let updates = state.engine.ingest_stream(session, body.request, cancel);
    sse_response(updates, guard)
}

// ---- query ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody {
    session_id: String,
    #[serde(flatten)]
    request: QueryRequest,
}

async fn query(State(state): State<AppState>, Json(body): Json<QueryBody>) -> Response {
    if body.request.query.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "query must not be empty");
    }
    let Some(session) = state.engine.sessions().get(&body.session_id) else {
        return not_found(&body.session_id);
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let events = state.engine.query_stream(session, body.request, cancel);
    sse_response(events, guard)
}

// ---- stats ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsParams {
    #[serde(alias = "session_id")]
    session_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentStats {
    file_name: String,
    char_count: usize,
    chunk_count: usize,
    uploaded_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatsResponse {
    session_id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    document_count: usize,
    chunk_count: usize,
    documents: Vec<DocumentStats>,
    metrics: crate::QueryMetrics,
    index: IndexStats,
}

fn session_stats_payload(session: &Arc<Session>) -> SessionStatsResponse {
    let documents = session
        .documents()
        .into_iter()
        .map(|d| DocumentStats {
            chunk_count: session.vector_index.chunk_count_for_document(&d.id),
            file_name: d.file_name,
            char_count: d.char_count,
            uploaded_at: d.uploaded_at,
        })
        .collect();
    SessionStatsResponse {
        session_id: session.session_id.clone(),
        created_at: session.created_at,
        expires_at: session.expires_at(),
        document_count: session.document_count(),
        chunk_count: session.chunk_count(),
        documents,
        metrics: session.metrics.snapshot(),
        index: session.vector_index.stats(),
    }
}

async fn session_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Response {
    let Some(session) = state.engine.sessions().get(&params.session_id) else {
        return not_found(&params.session_id);
    };
    (StatusCode::OK, Json(session_stats_payload(&session))).into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GlobalStatsResponse {
    active_sessions: usize,
    total_documents: usize,
    total_chunks: usize,
    embedding_cache: CacheStats,
}

async fn global_stats(State(state): State<AppState>) -> Response {
    let stats = state.engine.sessions().global_stats();
    (
        StatusCode::OK,
        Json(GlobalStatsResponse {
            active_sessions: stats.active_sessions,
            total_documents: stats.total_documents,
            total_chunks: stats.total_chunks,
            embedding_cache: state.engine.embedding().cache_stats(),
        }),
    )
        .into_response()
}

// ---- deletion & health ----

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    if state.engine.sessions().remove(&session_id) {
        (
            StatusCode::OK,
            Json(serde_json::json!({ "deleted": true })),
        )
            .into_response()
    } else {
        not_found(&session_id)
    }
}

async fn health() -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": Utc::now(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::Result;
    use crate::provider::{GenerationChunk, GenerationOptions, ModelProvider};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use futures::stream::BoxStream;
    use futures::StreamExt as _;
    use tower::ServiceExt;

    struct WireProvider;

    #[async_trait]
    impl ModelProvider for WireProvider {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.1f32; 8];
            for (i, b) in text.bytes().enumerate() {
                v[i % 8] += b as f32 / 100.0;
            }
            Ok(v)
        }

        async fn generate(&self, _: &str, _: &GenerationOptions) -> Result<String> {
            Ok("answer".into())
        }

        async fn generate_stream(
            &self,
            _: &str,
            _: &GenerationOptions,
            _: CancellationToken,
        ) -> Result<BoxStream<'static, Result<GenerationChunk>>> {
            Ok(
                futures::stream::iter(vec![Ok(GenerationChunk::Text("answer".into()))])
                    .boxed(),
            )
        }

        fn dimension(&self) -> usize {
            8
        }

        fn model_name(&self) -> &str {
            "wire"
        }
    }

    fn app() -> Router {
        router(RagEngine::new(Config::default(), Arc::new(WireProvider)))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/api/rag/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("\"status\":\"ok\""));
    }

    #[tokio::test]
    async fn create_session_returns_limits() {
        let response = app()
            .oneshot(post_json("/api/rag/session", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(value["sessionId"].as_str().unwrap().starts_with("rag_"));
        assert_eq!(value["maxDocuments"], 2);
        assert_eq!(value["maxFileSizeBytes"], 102_400);
    }

    #[tokio::test]
    async fn ingest_rejects_empty_inputs() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/rag/ingest",
                serde_json::json!({"sessionId": "rag_x", "fileName": "", "content": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_json(
                "/api/rag/ingest",
                serde_json::json!({"sessionId": "rag_x", "fileName": "a.txt", "content": ""}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let response = app()
            .oneshot(post_json(
                "/api/rag/query",
                serde_json::json!({"sessionId": "rag_missing", "query": "hello"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_query_is_400() {
        let response = app()
            .oneshot(post_json(
                "/api/rag/query",
                serde_json::json!({"sessionId": "rag_missing", "query": "   "}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_session_roundtrip() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_json("/api/rag/session", serde_json::json!({})))
            .await
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        let session_id = value["sessionId"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/rag/session/{}", session_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/rag/session/{}", session_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ingest_stream_is_sse_framed_with_done_marker() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_json("/api/rag/session", serde_json::json!({})))
            .await
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        let session_id = value["sessionId"].as_str().unwrap().to_string();

        let response = app
            .oneshot(post_json(
                "/api/rag/ingest",
                serde_json::json!({
                    "sessionId": session_id,
                    "fileName": "a.txt",
                    "content": "Hello ingest world. This is a small document.",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );
        let body = body_string(response).await;
        assert!(body.contains("data: {"));
        assert!(body.contains("\"phase\":\"Starting\""));
        assert!(body.contains("\"phase\":\"Complete\""));
        assert!(body.trim_end().ends_with("data: [DONE]"));
    }
}
