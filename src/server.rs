//! HTTP surface for the chat assistant and operators.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/retrieve` | Ranked chunks for a retrieval request |
//! | `GET`  | `/status` | Indexing status (`?transcript_id=` to scope) |
//! | `POST` | `/requeue` | Move failed work back to `pending` |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "invalid query: transcript_ids must not be empty" } }
//! ```
//!
//! `bad_request` (400) for caller contract violations, `internal` (500)
//! for everything else. An empty result set is `200` with `"results": []`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use transcript_retrieval_core::error::RetrievalError;
use transcript_retrieval_core::retrieve::ScoredChunk;
use transcript_retrieval_core::store::{RequeueCounts, StatusReport, Store};

use crate::config::Config;
use crate::db;
use crate::search::{build_service, SearchRequest, SearchService};
use crate::sqlite_store::SqliteStore;
use crate::stats;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub search: Arc<SearchService>,
    pub store: Arc<dyn Store>,
}

/// Build the router over the given state.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/retrieve", post(handle_retrieve))
        .route("/status", get(handle_status))
        .route("/requeue", post(handle_requeue))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool));
    let search = build_service(config, store.clone())?;
    let state = AppState {
        search: Arc::new(search),
        store,
    };

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "retrieval server listening");
    println!("Retrieval server listening on http://{}", bind_addr);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<RetrievalError> for AppError {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::InvalidQuery(msg) => bad_request(format!("invalid query: {}", msg)),
            RetrievalError::Store(e) => {
                tracing::error!(error = %format!("{:#}", e), "retrieval failed");
                internal(format!("{:#}", e))
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{:#}", err), "request failed");
        internal(format!("{:#}", err))
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /retrieve ============

#[derive(Serialize)]
struct RetrieveResponse {
    results: Vec<ScoredChunk>,
}

async fn handle_retrieve(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<RetrieveResponse>, AppError> {
    let results = state.search.search(&request).await?;
    Ok(Json(RetrieveResponse { results }))
}

// ============ GET /status ============

#[derive(Debug, Default, Deserialize)]
struct StatusParams {
    transcript_id: Option<String>,
}

async fn handle_status(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> Result<Json<StatusReport>, AppError> {
    let report = stats::status_report(state.store.as_ref(), params.transcript_id.as_deref()).await?;
    Ok(Json(report))
}

// ============ POST /requeue ============

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RequeueRequest {
    transcript_id: Option<String>,
}

async fn handle_requeue(
    State(state): State<AppState>,
    Json(request): Json<RequeueRequest>,
) -> Result<Json<RequeueCounts>, AppError> {
    let counts =
        stats::requeue_failed(state.store.as_ref(), request.transcript_id.as_deref()).await?;
    Ok(Json(counts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use transcript_retrieval_core::retrieve::{RetrievalConfig, Retriever};
    use transcript_retrieval_core::store::memory::InMemoryStore;

    async fn spawn_server() -> String {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let search = SearchService::new(
            Retriever::new(store.clone(), RetrievalConfig::default()),
            None,
        );
        let state = AppState {
            search: Arc::new(search),
            store,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_health() {
        let base = spawn_server().await;
        let body: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_retrieve_empty_scope_is_bad_request() {
        let base = spawn_server().await;
        let resp = reqwest::Client::new()
            .post(format!("{}/retrieve", base))
            .json(&serde_json::json!({ "query": "pricing", "transcript_ids": [] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_retrieve_unknown_transcript_is_empty() {
        let base = spawn_server().await;
        let body: serde_json::Value = reqwest::Client::new()
            .post(format!("{}/retrieve", base))
            .json(&serde_json::json!({ "query": "pricing", "transcript_ids": ["nope"] }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["results"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_status_and_requeue() {
        let base = spawn_server().await;
        let status: serde_json::Value = reqwest::get(format!("{}/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["chunks"]["failed"], 0);

        let counts: serde_json::Value = reqwest::Client::new()
            .post(format!("{}/requeue", base))
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(counts["chunks"], 0);
    }
}
