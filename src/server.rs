//! HTTP API for the research pipeline.
//!
//! Exposes the research operations to the route layer / front end as a
//! JSON API. All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/research/query` | Run a research query |
//! | `POST` | `/research/chat` | Chat with conversation continuity |
//! | `GET` | `/research/conversation/{id}` | Fetch a conversation session |
//! | `DELETE` | `/research/conversation/{id}` | Delete a conversation session |
//! | `POST` | `/research/context` | Add research context to a session |
//! | `DELETE` | `/research/context` | Clear a session's research context |
//! | `POST` | `/admin/sync` | Force a collection flush |
//! | `GET` | `/admin/collections` | Per-collection statistics |
//! | `GET` | `/health` | Health check |

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::memory::ConversationMemory;
use crate::research::{ResearchAgent, ResearchRequest, Services};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    agent: Arc<ResearchAgent>,
    memory: Arc<ConversationMemory>,
}

/// Start the HTTP server over an initialized service graph.
///
/// Binds to `[server].bind` and serves until the process terminates. The
/// engine's background synchronizer is started here so collection flushes
/// run independently of request handling.
pub async fn run_server(config: &Config, services: Services) -> anyhow::Result<()> {
    let engine = Arc::clone(&services.engine);
    let _sync_task = engine.spawn_sync_task();

    let state = AppState {
        agent: Arc::clone(&services.agent),
        memory: Arc::clone(&services.memory),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/research/query", post(handle_query))
        .route("/research/chat", post(handle_chat))
        .route(
            "/research/conversation/{id}",
            get(handle_get_conversation).delete(handle_delete_conversation),
        )
        .route(
            "/research/context",
            post(handle_add_context).delete(handle_clear_context),
        )
        .route("/admin/sync", post(handle_sync))
        .route("/admin/collections", get(handle_collections))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    let bind_addr = config.server.bind.clone();
    println!("research API listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

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
    code: &'static str,
    message: String,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ============ Research ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    collections: Option<Vec<String>>,
    #[serde(default = "default_true")]
    use_web_search: bool,
    #[serde(default = "default_web_results")]
    max_web_results: usize,
    conversation_id: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_web_results() -> usize {
    5
}

#[derive(Serialize)]
struct QueryResponse {
    #[serde(flatten)]
    result: crate::models::ResearchResult,
    status: &'static str,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(AppError::bad_request("query must not be empty"));
    }

    let request = ResearchRequest {
        query: req.query,
        collections: req.collections,
        use_web_search: req.use_web_search,
        max_web_results: req.max_web_results,
        conversation_id: req.conversation_id,
    };

    let result = state
        .agent
        .query(request)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(QueryResponse {
        result,
        status: "success",
    }))
}

// ============ Chat ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    conversation_id: Option<String>,
    #[serde(default = "default_true")]
    include_context: bool,
}

#[derive(Serialize)]
struct ChatResponse {
    text: String,
    conversation_id: String,
    status: &'static str,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if req.message.trim().is_empty() {
        return Err(AppError::bad_request("message must not be empty"));
    }

    let (text, conversation_id) = state
        .agent
        .chat(&req.message, req.conversation_id, req.include_context)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(ChatResponse {
        text,
        conversation_id,
        status: "success",
    }))
}

// ============ Conversations ============

async fn handle_get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::models::ConversationSession>, AppError> {
    state
        .memory
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("conversation {} not found", id)))
}

#[derive(Serialize)]
struct AckResponse {
    conversation_id: String,
    message: &'static str,
    status: &'static str,
}

async fn handle_delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AckResponse>, AppError> {
    if !state.memory.delete(&id).await {
        return Err(AppError::not_found(format!("conversation {} not found", id)));
    }
    Ok(Json(AckResponse {
        conversation_id: id,
        message: "conversation deleted",
        status: "success",
    }))
}

// ============ Research context ============

#[derive(Deserialize)]
struct ContextRequest {
    conversation_id: String,
    context: Option<String>,
}

async fn handle_add_context(
    State(state): State<AppState>,
    Json(req): Json<ContextRequest>,
) -> Result<Json<AckResponse>, AppError> {
    let context = req
        .context
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("context must not be empty"))?;

    state.memory.add_context(&req.conversation_id, &context).await;
    Ok(Json(AckResponse {
        conversation_id: req.conversation_id,
        message: "research context added",
        status: "success",
    }))
}

async fn handle_clear_context(
    State(state): State<AppState>,
    Json(req): Json<ContextRequest>,
) -> Result<Json<AckResponse>, AppError> {
    if !state.memory.clear_context(&req.conversation_id).await {
        return Err(AppError::not_found(format!(
            "conversation {} not found",
            req.conversation_id
        )));
    }
    Ok(Json(AckResponse {
        conversation_id: req.conversation_id,
        message: "research context cleared",
        status: "success",
    }))
}

// ============ Admin ============

#[derive(Deserialize, Default)]
struct SyncRequest {
    collection: Option<String>,
}

#[derive(Serialize)]
struct SyncResponse {
    success: bool,
    collections: Vec<String>,
}

async fn handle_sync(
    State(state): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, AppError> {
    let collection = req.collection;
    let flushed = state
        .agent
        .engine()
        .sync(collection.as_deref())
        .await
        .map_err(AppError::internal)?;

    Ok(Json(SyncResponse {
        success: true,
        collections: flushed,
    }))
}

async fn handle_collections(
    State(state): State<AppState>,
) -> Json<std::collections::BTreeMap<String, crate::engine::CollectionStats>> {
    Json(state.agent.engine().stats().await)
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
