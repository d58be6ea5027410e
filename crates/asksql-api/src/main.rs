use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use clap::{Args, Parser};
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use asksql_core::executor::ExecutionFailure;
use asksql_core::models::{ConversationSummary, ConversationWithTurns, Row, Turn};
use asksql_core::store::ListConversationsOptions;
use asksql_core::warehouse::{TablePage, TableSchema};
use asksql_core::{ChatResponse, Config, Pipeline};

const DEFAULT_PAGE_LIMIT: u32 = 100;
const MAX_PAGE_LIMIT: u32 = 1000;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn try_main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config_path = cli
        .common
        .config
        .unwrap_or_else(Config::default_config_path);
    let config = Config::ensure_at(&config_path)?;

    let pipeline = Pipeline::from_config(&config).await?;
    info!(
        "Pipeline ready: provider {} ({}), {} context fragments",
        pipeline.provider().name(),
        pipeline.provider().model(),
        pipeline.index().len()
    );

    let state = AppState {
        pipeline: Arc::new(pipeline),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([127, 0, 0, 1], cli.common.port));
    info!("Starting API server on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Parser)]
#[command(author, version, about = "HTTP API server for asksql")]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, default_value = "8000")]
    port: u16,
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/chat", post(chat))
        .route("/chat/history", get(history))
        .route("/chat/history/{id}/messages", get(history_messages))
        .route("/chat/history/{id}/title", put(rename))
        .route("/conversation/{id}", get(conversation).delete(delete_conversation))
        .route("/schema", get(schema))
        .route("/tables", get(dictionary))
        .route("/metrics", get(metrics))
        .route("/database/tables", get(database_tables))
        .route("/database/tables/{name}", get(table_page))
        .route("/query/sql", post(run_sql));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/api/v1", api)
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

/// Error response rendered as `{"detail": "..."}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }
}

impl From<asksql_core::Error> for ApiError {
    fn from(err: asksql_core::Error) -> Self {
        match err {
            asksql_core::Error::NotFound(what) => Self {
                status: StatusCode::NOT_FOUND,
                detail: format!("{} not found", capitalize(&what)),
            },
            asksql_core::Error::InvalidInput(detail) => Self::bad_request(detail),
            other => {
                error!("Request failed: {other}");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    detail: other.to_string(),
                }
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("malformed conversation id '{raw}'")))
}

// =============================================================================
// Chat
// =============================================================================

#[derive(Debug, Deserialize)]
struct ChatRequest {
    question: String,
    #[serde(default)]
    conversation_id: Option<String>,
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(request) = payload?;
    let response = state
        .pipeline
        .ask(&request.question, request.conversation_id.as_deref())
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    days: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryResponse {
    sessions: Vec<ConversationSummary>,
    total: usize,
}

async fn history(
    State(state): State<AppState>,
    params: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Query(params) = params?;
    let days = params.days.unwrap_or(1);
    if !(1..=3650).contains(&days) {
        return Err(ApiError::bad_request("days must be between 1 and 3650"));
    }

    let sessions = state
        .pipeline
        .store()
        .list_conversations(ListConversationsOptions {
            since: Some(Utc::now() - Duration::days(days)),
            limit: None,
        })
        .await?;
    Ok(Json(HistoryResponse {
        total: sessions.len(),
        sessions,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
struct MessagesResponse {
    conversation_id: Uuid,
    messages: Vec<Turn>,
}

async fn history_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let id = parse_id(&id)?;
    let messages = state.pipeline.store().get_turns(id).await?;
    Ok(Json(MessagesResponse {
        conversation_id: id,
        messages,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Deserialize)]
struct TitleQuery {
    title: String,
}

async fn rename(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Result<Query<TitleQuery>, QueryRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let id = parse_id(&id)?;
    let Query(params) = params?;
    state
        .pipeline
        .store()
        .rename_conversation(id, &params.title)
        .await?;
    Ok(Json(MessageResponse {
        message: format!("Conversation {id} renamed"),
    }))
}

async fn conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationWithTurns>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(
        state.pipeline.store().get_conversation_with_turns(id).await?,
    ))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let id = parse_id(&id)?;
    state.pipeline.store().delete_conversation(id).await?;
    Ok(Json(MessageResponse {
        message: format!("Conversation {id} deleted"),
    }))
}

// =============================================================================
// Service information
// =============================================================================

#[derive(Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
    provider: String,
    model: String,
}

async fn root(State(state): State<AppState>) -> Json<RootResponse> {
    let provider = state.pipeline.provider();
    Json(RootResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        provider: provider.name().to_string(),
        model: provider.model().to_string(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    conversations: i64,
    context_fragments: usize,
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let conversations = state.pipeline.store().count_conversations().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        conversations,
        context_fragments: state.pipeline.index().len(),
    }))
}

// =============================================================================
// Warehouse pass-through
// =============================================================================

async fn schema(State(state): State<AppState>) -> Result<Json<Vec<TableSchema>>, ApiError> {
    Ok(Json(state.pipeline.warehouse().tables().await?))
}

#[derive(Serialize)]
struct DictionaryEntry {
    name: String,
    description: String,
    text: String,
}

async fn dictionary(State(state): State<AppState>) -> Json<Vec<DictionaryEntry>> {
    Json(entries(&state.pipeline.knowledge().tables))
}

async fn metrics(State(state): State<AppState>) -> Json<Vec<DictionaryEntry>> {
    Json(entries(&state.pipeline.knowledge().metrics))
}

fn entries(items: &[asksql_core::knowledge::KnowledgeEntry]) -> Vec<DictionaryEntry> {
    items
        .iter()
        .map(|entry| DictionaryEntry {
            name: entry.name.clone(),
            description: entry.description(),
            text: entry.text.clone(),
        })
        .collect()
}

#[derive(Serialize)]
struct TableListResponse {
    tables: Vec<String>,
}

async fn database_tables(
    State(state): State<AppState>,
) -> Result<Json<TableListResponse>, ApiError> {
    let tables = state.pipeline.warehouse().tables().await?;
    Ok(Json(TableListResponse {
        tables: tables.into_iter().map(|t| t.name).collect(),
    }))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn table_page(
    State(state): State<AppState>,
    Path(name): Path<String>,
    params: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<TablePage>, ApiError> {
    let Query(params) = params?;
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {MAX_PAGE_LIMIT}"
        )));
    }
    let page = state
        .pipeline
        .warehouse()
        .table_page(&name, limit, params.offset.unwrap_or(0))
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
struct SqlQuery {
    sql: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SqlResponse {
    sql: String,
    columns: Vec<String>,
    data: Vec<Row>,
    row_count: usize,
    truncated: bool,
}

async fn run_sql(
    State(state): State<AppState>,
    params: Result<Query<SqlQuery>, QueryRejection>,
) -> Result<Json<SqlResponse>, ApiError> {
    let Query(params) = params?;
    let table = state
        .pipeline
        .executor()
        .execute(&params.sql)
        .await
        .map_err(|failure| match failure {
            ExecutionFailure::Rejected(rejection) => {
                ApiError::bad_request(format!("Query rejected: {rejection}"))
            }
            ExecutionFailure::Failed(text) => ApiError::bad_request(format!("Query failed: {text}")),
        })?;

    Ok(Json(SqlResponse {
        sql: params.sql.trim().to_string(),
        columns: table.columns,
        row_count: table.rows.len(),
        data: table.rows,
        truncated: table.truncated,
    }))
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
