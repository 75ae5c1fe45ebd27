//! JSON API hosting review sessions, one per open review screen.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use mrq_client::ReviewBackend;
use mrq_controller::{ControllerConfig, ControllerError, QueryChange, RefreshTrigger, ReviewSession, SessionId};
use mrq_core::{ActionKind, RecordId, SortKey};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "mrq-web";

#[derive(Clone)]
pub struct AppState {
    backend: Arc<dyn ReviewBackend>,
    config: ControllerConfig,
    sessions: Arc<RwLock<HashMap<SessionId, Arc<ReviewSession>>>>,
}

impl AppState {
    pub fn new(backend: Arc<dyn ReviewBackend>, config: ControllerConfig) -> Self {
        Self {
            backend,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn session(&self, id: SessionId) -> Result<Arc<ReviewSession>, ApiError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("session {id}")))
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn close_all(&self) {
        let sessions = self.sessions.write().await.drain().collect::<Vec<_>>();
        for (_, session) in sessions {
            session.close().await;
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unprocessable: {0}")]
    Unprocessable(String),
    #[error("backend unavailable: {0}")]
    Upstream(String),
    #[error("session closed")]
    Gone,
}

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::TransientFetch { .. } => ApiError::Upstream(err.to_string()),
            ControllerError::ActionRejected { .. } => ApiError::Conflict(err.to_string()),
            ControllerError::Resolution(_) => ApiError::Unprocessable(err.to_string()),
            ControllerError::UnknownRecord(id) => ApiError::NotFound(format!("record {id}")),
            ControllerError::SessionClosed => ApiError::Gone,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Unprocessable(_) => (StatusCode::UNPROCESSABLE_ENTITY, "UNPROCESSABLE"),
            ApiError::Upstream(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM"),
            ApiError::Gone => (StatusCode::GONE, "GONE"),
        };
        (status, Json(json!({"error": code, "message": self.to_string()}))).into_response()
    }
}

/// Partial query update. Optional filters accept `""` or `"all"` to clear.
#[derive(Debug, Default, Deserialize)]
struct QueryRequest {
    search: Option<String>,
    search_input: Option<String>,
    status: Option<String>,
    tier: Option<String>,
    source: Option<String>,
    sort: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
}

impl QueryRequest {
    fn into_change(self) -> Result<QueryChange, ApiError> {
        Ok(QueryChange {
            search: self.search,
            status: parse_clearable(self.status)?,
            confidence_tier: parse_clearable(self.tier)?,
            source: self
                .source
                .map(|s| if is_clear(&s) { None } else { Some(s) }),
            sort: self
                .sort
                .map(|s| SortKey::from_str(&s))
                .transpose()
                .map_err(|err| ApiError::BadRequest(err.to_string()))?,
            page: self.page,
            page_size: self.page_size,
        })
    }
}

fn is_clear(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value.eq_ignore_ascii_case("all")
}

fn parse_clearable<T>(value: Option<String>) -> Result<Option<Option<T>>, ApiError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(None),
        Some(v) if is_clear(&v) => Ok(Some(None)),
        Some(v) => v
            .parse()
            .map(|parsed| Some(Some(parsed)))
            .map_err(|err: T::Err| ApiError::BadRequest(err.to_string())),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum SelectionRequest {
    Toggle { record_id: RecordId },
    SelectPage,
    SelectAll,
    Clear,
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    action: ActionKind,
    #[serde(default)]
    product_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    action: ActionKind,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sessions", post(create_session_handler))
        .route("/sessions/{id}", delete(close_session_handler))
        .route("/sessions/{id}/page", get(page_handler))
        .route("/sessions/{id}/query", post(query_handler))
        .route("/sessions/{id}/selection", post(selection_handler))
        .route("/sessions/{id}/records/{record_id}/resolve", post(resolve_handler))
        .route("/sessions/{id}/batch", post(batch_handler))
        .route("/sessions/{id}/refresh", post(refresh_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "review queue api listening");
    let shutdown_state = state.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "listening for shutdown signal failed");
            }
            shutdown_state.close_all().await;
        })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> Response {
    Json(json!({"status": "ok", "sessions": state.session_count().await})).into_response()
}

async fn create_session_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let session = ReviewSession::new(state.backend.clone(), state.config.clone());
    if let Err(err) = session.open().await {
        session.close().await;
        return Err(err.into());
    }
    state.sessions.write().await.insert(session.id(), session.clone());
    info!(session = %session.id(), "session created");
    Ok((StatusCode::CREATED, Json(session.view().await)).into_response())
}

async fn close_session_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<SessionId>,
) -> Result<StatusCode, ApiError> {
    let session = state
        .sessions
        .write()
        .await
        .remove(&id)
        .ok_or_else(|| ApiError::NotFound(format!("session {id}")))?;
    session.close().await;
    Ok(StatusCode::NO_CONTENT)
}

async fn page_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<SessionId>,
) -> Result<Response, ApiError> {
    let session = state.session(id).await?;
    Ok(Json(session.view().await).into_response())
}

async fn query_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<SessionId>,
    Json(mut request): Json<QueryRequest>,
) -> Result<Response, ApiError> {
    let session = state.session(id).await?;
    if let Some(term) = request.search_input.take() {
        session.search_input(term)?;
    }
    let change = request.into_change()?;
    if change != QueryChange::default() {
        session.update_query(change).await?;
    }
    Ok(Json(session.view().await).into_response())
}

async fn selection_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<SessionId>,
    Json(request): Json<SelectionRequest>,
) -> Result<Response, ApiError> {
    let session = state.session(id).await?;
    match request {
        SelectionRequest::Toggle { record_id } => {
            session.toggle_selection(&record_id).await?;
        }
        SelectionRequest::SelectPage => {
            session.select_page().await?;
        }
        SelectionRequest::SelectAll => {
            session.select_all_filtered().await?;
        }
        SelectionRequest::Clear => session.clear_selection().await?,
    }
    Ok(Json(session.view().await).into_response())
}

async fn resolve_handler(
    State(state): State<AppState>,
    AxumPath((id, record_id)): AxumPath<(SessionId, String)>,
    Json(request): Json<ResolveRequest>,
) -> Result<Response, ApiError> {
    let session = state.session(id).await?;
    let presentation = session
        .resolve(&RecordId::new(record_id), request.action, request.product_id)
        .await?;
    Ok(Json(presentation).into_response())
}

async fn batch_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<SessionId>,
    Json(request): Json<BatchRequest>,
) -> Result<Response, ApiError> {
    let session = state.session(id).await?;
    let result = session.run_batch(request.action).await?;
    Ok(Json(result).into_response())
}

async fn refresh_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<SessionId>,
) -> Result<Response, ApiError> {
    let session = state.session(id).await?;
    let outcome = session.refresh(RefreshTrigger::Manual).await?;
    Ok(Json(outcome).into_response())
}
