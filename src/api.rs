//! HTTP API for the calbridge server

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use chrono::Utc;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::Config;
use crate::editor::EventEdit;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::models::{
    CalendarSelectionRequest, CreateTodoRequest, EventListQuery, EventUpdateRequest,
    OAuthCallbackQuery, TodoResponse, UpdateTodoRequest,
};
use crate::webhook::{Notification, NotificationAction};

/// Paths reachable without an API token
const PUBLIC_PATHS: &[&str] = &["/health", "/oauth/google/callback", "/webhooks/google"];

/// Application state shared across handlers
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: Config,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, config: Config) -> Arc<Self> {
        Arc::new(Self { engine, config })
    }
}

/// The user an API token authenticated as
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub i64);

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/oauth/google/callback", get(oauth_callback))
        .route("/webhooks/google", post(webhook))
        .route("/api/v1/calendar/oauth/start", get(oauth_start))
        .route("/api/v1/calendar/status", get(status))
        .route("/api/v1/calendar/calendars", get(list_calendars))
        .route("/api/v1/calendar/calendars/selection", post(set_selection))
        .route("/api/v1/calendar/sync", post(sync))
        .route("/api/v1/calendar/events", get(list_events))
        .route("/api/v1/calendar/events/{id}", patch(update_event))
        .route("/api/v1/todos", get(list_todos).post(create_todo))
        .route("/api/v1/todos/{id}", patch(update_todo).delete(delete_todo))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint (no auth required)
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "calbridge",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Auth middleware - resolves the Bearer token to a user
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    if PUBLIC_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(token) = token else {
        return ApiError::new(StatusCode::UNAUTHORIZED, "Missing or invalid Authorization header")
            .into_response();
    };

    let Some(user_id) = state.config.validate_token(token) else {
        return ApiError::new(StatusCode::UNAUTHORIZED, "Invalid API token").into_response();
    };

    request.extensions_mut().insert(AuthUser(user_id));
    next.run(request).await
}

// --- connection ---

async fn oauth_start(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.start_oauth(user_id)?))
}

async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OAuthCallbackQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(error) = query.error {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Authorization was not granted: {error}"),
        ));
    }
    let (Some(code), Some(oauth_state)) = (query.code, query.state) else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Missing code or state"));
    };

    let user_id = match state.engine.complete_oauth(&code, &oauth_state).await {
        Ok(user_id) => user_id,
        Err(EngineError::NotFound(_)) => {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "Invalid or expired OAuth state"));
        }
        Err(err) => return Err(err.into()),
    };

    Ok(Json(serde_json::json!({ "connected": true, "user_id": user_id })))
}

async fn status(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.connection_status(user_id)?))
}

// --- calendars and events ---

async fn list_calendars(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.list_calendars(user_id)?))
}

async fn set_selection(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(request): Json<CalendarSelectionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.set_selection(user_id, &request.provider_ids)?))
}

async fn sync(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!(user_id, "Manual sync requested");
    let report = state.engine.sync_user(user_id).await?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

async fn list_events(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Query(query): Query<EventListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.end <= query.start {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "end must be after start"));
    }
    let events = state
        .engine
        .list_events(user_id, query.start, query.end, query.include_todos)?;
    Ok(Json(events))
}

async fn update_event(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(event_id): Path<i64>,
    Json(request): Json<EventUpdateRequest>,
) -> Result<Response, ApiError> {
    if let (Some(start), Some(end)) = (request.start, request.end)
        && end < start
    {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "end must not be before start"));
    }
    let edit = EventEdit {
        summary: request.summary,
        start: request.start,
        end: request.end,
        scope: request.scope,
        time_zone: request.time_zone,
        is_all_day: request.is_all_day,
    };

    // A future-scope split can move the instance into a new series
    match state.engine.edit_event(user_id, event_id, edit).await? {
        Some(event) => Ok(Json(event).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// Push notification receiver; always answers 200
async fn webhook(State(state): State<Arc<AppState>>, headers: HeaderMap) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let notification = Notification {
        channel_id: header("x-goog-channel-id"),
        resource_id: header("x-goog-resource-id"),
        resource_state: header("x-goog-resource-state"),
        channel_token: header("x-goog-channel-token"),
    };

    let action = state.engine.handle_notification(&notification).await;
    if action != NotificationAction::Acknowledged {
        tracing::debug!(
            channel_id = ?notification.channel_id,
            resource_id = ?notification.resource_id,
            ?action,
            "Webhook handled"
        );
    }
    StatusCode::OK
}

// --- todos ---

async fn list_todos(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let todos: Vec<TodoResponse> = state
        .engine
        .list_todos(user_id)?
        .into_iter()
        .map(|todo| TodoResponse::new(todo, now))
        .collect();
    Ok(Json(todos))
}

async fn create_todo(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(request): Json<CreateTodoRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.text.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "text must not be empty"));
    }
    let todo = state.engine.create_todo(user_id, request).await?;
    Ok((StatusCode::CREATED, Json(TodoResponse::new(todo, Utc::now()))))
}

async fn update_todo(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(todo_id): Path<i64>,
    Json(request): Json<UpdateTodoRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.text.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "text must not be empty"));
    }
    let todo = state.engine.update_todo(user_id, todo_id, request).await?;
    Ok(Json(TodoResponse::new(todo, Utc::now())))
}

async fn delete_todo(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(todo_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.delete_todo(user_id, todo_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// API error type
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), error = %self.message, "API error");
        }
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::ReauthRequired { .. } => StatusCode::CONFLICT,
            EngineError::NotConnected { .. } | EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::TokenUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Provider(_) => StatusCode::BAD_GATEWAY,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}
