// src/api.rs

use crate::{
    auth::AuthUser,
    error::AppError,
    models::{ChatMessage, NewMessage, ServerMessage, flexible_id},
    state::AppState,
    websocket::websocket_handler,
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 100;

/// Builds the application's routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/chat", get(websocket_handler))
        .route("/api/boards/{board_id}/messages", get(list_messages))
        .route("/api/boards/{board_id}/messages/count", get(count_messages))
        .route("/api/boards/{board_id}/online", get(online))
        .route("/api/messages", post(create_message))
        .route("/api/messages/{message_id}", get(get_message))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    limit: Option<i64>,
    offset: Option<i64>,
}

impl Pagination {
    /// Out-of-range limits fall back to the default page size.
    pub fn limit(&self) -> i64 {
        match self.limit {
            Some(limit) if (1..=MAX_PAGE_SIZE).contains(&limit) => limit,
            _ => DEFAULT_PAGE_SIZE,
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    #[serde(deserialize_with = "flexible_id")]
    pub board_id: String,
    pub content: String,
    #[serde(default)]
    pub mentions: Vec<String>,
}

async fn list_messages(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(board_id): Path<String>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<ChatMessage>>, AppError> {
    let messages = state
        .store
        .list_messages(&board_id, page.limit(), page.offset())
        .await?;
    Ok(Json(messages))
}

async fn count_messages(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(board_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let count = state.store.count_messages(&board_id).await?;
    Ok(Json(json!({ "count": count })))
}

async fn online(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(board_id): Path<String>,
) -> Json<Value> {
    let connections = state.hub.room_size(board_id.clone()).await;
    Json(json!({ "board_id": board_id, "connections": connections }))
}

async fn get_message(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(message_id): Path<String>,
) -> Result<Json<ChatMessage>, AppError> {
    state
        .store
        .get_message(&message_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("message {message_id} not found")))
}

/// Same path as a socket `message` frame: validate, persist, then broadcast to the board.
async fn create_message(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Json(request): Json<CreateMessageRequest>,
) -> Result<(StatusCode, Json<ChatMessage>), AppError> {
    let board_id = request.board_id.trim().to_string();
    if board_id.is_empty() {
        return Err(AppError::BadRequest("board_id is required".to_string()));
    }
    if request.content.trim().is_empty() {
        return Err(AppError::BadRequest("Content is required".to_string()));
    }

    let saved = state
        .store
        .save_message(NewMessage {
            board_id: board_id.clone(),
            user_id: identity.user_id,
            username: identity.username,
            content: request.content,
            mentions: request.mentions,
        })
        .await?;

    info!(message_id = %saved.id, board_id = %board_id, "Message created over HTTP");
    state
        .hub
        .broadcast(board_id, ServerMessage::Message(saved.clone()), None);
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn health() -> &'static str {
    "ok"
}
