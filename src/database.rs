// src/database.rs

use crate::{
    error::StoreError,
    models::{ChatMessage, NewMessage},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Row,
    postgres::{PgPool, PgRow},
};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Durable storage for board chat messages. Ids and timestamps are assigned here.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;

    /// Newest first.
    async fn list_messages(
        &self,
        board_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    async fn count_messages(&self, board_id: &str) -> Result<i64, StoreError>;

    async fn get_message(&self, id: &str) -> Result<Option<ChatMessage>, StoreError>;
}

/// Connects to PostgreSQL and creates the `chat_messages` table if it doesn't exist.
pub async fn setup_database(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPool::connect(database_url).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS chat_messages (
            id TEXT PRIMARY KEY,
            board_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            username TEXT NOT NULL,
            content TEXT NOT NULL,
            mentions TEXT[] NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS chat_messages_board_created_idx
            ON chat_messages (board_id, created_at DESC)",
    )
    .execute(&pool)
    .await?;

    tracing::info!("PostgreSQL database setup complete");
    Ok(pool)
}

pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_message(row: &PgRow) -> Result<ChatMessage, sqlx::Error> {
    Ok(ChatMessage {
        id: row.try_get("id")?,
        board_id: row.try_get("board_id")?,
        user_id: row.try_get("user_id")?,
        username: row.try_get("username")?,
        content: row.try_get("content")?,
        mentions: row.try_get("mentions")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn save_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let id = Uuid::new_v4().to_string();
        let row = sqlx::query(
            "INSERT INTO chat_messages (id, board_id, user_id, username, content, mentions)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING created_at",
        )
        .bind(&id)
        .bind(&message.board_id)
        .bind(&message.user_id)
        .bind(&message.username)
        .bind(&message.content)
        .bind(&message.mentions)
        .fetch_one(&self.pool)
        .await?;

        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        Ok(message.into_persisted(id, created_at))
    }

    async fn list_messages(
        &self,
        board_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, board_id, user_id, username, content, mentions, created_at
             FROM chat_messages
             WHERE board_id = $1
             ORDER BY created_at DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(board_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    async fn count_messages(&self, board_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) FROM chat_messages WHERE board_id = $1")
            .bind(board_id)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count)
    }

    async fn get_message(&self, id: &str) -> Result<Option<ChatMessage>, StoreError> {
        let row = sqlx::query(
            "SELECT id, board_id, user_id, username, content, mentions, created_at
             FROM chat_messages
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_message).transpose()?)
    }
}

/// Process-local store used when no database is configured.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<Vec<ChatMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let saved = message.into_persisted(Uuid::new_v4().to_string(), Utc::now());
        self.messages.write().await.push(saved.clone());
        Ok(saved)
    }

    async fn list_messages(
        &self,
        board_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .rev()
            .filter(|message| message.board_id == board_id)
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn count_messages(&self, board_id: &str) -> Result<i64, StoreError> {
        let messages = self.messages.read().await;
        let count = messages
            .iter()
            .filter(|message| message.board_id == board_id)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn get_message(&self, id: &str) -> Result<Option<ChatMessage>, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages.iter().find(|message| message.id == id).cloned())
    }
}
