//! Storage collaborators.
//!
//! The worker and the streaming session take these traits rather than a pool
//! so their logic is testable against in-memory fakes. The Postgres
//! implementations are thin: each method is a single statement, which is all
//! the atomicity the pipeline needs — the only entity write is "set the
//! vector", and message checkpoints are sequential within a session.

use crate::models::conversation::{ChatMessage, NewMessage, Role};
use crate::models::entity::{Amenity, Category, Destination, EmbeddableEntity, EntityKind, Resort};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Read/write access to embeddable entities.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Load one entity by kind and id. `None` when the row no longer exists.
    async fn load(&self, kind: EntityKind, id: Uuid)
        -> Result<Option<EmbeddableEntity>, StoreError>;

    /// Overwrite the entity's stored vector. The ANN index maintenance is the
    /// database's concern.
    async fn save_embedding(
        &self,
        kind: EntityKind,
        id: Uuid,
        embedding: Vector,
    ) -> Result<(), StoreError>;
}

/// Read/write access to conversations and their messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_conversation(&self) -> Result<Uuid, StoreError>;

    /// Last `limit` valid, non-empty messages of the conversation,
    /// oldest-first.
    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    async fn insert_message(
        &self,
        conversation_id: Uuid,
        message: &NewMessage,
    ) -> Result<Uuid, StoreError>;

    async fn update_message(
        &self,
        id: Uuid,
        content: &str,
        token_count: Option<i32>,
    ) -> Result<(), StoreError>;
}

// ============================================================================
// Postgres implementations
// ============================================================================

fn entity_table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Amenity => "amenities",
        EntityKind::Category => "categories",
        EntityKind::Destination => "destinations",
        EntityKind::Resort => "resorts",
    }
}

#[derive(Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn load(
        &self,
        kind: EntityKind,
        id: Uuid,
    ) -> Result<Option<EmbeddableEntity>, StoreError> {
        match kind {
            EntityKind::Destination => {
                let row: Option<(
                    Uuid,
                    String,
                    String,
                    Option<String>,
                    Option<String>,
                    Option<Vec<String>>,
                    Option<Vector>,
                )> = sqlx::query_as(
                    "SELECT id, name, country, region, description, activities, embedding
                     FROM destinations WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

                Ok(row.map(
                    |(id, name, country, region, description, activities, embedding)| {
                        EmbeddableEntity::Destination(Destination {
                            id,
                            name,
                            country,
                            region,
                            description,
                            activities: activities.unwrap_or_default(),
                            embedding,
                        })
                    },
                ))
            }
            EntityKind::Resort => {
                let row: Option<(
                    Uuid,
                    String,
                    Option<String>,
                    Option<i16>,
                    Option<i32>,
                    Option<Vec<String>>,
                    Option<String>,
                    Option<Vector>,
                )> = sqlx::query_as(
                    "SELECT id, name, location, star_rating, room_count, amenities,
                            description, embedding
                     FROM resorts WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

                Ok(row.map(
                    |(
                        id,
                        name,
                        location,
                        star_rating,
                        room_count,
                        amenities,
                        description,
                        embedding,
                    )| {
                        EmbeddableEntity::Resort(Resort {
                            id,
                            name,
                            location,
                            star_rating,
                            room_count,
                            amenities: amenities.unwrap_or_default(),
                            description,
                            embedding,
                        })
                    },
                ))
            }
            EntityKind::Category => {
                let row: Option<(Uuid, String, Option<String>, Option<Vector>)> = sqlx::query_as(
                    "SELECT id, name, description, embedding FROM categories WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

                Ok(row.map(|(id, name, description, embedding)| {
                    EmbeddableEntity::Category(Category {
                        id,
                        name,
                        description,
                        embedding,
                    })
                }))
            }
            EntityKind::Amenity => {
                let row: Option<(Uuid, String, Option<String>, Option<Vector>)> = sqlx::query_as(
                    "SELECT id, name, description, embedding FROM amenities WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

                Ok(row.map(|(id, name, description, embedding)| {
                    EmbeddableEntity::Amenity(Amenity {
                        id,
                        name,
                        description,
                        embedding,
                    })
                }))
            }
        }
    }

    async fn save_embedding(
        &self,
        kind: EntityKind,
        id: Uuid,
        embedding: Vector,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET embedding = $1, updated_at = NOW() WHERE id = $2",
            entity_table(kind)
        );
        sqlx::query(&sql)
            .bind(&embedding)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type MessageRow = (
    Uuid,
    Uuid,
    String,
    String,
    Option<String>,
    Option<i32>,
    Option<serde_json::Value>,
    DateTime<Utc>,
);

fn row_to_message(row: MessageRow) -> Option<ChatMessage> {
    let (id, conversation_id, role, content, model, token_count, metadata, created_at) = row;
    // rows with a role outside the closed set are not valid history
    let role = Role::parse(&role)?;
    Some(ChatMessage {
        id,
        conversation_id,
        role,
        content,
        model,
        token_count,
        metadata,
        created_at,
    })
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create_conversation(&self) -> Result<Uuid, StoreError> {
        let row: (Uuid,) = sqlx::query_as(
            "INSERT INTO conversations (metadata) VALUES ('{}'::jsonb) RETURNING id",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, conversation_id, role, content, model, token_count, metadata, created_at
             FROM messages
             WHERE conversation_id = $1 AND content <> ''
             ORDER BY created_at DESC
             LIMIT $2",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<ChatMessage> =
            rows.into_iter().filter_map(row_to_message).collect();
        messages.reverse();
        Ok(messages)
    }

    async fn insert_message(
        &self,
        conversation_id: Uuid,
        message: &NewMessage,
    ) -> Result<Uuid, StoreError> {
        let row: (Uuid,) = sqlx::query_as(
            "INSERT INTO messages (conversation_id, role, content, model, token_count, metadata)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&message.model)
        .bind(message.token_count)
        .bind(&message.metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn update_message(
        &self,
        id: Uuid,
        content: &str,
        token_count: Option<i32>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE messages
             SET content = $1, token_count = COALESCE($2, token_count)
             WHERE id = $3",
        )
        .bind(content)
        .bind(token_count)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
