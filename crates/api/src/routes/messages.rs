//! Message status and history routes, including the consumer outcome
//! callback that channel consumers report delivery results through.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_common::error::AppError;
use courier_common::types::{
    Channel, DeliveryStatus, FailureType, HistorySource, Message, StatusHistoryEntry,
};
use courier_dispatch::history;
use courier_dispatch::store::{MessageStore, StatusUpdate};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/messages/{message_id}", get(get_message))
        .route("/messages/{message_id}/history", get(get_message_history))
        .route("/messages/{message_id}/status", post(update_message_status))
}

/// Externally visible view of a message.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub message_id: String,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureType>,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Message> for MessageResponse {
    fn from(message: Message) -> Self {
        Self {
            message_id: message.message_id,
            channel: message.channel,
            status: message.status,
            recipient: message.recipient,
            error_message: message.error_message,
            failure_type: message.failure_type,
            retry_count: message.retry_count,
            scheduled_at: message.scheduled_at,
            sent_at: message.sent_at,
            delivered_at: message.delivered_at,
            dead_lettered_at: message.dead_lettered_at,
            created_at: message.created_at,
            updated_at: message.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntryResponse {
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub source: HistorySource,
    pub created_at: DateTime<Utc>,
}

impl From<StatusHistoryEntry> for HistoryEntryResponse {
    fn from(entry: StatusHistoryEntry) -> Self {
        Self {
            status: entry.status,
            error_message: entry.error_message,
            retry_count: entry.retry_count,
            source: entry.source,
            created_at: entry.created_at,
        }
    }
}

/// A delivery outcome reported by a channel consumer.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateRequest {
    pub status: DeliveryStatus,
    pub error_message: Option<String>,
    pub failure_type: Option<FailureType>,
}

/// GET /messages/:message_id — Current state of a message.
async fn get_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    let message = MessageStore::get_by_message_id(&state.pool, &message_id).await?;
    Ok(Json(message.into()))
}

/// GET /messages/:message_id/history — Ordered status history.
async fn get_message_history(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<Json<Vec<HistoryEntryResponse>>, AppError> {
    // 404 for unknown ids rather than an empty list
    MessageStore::get_by_message_id(&state.pool, &message_id).await?;

    let entries = history::history(&state.pool, &message_id).await?;
    Ok(Json(entries.into_iter().map(Into::into).collect()))
}

/// POST /messages/:message_id/status — Record a consumer delivery outcome.
///
/// Invalid transitions are rejected with 409 and leave the message
/// untouched; a repeated report of the current status is an idempotent
/// no-op that returns the unchanged message.
async fn update_message_status(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(request): Json<StatusUpdateRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let failure_type = match (request.status, request.failure_type) {
        (DeliveryStatus::Failed, None) => Some(FailureType::ConsumerProcessing),
        (_, failure_type) => failure_type,
    };

    let message = MessageStore::update_status(
        &state.pool,
        &message_id,
        StatusUpdate {
            status: request.status,
            error_message: request.error_message.as_deref(),
            failure_type,
            source: HistorySource::Worker,
        },
    )
    .await?;

    Ok(Json(message.into()))
}
