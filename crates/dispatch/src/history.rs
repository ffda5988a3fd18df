//! Append-only message status history.
//!
//! One row is appended per actual status change; writes that do not change
//! the stored status append nothing. History records attempted reality: if
//! an invalid transition somehow reaches the recorder it is logged loudly
//! but still appended, because the audit trail must show what was attempted.
//! The `messages` row remains the source of truth.

use sqlx::{PgConnection, PgExecutor, PgPool};

use courier_common::error::AppError;
use courier_common::types::{DeliveryStatus, HistorySource, StatusHistoryEntry};

use crate::transition;

/// Append one history entry.
///
/// The caller must have verified that the status actually changed (e.g. a
/// conditional claim that reported one affected row). Use
/// [`append_if_changed`] when the old status is not already known.
pub async fn append(
    executor: impl PgExecutor<'_>,
    message_id: &str,
    status: DeliveryStatus,
    error_message: Option<&str>,
    retry_count: i32,
    source: HistorySource,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO message_status_history (message_id, status, error_message, retry_count, source)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(message_id)
    .bind(status)
    .bind(error_message)
    .bind(retry_count)
    .bind(source)
    .execute(executor)
    .await?;

    tracing::debug!(message_id, status = %status, "Appended status history entry");
    Ok(())
}

/// Append a history entry only if `new_status` differs from the message's
/// current stored status. Returns whether an entry was appended.
pub async fn append_if_changed(
    conn: &mut PgConnection,
    message_id: &str,
    new_status: DeliveryStatus,
    error_message: Option<&str>,
    retry_count: i32,
    source: HistorySource,
) -> Result<bool, AppError> {
    let current: Option<(DeliveryStatus,)> =
        sqlx::query_as("SELECT status FROM messages WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(&mut *conn)
            .await?;

    let Some((current,)) = current else {
        tracing::warn!(message_id, "Cannot append history for unknown message");
        return Ok(false);
    };

    if current == new_status {
        return Ok(false);
    }

    if !transition::is_valid_transition(current, new_status) {
        tracing::error!(
            message_id,
            from = %current,
            to = %new_status,
            "Invalid transition reached the history recorder; appending for audit trail"
        );
    }

    append(
        &mut *conn,
        message_id,
        new_status,
        error_message,
        retry_count,
        source,
    )
    .await?;
    Ok(true)
}

/// Full status history for a message, oldest first. Ordered by the
/// sequence id, so entries sharing a timestamp keep insertion order.
pub async fn history(pool: &PgPool, message_id: &str) -> Result<Vec<StatusHistoryEntry>, AppError> {
    let entries: Vec<StatusHistoryEntry> = sqlx::query_as(
        r#"
        SELECT * FROM message_status_history
        WHERE message_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(message_id)
    .fetch_all(pool)
    .await?;

    Ok(entries)
}

/// Latest history entry for a message, if any.
pub async fn latest(pool: &PgPool, message_id: &str) -> Result<Option<StatusHistoryEntry>, AppError> {
    let entry: Option<StatusHistoryEntry> = sqlx::query_as(
        r#"
        SELECT * FROM message_status_history
        WHERE message_id = $1
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(message_id)
    .fetch_optional(pool)
    .await?;

    Ok(entry)
}
