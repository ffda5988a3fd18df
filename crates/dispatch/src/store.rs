//! Postgres access for message rows.
//!
//! Every status write goes through this module so the transition rules and
//! the failure-type invariant are enforced in one place. Conditional claims
//! return the affected row count; zero rows means another worker got there
//! first and the caller must skip silently.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgExecutor, PgPool, Postgres, Transaction};

use courier_common::error::AppError;
use courier_common::types::{Channel, DeliveryStatus, FailureType, HistorySource, Message};

use crate::{history, transition};

/// Upper bound on any single lifecycle transaction.
const TRANSACTION_TIMEOUT: &str = "30s";

/// Fields for a new message row. The producer fills this from an API
/// request; the store assigns nothing beyond what is passed in.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_id: String,
    pub site_id: Option<uuid::Uuid>,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub is_html: bool,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub media_url: Option<String>,
    pub file_name: Option<String>,
    pub caption: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// A validated status update, applied in its own transaction.
#[derive(Debug, Clone)]
pub struct StatusUpdate<'a> {
    pub status: DeliveryStatus,
    pub error_message: Option<&'a str>,
    pub failure_type: Option<FailureType>,
    pub source: HistorySource,
}

pub struct MessageStore;

impl MessageStore {
    /// Begin a transaction with the lifecycle statement timeout applied.
    pub async fn begin(pool: &PgPool) -> Result<Transaction<'static, Postgres>, AppError> {
        let mut tx = pool.begin().await?;
        sqlx::query(&format!("SET LOCAL statement_timeout = '{TRANSACTION_TIMEOUT}'"))
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Insert a new message row and its initial history entry.
    pub async fn insert(
        conn: &mut PgConnection,
        new: &NewMessage,
        source: HistorySource,
    ) -> Result<Message, AppError> {
        let message: Message = sqlx::query_as(
            r#"
            INSERT INTO messages (
                message_id, site_id, channel, status, recipient,
                subject, body, is_html, from_email, from_name,
                media_url, file_name, caption, metadata, scheduled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING *
            "#,
        )
        .bind(&new.message_id)
        .bind(new.site_id)
        .bind(new.channel)
        .bind(new.status)
        .bind(&new.recipient)
        .bind(&new.subject)
        .bind(&new.body)
        .bind(new.is_html)
        .bind(&new.from_email)
        .bind(&new.from_name)
        .bind(&new.media_url)
        .bind(&new.file_name)
        .bind(&new.caption)
        .bind(&new.metadata)
        .bind(new.scheduled_at)
        .fetch_one(&mut *conn)
        .await?;

        history::append(
            &mut *conn,
            &message.message_id,
            message.status,
            None,
            message.retry_count,
            source,
        )
        .await?;

        Ok(message)
    }

    pub async fn find_by_message_id(
        executor: impl PgExecutor<'_>,
        message_id: &str,
    ) -> Result<Option<Message>, AppError> {
        let message: Option<Message> =
            sqlx::query_as("SELECT * FROM messages WHERE message_id = $1")
                .bind(message_id)
                .fetch_optional(executor)
                .await?;
        Ok(message)
    }

    /// Like [`find_by_message_id`] but a missing row is an error.
    ///
    /// [`find_by_message_id`]: MessageStore::find_by_message_id
    pub async fn get_by_message_id(
        executor: impl PgExecutor<'_>,
        message_id: &str,
    ) -> Result<Message, AppError> {
        Self::find_by_message_id(executor, message_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Message {message_id} not found")))
    }

    pub async fn message_id_exists(
        executor: impl PgExecutor<'_>,
        message_id: &str,
    ) -> Result<bool, AppError> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM messages WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(executor)
            .await?;
        Ok(row.is_some())
    }

    /// Atomically claim a FAILED message for a retry attempt.
    ///
    /// Flips FAILED -> RETRYING and clears the failure marker in one
    /// conditional update. Returns the affected row count: 0 means the
    /// message is no longer FAILED (claimed elsewhere, delivered, updated
    /// by a consumer) and the caller must skip it without error.
    pub async fn claim_failed_for_retry(
        conn: &mut PgConnection,
        message_id: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'retrying', failure_type = NULL, error_message = NULL, updated_at = NOW()
            WHERE message_id = $1 AND status = 'failed'
            "#,
        )
        .bind(message_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Atomically promote a SCHEDULED message to PENDING, clearing
    /// `scheduled_at` so the row can never be promoted twice. Returns the
    /// affected row count; 0 means another scheduler pass won the race.
    pub async fn claim_scheduled_for_promotion(
        conn: &mut PgConnection,
        message_id: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'pending', scheduled_at = NULL, updated_at = NOW()
            WHERE message_id = $1 AND status = 'scheduled'
            "#,
        )
        .bind(message_id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// One page of retry-eligible messages: FAILED with the given failure
    /// type, under the retry ceiling, created before the delay cutoff, not
    /// yet dead-lettered. Oldest first.
    pub async fn find_failed_for_retry(
        pool: &PgPool,
        failure_type: FailureType,
        max_retries: i32,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Message>, AppError> {
        let messages: Vec<Message> = sqlx::query_as(
            r#"
            SELECT * FROM messages
            WHERE status = 'failed'
              AND failure_type = $1
              AND retry_count < $2
              AND created_at < $3
              AND dead_lettered_at IS NULL
            ORDER BY created_at ASC
            LIMIT $4
            "#,
        )
        .bind(failure_type)
        .bind(max_retries)
        .bind(created_before)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(messages)
    }

    /// One page of SCHEDULED messages whose `scheduled_at` has passed.
    pub async fn find_due_scheduled(
        pool: &PgPool,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Message>, AppError> {
        let messages: Vec<Message> = sqlx::query_as(
            r#"
            SELECT * FROM messages
            WHERE status = 'scheduled' AND scheduled_at <= $1
            ORDER BY scheduled_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(messages)
    }

    /// Apply a validated status update in its own transaction.
    ///
    /// Same-status writes are idempotent no-ops that return the current
    /// row unchanged; invalid transitions fail closed with a typed error
    /// before anything is written. Sets `sent_at` / `delivered_at` the
    /// first time a message reaches SENT / DELIVERED, and keeps the
    /// failure-type invariant: `failure_type` is stored iff the new
    /// status is FAILED.
    pub async fn update_status(
        pool: &PgPool,
        message_id: &str,
        update: StatusUpdate<'_>,
    ) -> Result<Message, AppError> {
        if update.status == DeliveryStatus::Failed && update.failure_type.is_none() {
            return Err(AppError::Validation(
                "A FAILED status update requires a failure type".into(),
            ));
        }

        let mut tx = Self::begin(pool).await?;

        let current = Self::get_by_message_id(&mut *tx, message_id).await?;

        if current.status == update.status {
            tracing::debug!(
                message_id,
                status = %update.status,
                "Status unchanged, skipping update"
            );
            tx.rollback().await?;
            return Ok(current);
        }

        transition::assert_valid_transition(current.status, update.status)?;

        let failure_type = if update.status == DeliveryStatus::Failed {
            update.failure_type
        } else {
            None
        };

        let message: Message = sqlx::query_as(
            r#"
            UPDATE messages
            SET status = $2,
                error_message = $3,
                failure_type = $4,
                sent_at = CASE WHEN $2 = 'sent' AND sent_at IS NULL THEN NOW() ELSE sent_at END,
                delivered_at = CASE WHEN $2 = 'delivered' AND delivered_at IS NULL THEN NOW() ELSE delivered_at END,
                updated_at = NOW()
            WHERE message_id = $1
            RETURNING *
            "#,
        )
        .bind(message_id)
        .bind(update.status)
        .bind(update.error_message)
        .bind(failure_type)
        .fetch_one(&mut *tx)
        .await?;

        history::append(
            &mut *tx,
            message_id,
            message.status,
            update.error_message,
            message.retry_count,
            update.source,
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            message_id,
            from = %current.status,
            to = %message.status,
            "Updated message status"
        );
        Ok(message)
    }

    /// Record a failed delivery attempt on a claimed message.
    ///
    /// Runs against a RETRYING (or freshly promoted PENDING) row: flips it
    /// to FAILED with `failure_type = producer_publish`, increments the
    /// retry count, and appends the history entry. This is the only write
    /// path that touches `retry_count`.
    pub async fn record_failed_attempt(
        conn: &mut PgConnection,
        message_id: &str,
        error_message: &str,
    ) -> Result<Message, AppError> {
        let message: Message = sqlx::query_as(
            r#"
            UPDATE messages
            SET status = 'failed',
                failure_type = 'producer_publish',
                retry_count = retry_count + 1,
                error_message = $2,
                updated_at = NOW()
            WHERE message_id = $1
            RETURNING *
            "#,
        )
        .bind(message_id)
        .bind(error_message)
        .fetch_one(&mut *conn)
        .await?;

        history::append(
            &mut *conn,
            message_id,
            DeliveryStatus::Failed,
            Some(error_message),
            message.retry_count,
            HistorySource::Worker,
        )
        .await?;

        Ok(message)
    }

    /// Release a claim without recording an attempt: RETRYING -> FAILED
    /// with the retry count untouched. Used when the post-claim ceiling
    /// check finds the message already at its retry limit.
    pub async fn release_claim(
        conn: &mut PgConnection,
        message_id: &str,
    ) -> Result<(), AppError> {
        let message: Message = sqlx::query_as(
            r#"
            UPDATE messages
            SET status = 'failed',
                failure_type = 'producer_publish',
                error_message = 'Retry limit reached before the attempt started',
                updated_at = NOW()
            WHERE message_id = $1 AND status = 'retrying'
            RETURNING *
            "#,
        )
        .bind(message_id)
        .fetch_one(&mut *conn)
        .await?;

        history::append(
            &mut *conn,
            message_id,
            DeliveryStatus::Failed,
            message.error_message.as_deref(),
            message.retry_count,
            HistorySource::Worker,
        )
        .await?;

        Ok(())
    }

    /// Requeue a successfully republished message: RETRYING -> PENDING.
    /// The retry count is deliberately untouched; it counts failed
    /// attempts, not successful requeues. Returns false if the row was no
    /// longer RETRYING.
    pub async fn requeue_after_retry(pool: &PgPool, message_id: &str) -> Result<bool, AppError> {
        let mut tx = Self::begin(pool).await?;

        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'pending', error_message = NULL, updated_at = NOW()
            WHERE message_id = $1 AND status = 'retrying'
            "#,
        )
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            tracing::warn!(message_id, "Message no longer RETRYING after republish");
            return Ok(false);
        }

        let message = Self::get_by_message_id(&mut *tx, message_id).await?;
        history::append(
            &mut *tx,
            message_id,
            DeliveryStatus::Pending,
            None,
            message.retry_count,
            HistorySource::Worker,
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Demote RETRYING rows whose claim went stale (the claiming worker
    /// died between claim and outcome) back to FAILED so a later pass can
    /// pick them up. Does not touch `retry_count`: the attempt never
    /// produced an outcome.
    pub async fn demote_stale_retrying(
        pool: &PgPool,
        updated_before: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut tx = Self::begin(pool).await?;

        let stale: Vec<(String, i32)> = sqlx::query_as(
            r#"
            UPDATE messages
            SET status = 'failed',
                failure_type = 'producer_publish',
                error_message = 'Retry claim expired without an outcome',
                updated_at = NOW()
            WHERE status = 'retrying' AND updated_at < $1
            RETURNING message_id, retry_count
            "#,
        )
        .bind(updated_before)
        .fetch_all(&mut *tx)
        .await?;

        for (message_id, retry_count) in &stale {
            history::append(
                &mut *tx,
                message_id,
                DeliveryStatus::Failed,
                Some("Retry claim expired without an outcome"),
                *retry_count,
                HistorySource::Worker,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(stale.len() as u64)
    }

    /// Record that a dead-lettered message never reached the dead-letter
    /// stream. The stamp stays in place; the annotated error message is
    /// what tells an operator the publish is still outstanding.
    pub async fn note_dead_letter_publish_failure(
        pool: &PgPool,
        message_id: &str,
        error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE messages
            SET error_message = 'Dead letter publish failed: ' || $2 || '; '
                                || COALESCE(error_message, ''),
                updated_at = NOW()
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Stamp a message as dead-lettered, exactly once.
    ///
    /// The conditional update on `dead_lettered_at IS NULL` is the claim:
    /// whichever worker gets 1 affected row owns the DLQ publish, every
    /// other worker sees 0 and skips. The status stays FAILED.
    pub async fn stamp_dead_lettered(
        pool: &PgPool,
        message_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET dead_lettered_at = NOW(),
                error_message = 'Max retries exceeded, routed to dead letter queue: '
                                || COALESCE(error_message, 'no error recorded'),
                updated_at = NOW()
            WHERE message_id = $1 AND status = 'failed' AND dead_lettered_at IS NULL
            "#,
        )
        .bind(message_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
