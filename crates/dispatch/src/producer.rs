//! Producer path: accept a message, persist it, then hand it to the broker.
//!
//! The write is a transactional outbox in miniature: the row and its first
//! history entry commit before the publish is attempted, so a broker outage
//! can never lose an accepted message. A failed publish marks the committed
//! row FAILED with `failure_type = producer_publish` and leaves it for the
//! retry coordinator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use courier_common::clock::Clock;
use courier_common::config::Topics;
use courier_common::error::AppError;
use courier_common::queue::DeliveryQueue;
use courier_common::types::{
    Channel, DeliveryStatus, FailureType, HistorySource, Message, MessagePayload,
};

use crate::store::{MessageStore, NewMessage, StatusUpdate};

const MESSAGE_ID_ATTEMPTS: usize = 5;

/// An inbound request to send a message immediately.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub channel: Channel,
    pub recipient: String,
    pub site_id: Option<uuid::Uuid>,
    pub subject: Option<String>,
    pub body: Option<String>,
    #[serde(default)]
    pub is_html: bool,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub media_url: Option<String>,
    pub file_name: Option<String>,
    pub caption: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// An inbound request to send a message at a future time.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    #[serde(flatten)]
    pub message: SendRequest,
    pub scheduled_at: DateTime<Utc>,
}

/// Per-item outcome of a bulk request. Bulk requests never abort: each
/// item succeeds or fails on its own.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemOutcome {
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct MessageProducer<Q> {
    pool: PgPool,
    queue: Q,
    topics: Topics,
    clock: Arc<dyn Clock>,
}

impl<Q: DeliveryQueue> MessageProducer<Q> {
    pub fn new(pool: PgPool, queue: Q, topics: Topics, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            queue,
            topics,
            clock,
        }
    }

    /// Accept a message for immediate delivery.
    ///
    /// Persists the row as PENDING, commits, then publishes to the
    /// channel's delivery topic. Returns the message in its post-publish
    /// state: PENDING on success, FAILED if the broker rejected it.
    pub async fn send(&self, request: SendRequest) -> Result<Message, AppError> {
        validate_request(&request)?;

        let message = self.persist(&request, DeliveryStatus::Pending, None).await?;
        tracing::info!(
            message_id = %message.message_id,
            channel = %message.channel,
            "Accepted message"
        );

        self.publish_committed(message).await
    }

    /// Accept a message for delivery at `scheduled_at`. Nothing is
    /// published; the scheduler promotes the row when it comes due.
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<Message, AppError> {
        validate_request(&request.message)?;
        if request.scheduled_at <= self.clock.now() {
            return Err(AppError::Validation(
                "scheduledAt must be in the future".into(),
            ));
        }

        let message = self
            .persist(
                &request.message,
                DeliveryStatus::Scheduled,
                Some(request.scheduled_at),
            )
            .await?;

        tracing::info!(
            message_id = %message.message_id,
            scheduled_at = %request.scheduled_at,
            "Scheduled message"
        );
        Ok(message)
    }

    pub async fn send_bulk(&self, requests: Vec<SendRequest>) -> Vec<BulkItemOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let recipient = request.recipient.clone();
            outcomes.push(match self.send(request).await {
                Ok(message) => BulkItemOutcome {
                    recipient,
                    message_id: Some(message.message_id),
                    status: Some(message.status),
                    error: None,
                },
                Err(e) => BulkItemOutcome {
                    recipient,
                    message_id: None,
                    status: None,
                    error: Some(e.to_string()),
                },
            });
        }
        outcomes
    }

    pub async fn schedule_bulk(&self, requests: Vec<ScheduleRequest>) -> Vec<BulkItemOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let recipient = request.message.recipient.clone();
            outcomes.push(match self.schedule(request).await {
                Ok(message) => BulkItemOutcome {
                    recipient,
                    message_id: Some(message.message_id),
                    status: Some(message.status),
                    error: None,
                },
                Err(e) => BulkItemOutcome {
                    recipient,
                    message_id: None,
                    status: None,
                    error: Some(e.to_string()),
                },
            });
        }
        outcomes
    }

    async fn persist(
        &self,
        request: &SendRequest,
        status: DeliveryStatus,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<Message, AppError> {
        let message_id = self.generate_message_id().await?;

        let new = NewMessage {
            message_id,
            site_id: request.site_id,
            channel: request.channel,
            status,
            recipient: request.recipient.clone(),
            subject: request.subject.clone(),
            body: request.body.clone(),
            is_html: request.is_html,
            from_email: request.from_email.clone(),
            from_name: request.from_name.clone(),
            media_url: request.media_url.clone(),
            file_name: request.file_name.clone(),
            caption: request.caption.clone(),
            metadata: request.metadata.clone(),
            scheduled_at,
        };

        let mut tx = MessageStore::begin(&self.pool).await?;
        let message = MessageStore::insert(&mut tx, &new, HistorySource::Api).await?;
        tx.commit().await?;
        Ok(message)
    }

    /// Publish an already committed PENDING message. A publish or
    /// serialization failure marks the row FAILED in a fresh transaction
    /// and returns the updated row rather than an error; the message is
    /// safely persisted either way.
    async fn publish_committed(&self, message: Message) -> Result<Message, AppError> {
        let outcome = match serialize_payload(&message) {
            Ok(payload) => {
                self.queue
                    .publish(
                        self.topics.for_channel(message.channel),
                        &message.message_id,
                        &payload,
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => Ok(message),
            Err(e) => {
                tracing::error!(
                    message_id = %message.message_id,
                    error = %e,
                    "Publish failed for accepted message, marking FAILED"
                );
                MessageStore::update_status(
                    &self.pool,
                    &message.message_id,
                    StatusUpdate {
                        status: DeliveryStatus::Failed,
                        error_message: Some(&e.to_string()),
                        failure_type: Some(FailureType::ProducerPublish),
                        source: HistorySource::Api,
                    },
                )
                .await
            }
        }
    }

    /// Generate a unique message id, checking the store for collisions.
    /// After several losing draws fall back to a timestamp-based id, which
    /// cannot collide with a concurrent draw of the same scheme in
    /// practice.
    async fn generate_message_id(&self) -> Result<String, AppError> {
        for _ in 0..MESSAGE_ID_ATTEMPTS {
            let candidate = random_message_id();
            if !MessageStore::message_id_exists(&self.pool, &candidate).await? {
                return Ok(candidate);
            }
            tracing::warn!(candidate, "Message id collision, drawing again");
        }

        let fallback = format!(
            "MSG-{:X}{}",
            self.clock.now().timestamp_millis(),
            &uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase()
        );
        tracing::warn!(fallback, "Falling back to timestamp-based message id");
        Ok(fallback)
    }
}

/// `MSG-` followed by 24 uppercase hex characters.
pub fn random_message_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("MSG-{}", hex[..24].to_uppercase())
}

/// Serialize a message into its wire payload for the broker.
pub fn serialize_payload(message: &Message) -> Result<String, AppError> {
    serde_json::to_string(&MessagePayload::from_message(message))
        .map_err(|e| AppError::Serialization(e.to_string()))
}

fn validate_request(request: &SendRequest) -> Result<(), AppError> {
    if request.recipient.trim().is_empty() {
        return Err(AppError::Validation("recipient must not be empty".into()));
    }
    match request.channel {
        Channel::Email => {
            if request.subject.as_deref().unwrap_or("").trim().is_empty() {
                return Err(AppError::Validation(
                    "subject is required for email messages".into(),
                ));
            }
            if request.body.as_deref().unwrap_or("").trim().is_empty() {
                return Err(AppError::Validation(
                    "body is required for email messages".into(),
                ));
            }
        }
        Channel::WhatsApp => {
            let has_text = !request.body.as_deref().unwrap_or("").trim().is_empty();
            let has_media = !request.media_url.as_deref().unwrap_or("").trim().is_empty();
            if !has_text && !has_media {
                return Err(AppError::Validation(
                    "whatsapp messages require a body or a media url".into(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email_request() -> SendRequest {
        SendRequest {
            channel: Channel::Email,
            recipient: "user@example.com".to_string(),
            site_id: None,
            subject: Some("Welcome".to_string()),
            body: Some("Hello".to_string()),
            is_html: false,
            from_email: None,
            from_name: None,
            media_url: None,
            file_name: None,
            caption: None,
            metadata: None,
        }
    }

    #[test]
    fn test_message_id_format() {
        let id = random_message_id();
        assert_eq!(id.len(), 28);
        assert!(id.starts_with("MSG-"));
        assert!(
            id[4..]
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase())
        );
    }

    #[test]
    fn test_message_ids_are_distinct() {
        let a = random_message_id();
        let b = random_message_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_recipient_rejected() {
        let mut request = email_request();
        request.recipient = "   ".to_string();
        assert!(matches!(
            validate_request(&request),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_email_requires_subject_and_body() {
        let mut request = email_request();
        request.subject = None;
        assert!(validate_request(&request).is_err());

        let mut request = email_request();
        request.body = Some(String::new());
        assert!(validate_request(&request).is_err());

        assert!(validate_request(&email_request()).is_ok());
    }

    #[test]
    fn test_whatsapp_requires_body_or_media() {
        let mut request = email_request();
        request.channel = Channel::WhatsApp;
        request.subject = None;
        request.body = None;
        request.media_url = None;
        assert!(validate_request(&request).is_err());

        request.media_url = Some("https://example.com/doc.pdf".to_string());
        assert!(validate_request(&request).is_ok());
    }
}
