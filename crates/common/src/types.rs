use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported notification channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    #[sqlx(rename = "whatsapp")]
    #[serde(rename = "whatsapp")]
    WhatsApp,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Email => write!(f, "email"),
            Channel::WhatsApp => write!(f, "whatsapp"),
        }
    }
}

/// Message delivery lifecycle status.
///
/// DELIVERED, BOUNCED and REJECTED are terminal: once one of them is written
/// no further status change is ever accepted for that message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Scheduled,
    Sent,
    Delivered,
    Failed,
    Retrying,
    Bounced,
    Rejected,
}

impl DeliveryStatus {
    /// All statuses, in declaration order. Used by the transition tests to
    /// enumerate every (from, to) pair.
    pub const ALL: [DeliveryStatus; 8] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Scheduled,
        DeliveryStatus::Sent,
        DeliveryStatus::Delivered,
        DeliveryStatus::Failed,
        DeliveryStatus::Retrying,
        DeliveryStatus::Bounced,
        DeliveryStatus::Rejected,
    ];

    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered | DeliveryStatus::Bounced | DeliveryStatus::Rejected
        )
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Scheduled => write!(f, "scheduled"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Retrying => write!(f, "retrying"),
            DeliveryStatus::Bounced => write!(f, "bounced"),
            DeliveryStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Which side produced a failure.
///
/// Set iff the message status is FAILED. Stored in its own column so the
/// retry coordinator can filter eligibility at the database level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// The outbound broker publish failed (producer side).
    ProducerPublish,
    /// The downstream consumer's delivery attempt failed.
    ConsumerProcessing,
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureType::ProducerPublish => write!(f, "producer_publish"),
            FailureType::ConsumerProcessing => write!(f, "consumer_processing"),
        }
    }
}

/// Origin of a status history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    /// Written by the gateway itself (producer, coordinator, scheduler).
    Api,
    /// Written on behalf of an external channel consumer.
    Worker,
}

impl std::fmt::Display for HistorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistorySource::Api => write!(f, "api"),
            HistorySource::Worker => write!(f, "worker"),
        }
    }
}

/// A persisted message, the permanent audit record of one send request.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    /// Externally visible identifier, distinct from the storage key.
    pub message_id: String,
    pub site_id: Option<Uuid>,
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
    pub error_message: Option<String>,
    pub failure_type: Option<FailureType>,
    pub retry_count: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One append-only audit record of a status change.
///
/// The id is a sequence, so ordering by it reproduces insertion order even
/// when several entries share a timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StatusHistoryEntry {
    pub id: i64,
    pub message_id: String,
    pub status: DeliveryStatus,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub source: HistorySource,
    pub created_at: DateTime<Utc>,
}

/// Wire payload published to the broker for channel consumers.
///
/// The same serialized form is used for normal delivery, retries and
/// dead-letter routing. It carries no credentials: consumers resolve
/// provider keys from the site reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub message_id: String,
    pub site_id: Option<Uuid>,
    pub channel: Channel,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub is_html: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl MessagePayload {
    /// Build the wire payload from a message's current persisted state.
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.message_id.clone(),
            site_id: message.site_id,
            channel: message.channel,
            recipient: message.recipient.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            is_html: message.is_html,
            from_email: message.from_email.clone(),
            from_name: message.from_name.clone(),
            media_url: message.media_url.clone(),
            file_name: message.file_name.clone(),
            caption: message.caption.clone(),
            metadata: message.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Bounced.is_terminal());
        assert!(DeliveryStatus::Rejected.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::Retrying.is_terminal());
        assert!(!DeliveryStatus::Scheduled.is_terminal());
        assert!(!DeliveryStatus::Sent.is_terminal());
    }

    #[test]
    fn test_status_display_roundtrip() {
        for status in DeliveryStatus::ALL {
            let text = status.to_string();
            let parsed: DeliveryStatus =
                serde_json::from_value(serde_json::Value::String(text.clone())).unwrap();
            assert_eq!(parsed, status, "round-trip failed for {}", text);
        }
    }

    #[test]
    fn test_payload_serializes_camel_case_without_empty_fields() {
        let payload = MessagePayload {
            message_id: "MSG-ABC".to_string(),
            site_id: None,
            channel: Channel::Email,
            recipient: "user@example.com".to_string(),
            subject: Some("Hello".to_string()),
            body: Some("World".to_string()),
            is_html: false,
            from_email: None,
            from_name: None,
            media_url: None,
            file_name: None,
            caption: None,
            metadata: None,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["messageId"], "MSG-ABC");
        assert_eq!(json["channel"], "email");
        assert_eq!(json["isHtml"], false);
        assert!(json.get("mediaUrl").is_none());
        assert!(json.get("fromEmail").is_none());
    }

    #[test]
    fn test_payload_from_message_preserves_channel_fields() {
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            message_id: "MSG-XYZ".to_string(),
            site_id: Some(Uuid::new_v4()),
            channel: Channel::WhatsApp,
            status: DeliveryStatus::Pending,
            recipient: "+15551234567".to_string(),
            subject: None,
            body: Some("hi".to_string()),
            is_html: false,
            from_email: None,
            from_name: None,
            media_url: Some("https://cdn.example.com/img.png".to_string()),
            file_name: None,
            caption: Some("a picture".to_string()),
            metadata: Some(serde_json::json!({"campaign": "launch"})),
            error_message: None,
            failure_type: None,
            retry_count: 0,
            scheduled_at: None,
            sent_at: None,
            delivered_at: None,
            dead_lettered_at: None,
            created_at: now,
            updated_at: now,
        };

        let payload = MessagePayload::from_message(&message);
        assert_eq!(payload.message_id, "MSG-XYZ");
        assert_eq!(payload.channel, Channel::WhatsApp);
        assert_eq!(payload.media_url.as_deref(), Some("https://cdn.example.com/img.png"));
        assert_eq!(payload.caption.as_deref(), Some("a picture"));
    }
}
