//! Dead-letter routing for messages that exhausted their retries.
//!
//! A message is routed at most once: the conditional `dead_lettered_at`
//! stamp in the store is the claim, and only the worker that wins the
//! stamp publishes to the channel's dead-letter destination. The status
//! stays FAILED; the stamp and the annotated error message are the
//! record of the routing.

use sqlx::PgPool;

use courier_common::config::Topics;
use courier_common::error::AppError;
use courier_common::queue::DeliveryQueue;

use crate::producer;
use crate::store::MessageStore;

/// Route a FAILED message to its channel's dead-letter destination.
///
/// Returns whether this call performed the routing. `Ok(false)` means the
/// message was already dead-lettered (or is no longer FAILED) and nothing
/// was done. A broker failure after the stamp is not returned as an error:
/// the routing decision is already durable. It is recorded on the row's
/// error message, so "stamped but never published" is visible to an
/// operator alongside the stamp itself.
pub async fn route_to_dead_letter<Q: DeliveryQueue>(
    pool: &PgPool,
    queue: &Q,
    topics: &Topics,
    message_id: &str,
) -> Result<bool, AppError> {
    if !MessageStore::stamp_dead_lettered(pool, message_id).await? {
        tracing::debug!(message_id, "Message already dead-lettered, skipping");
        return Ok(false);
    }

    let message = MessageStore::get_by_message_id(pool, message_id).await?;
    let destination = topics.dlq_for_channel(message.channel);

    let publish_outcome = match producer::serialize_payload(&message) {
        Ok(payload) => queue.publish(&destination, message_id, &payload).await,
        Err(e) => Err(e),
    };
    if let Err(e) = publish_outcome {
        tracing::error!(
            message_id,
            destination,
            error = %e,
            "Failed to publish dead-lettered message to broker"
        );
        MessageStore::note_dead_letter_publish_failure(pool, message_id, &e.to_string()).await?;
    } else {
        tracing::warn!(
            message_id,
            destination,
            retry_count = message.retry_count,
            "Routed message to dead letter queue"
        );
    }
    Ok(true)
}
