//! Delivery queue abstraction.
//!
//! The broker is Redis Streams: one stream per channel destination, one
//! `XADD` per message. Consumers read their channel's stream with consumer
//! groups; dead-letter destinations are plain streams kept for inspection.
//!
//! The trait exists so the retry coordinator, scheduler and producer can be
//! exercised in tests against recording/failing queues without a broker.

use redis::aio::ConnectionManager;

use crate::error::AppError;

/// A destination-addressed publish interface over the broker.
pub trait DeliveryQueue: Send + Sync {
    /// Publish one payload to a destination, keyed by message id.
    ///
    /// Resolves once the broker has acknowledged the append. Any error is a
    /// publish failure to be recorded by the caller; the queue itself never
    /// mutates message state.
    fn publish(
        &self,
        destination: &str,
        key: &str,
        payload: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Redis Streams backed delivery queue.
#[derive(Clone)]
pub struct RedisDeliveryQueue {
    redis: ConnectionManager,
}

impl RedisDeliveryQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

impl DeliveryQueue for RedisDeliveryQueue {
    async fn publish(&self, destination: &str, key: &str, payload: &str) -> Result<(), AppError> {
        // ConnectionManager clones share the underlying multiplexed connection
        let mut conn = self.redis.clone();

        let entry_id: String = redis::cmd("XADD")
            .arg(destination)
            .arg("*")
            .arg("message_id")
            .arg(key)
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        tracing::debug!(
            destination,
            message_id = key,
            entry_id = %entry_id,
            "Published payload to delivery stream"
        );
        Ok(())
    }
}
