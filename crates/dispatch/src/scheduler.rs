//! Scheduled-message promoter.
//!
//! Each tick pages through SCHEDULED rows whose `scheduled_at` has passed
//! and promotes them to PENDING. The promotion clears `scheduled_at` in
//! the same conditional update that flips the status, so a row can never
//! be promoted twice even with concurrent scheduler replicas. Like the
//! producer path, the promotion commits before the publish; a publish
//! failure marks the row FAILED for the retry coordinator.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use courier_common::clock::Clock;
use courier_common::config::{AppConfig, Topics};
use courier_common::error::AppError;
use courier_common::queue::DeliveryQueue;
use courier_common::types::{DeliveryStatus, FailureType, HistorySource};

use crate::store::{MessageStore, StatusUpdate};
use crate::{history, producer};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Due-message page size.
    pub batch_size: i64,
    /// Interval between ticks.
    pub tick_interval: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.schedule_batch_size,
            tick_interval: Duration::from_secs(config.schedule_tick_interval_secs),
        }
    }
}

#[derive(Clone)]
pub struct MessageScheduler<Q> {
    pool: PgPool,
    queue: Q,
    topics: Topics,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
}

impl<Q: DeliveryQueue> MessageScheduler<Q> {
    pub fn new(
        pool: PgPool,
        queue: Q,
        topics: Topics,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            pool,
            queue,
            topics,
            clock,
            settings,
        }
    }

    /// Tick forever. A failed tick is logged and the loop waits for the
    /// next interval.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        tracing::info!(
            interval_secs = self.settings.tick_interval.as_secs(),
            "Message scheduler started"
        );
        loop {
            interval.tick().await;
            match self.tick().await {
                Ok(promoted) if promoted > 0 => {
                    tracing::info!(promoted, "Scheduler tick complete");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Scheduler tick aborted"),
            }
        }
    }

    /// One pass over all currently due messages. Returns how many were
    /// promoted. Per-message failures are logged and do not stop the pass.
    pub async fn tick(&self) -> Result<u32, AppError> {
        let now = self.clock.now();
        let mut promoted = 0u32;

        loop {
            let page =
                MessageStore::find_due_scheduled(&self.pool, now, self.settings.batch_size).await?;
            let page_len = page.len();
            let mut page_errors = 0usize;

            for message in page {
                match self.promote_message(&message.message_id).await {
                    Ok(true) => promoted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        page_errors += 1;
                        tracing::error!(
                            message_id = %message.message_id,
                            error = %e,
                            "Scheduled promotion errored"
                        );
                    }
                }
            }

            if page_len < self.settings.batch_size as usize {
                break;
            }
            if page_errors == page_len {
                tracing::warn!("Full page of errors, ending scheduler tick early");
                break;
            }
        }

        Ok(promoted)
    }

    /// Promote one due message and publish it. Returns whether this call
    /// performed the promotion; false means another pass won the claim.
    async fn promote_message(&self, message_id: &str) -> Result<bool, AppError> {
        let mut tx = MessageStore::begin(&self.pool).await?;

        if MessageStore::claim_scheduled_for_promotion(&mut tx, message_id).await? == 0 {
            tx.rollback().await?;
            tracing::debug!(message_id, "Message no longer SCHEDULED, skipping promotion");
            return Ok(false);
        }

        let message = MessageStore::get_by_message_id(&mut *tx, message_id).await?;

        let payload = match producer::serialize_payload(&message) {
            Ok(payload) => payload,
            Err(e) => {
                MessageStore::record_failed_attempt(&mut tx, message_id, &e.to_string()).await?;
                tx.commit().await?;
                tracing::error!(message_id, error = %e, "Scheduled payload serialization failed");
                return Ok(false);
            }
        };

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

        let destination = self.topics.for_channel(message.channel);
        match self.queue.publish(destination, message_id, &payload).await {
            Ok(()) => {
                tracing::info!(message_id, destination, "Promoted scheduled message");
                Ok(true)
            }
            Err(e) => {
                tracing::error!(message_id, error = %e, "Publish failed for promoted message");
                MessageStore::update_status(
                    &self.pool,
                    message_id,
                    StatusUpdate {
                        status: DeliveryStatus::Failed,
                        error_message: Some(&e.to_string()),
                        failure_type: Some(FailureType::ProducerPublish),
                        source: HistorySource::Worker,
                    },
                )
                .await?;
                Ok(false)
            }
        }
    }
}
