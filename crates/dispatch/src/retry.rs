//! Retry coordinator: reclaims FAILED messages and republishes them.
//!
//! One coordinator instance runs per failure type. Each tick pages through
//! eligible FAILED rows and processes them one at a time; the conditional
//! claim in the store means any number of coordinator replicas can run
//! concurrently and a message is still attempted at most once per pass.
//!
//! The claim transaction commits before the broker publish, and the
//! publish outcome is recorded in a fresh transaction afterwards. A worker
//! that dies between the two leaves the row RETRYING; the stale-claim
//! sweep demotes such rows back to FAILED so later passes can retry them.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use courier_common::clock::Clock;
use courier_common::config::{AppConfig, Topics};
use courier_common::error::AppError;
use courier_common::queue::DeliveryQueue;
use courier_common::types::{DeliveryStatus, FailureType, HistorySource};

use crate::store::MessageStore;
use crate::{dlq, history, producer};

#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Retry ceiling; at or past it a message is dead-lettered instead.
    pub max_retries: i32,
    /// Minimum age of a FAILED row before it becomes eligible, in seconds.
    pub retry_delay_secs: i64,
    /// Eligibility page size.
    pub batch_size: i64,
    /// Interval between ticks.
    pub tick_interval: Duration,
    /// Age after which an unresolved RETRYING claim is considered stale,
    /// in seconds.
    pub retrying_expiry_secs: i64,
}

impl RetrySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay_secs: config.retry_delay_secs,
            batch_size: config.retry_batch_size,
            tick_interval: Duration::from_secs(config.retry_tick_interval_secs),
            retrying_expiry_secs: config.retrying_expiry_secs,
        }
    }
}

/// What happened to a single reclaimed message.
#[derive(Debug)]
enum ReclaimOutcome {
    /// Claimed, republished, requeued as PENDING.
    Republished,
    /// The claim found the row no longer FAILED; nothing was done.
    Skipped,
    /// The attempt failed; the row is FAILED again with the count bumped.
    Failed { retry_count: i32 },
    /// The post-claim ceiling check released the claim untouched.
    AtCeiling,
}

/// Counters for one coordinator tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub republished: u32,
    pub failed: u32,
    pub dead_lettered: u32,
    pub skipped: u32,
    pub errors: u32,
}

#[derive(Clone)]
pub struct RetryCoordinator<Q> {
    pool: PgPool,
    queue: Q,
    topics: Topics,
    clock: Arc<dyn Clock>,
    settings: RetrySettings,
}

impl<Q: DeliveryQueue> RetryCoordinator<Q> {
    pub fn new(
        pool: PgPool,
        queue: Q,
        topics: Topics,
        clock: Arc<dyn Clock>,
        settings: RetrySettings,
    ) -> Self {
        Self {
            pool,
            queue,
            topics,
            clock,
            settings,
        }
    }

    /// Tick forever for one failure type. A failed tick (store unavailable)
    /// is logged and the loop waits for the next interval.
    pub async fn run(&self, failure_type: FailureType) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        tracing::info!(
            failure_type = %failure_type,
            interval_secs = self.settings.tick_interval.as_secs(),
            "Retry coordinator started"
        );
        loop {
            interval.tick().await;
            match self.tick(failure_type).await {
                Ok(stats) if stats != TickStats::default() => {
                    tracing::info!(failure_type = %failure_type, ?stats, "Retry tick complete");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(failure_type = %failure_type, error = %e, "Retry tick aborted");
                }
            }
        }
    }

    /// Demote stale RETRYING claims forever, on the coordinator interval.
    pub async fn run_stale_sweep(&self) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        tracing::info!(
            expiry_secs = self.settings.retrying_expiry_secs,
            "Stale-claim sweep started"
        );
        loop {
            interval.tick().await;
            if let Err(e) = self.sweep_stale_claims().await {
                tracing::error!(error = %e, "Stale-claim sweep failed");
            }
        }
    }

    /// One pass over all currently eligible messages for `failure_type`.
    ///
    /// Pages until a short page. Per-message failures are logged and do
    /// not stop the pass; a failed page query aborts it.
    pub async fn tick(&self, failure_type: FailureType) -> Result<TickStats, AppError> {
        let cutoff = self.clock.now() - chrono::Duration::seconds(self.settings.retry_delay_secs);
        let mut stats = TickStats::default();

        loop {
            let page = MessageStore::find_failed_for_retry(
                &self.pool,
                failure_type,
                self.settings.max_retries,
                cutoff,
                self.settings.batch_size,
            )
            .await?;
            let page_len = page.len();
            let errors_before = stats.errors;

            for message in page {
                // The count may have moved since the page was fetched.
                if message.retry_count >= self.settings.max_retries {
                    self.try_dead_letter(&message.message_id, &mut stats).await;
                    continue;
                }

                match self.reclaim_message(&message.message_id).await {
                    Ok(ReclaimOutcome::Republished) => stats.republished += 1,
                    Ok(ReclaimOutcome::Skipped) => stats.skipped += 1,
                    Ok(ReclaimOutcome::AtCeiling) => {
                        self.try_dead_letter(&message.message_id, &mut stats).await;
                    }
                    Ok(ReclaimOutcome::Failed { retry_count }) => {
                        stats.failed += 1;
                        if retry_count >= self.settings.max_retries {
                            self.try_dead_letter(&message.message_id, &mut stats).await;
                        }
                    }
                    Err(e) => {
                        stats.errors += 1;
                        tracing::error!(
                            message_id = %message.message_id,
                            error = %e,
                            "Retry attempt errored"
                        );
                    }
                }
            }

            if page_len < self.settings.batch_size as usize {
                break;
            }
            // Every row in a full page errored in place; stop rather than
            // spin on the same page until the store recovers.
            if stats.errors - errors_before == page_len as u32 {
                tracing::warn!(failure_type = %failure_type, "Full page of errors, ending tick early");
                break;
            }
        }

        Ok(stats)
    }

    /// Demote RETRYING rows older than the expiry back to FAILED. Their
    /// retry count is untouched; the claimed attempt never reached an
    /// outcome.
    pub async fn sweep_stale_claims(&self) -> Result<u64, AppError> {
        let cutoff =
            self.clock.now() - chrono::Duration::seconds(self.settings.retrying_expiry_secs);
        let demoted = MessageStore::demote_stale_retrying(&self.pool, cutoff).await?;
        if demoted > 0 {
            tracing::warn!(demoted, "Demoted stale RETRYING claims back to FAILED");
        }
        Ok(demoted)
    }

    /// Claim and republish one message.
    ///
    /// The claim, the re-fetch, and the RETRYING history entry share one
    /// transaction that commits before the publish; the publish outcome is
    /// then recorded in a transaction of its own.
    async fn reclaim_message(&self, message_id: &str) -> Result<ReclaimOutcome, AppError> {
        let mut tx = MessageStore::begin(&self.pool).await?;

        if MessageStore::claim_failed_for_retry(&mut tx, message_id).await? == 0 {
            tx.rollback().await?;
            tracing::debug!(message_id, "Message no longer FAILED, skipping reclaim");
            return Ok(ReclaimOutcome::Skipped);
        }

        // The claim was a raw conditional update; re-fetch for the row it
        // actually produced.
        let message = MessageStore::get_by_message_id(&mut *tx, message_id).await?;

        if message.retry_count >= self.settings.max_retries {
            MessageStore::release_claim(&mut tx, message_id).await?;
            tx.commit().await?;
            return Ok(ReclaimOutcome::AtCeiling);
        }

        let payload = match producer::serialize_payload(&message) {
            Ok(payload) => payload,
            Err(e) => {
                let failed =
                    MessageStore::record_failed_attempt(&mut tx, message_id, &e.to_string())
                        .await?;
                tx.commit().await?;
                tracing::error!(message_id, error = %e, "Retry payload serialization failed");
                return Ok(ReclaimOutcome::Failed {
                    retry_count: failed.retry_count,
                });
            }
        };

        history::append(
            &mut *tx,
            message_id,
            DeliveryStatus::Retrying,
            None,
            message.retry_count,
            HistorySource::Worker,
        )
        .await?;

        tx.commit().await?;

        // Publish only after the claim is durable.
        let destination = self.topics.for_channel(message.channel);
        match self.queue.publish(destination, message_id, &payload).await {
            Ok(()) => {
                MessageStore::requeue_after_retry(&self.pool, message_id).await?;
                tracing::info!(message_id, destination, "Republished message for retry");
                Ok(ReclaimOutcome::Republished)
            }
            Err(e) => {
                let mut tx = MessageStore::begin(&self.pool).await?;
                let failed =
                    MessageStore::record_failed_attempt(&mut tx, message_id, &e.to_string())
                        .await?;
                tx.commit().await?;
                tracing::warn!(
                    message_id,
                    retry_count = failed.retry_count,
                    error = %e,
                    "Retry publish failed"
                );
                Ok(ReclaimOutcome::Failed {
                    retry_count: failed.retry_count,
                })
            }
        }
    }

    async fn try_dead_letter(&self, message_id: &str, stats: &mut TickStats) {
        match dlq::route_to_dead_letter(&self.pool, &self.queue, &self.topics, message_id).await {
            Ok(true) => stats.dead_lettered += 1,
            Ok(false) => stats.skipped += 1,
            Err(e) => {
                stats.errors += 1;
                tracing::error!(message_id, error = %e, "Dead-letter routing errored");
            }
        }
    }
}
