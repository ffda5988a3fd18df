use std::sync::Arc;

use courier_common::clock::SystemClock;
use courier_common::config::AppConfig;
use courier_common::queue::RedisDeliveryQueue;
use courier_common::types::FailureType;
use courier_common::{db, redis_pool};
use courier_dispatch::retry::{RetryCoordinator, RetrySettings};
use courier_dispatch::scheduler::{MessageScheduler, SchedulerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_dispatch=info,courier_common=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier dispatch starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;

    // Run migrations
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    // Connect to the broker
    let redis = redis_pool::create_redis_pool(&config.redis_url).await?;
    let queue = RedisDeliveryQueue::new(redis);

    let clock = Arc::new(SystemClock);

    let coordinator = RetryCoordinator::new(
        pool.clone(),
        queue.clone(),
        config.topics.clone(),
        clock.clone(),
        RetrySettings::from_config(&config),
    );
    let scheduler = MessageScheduler::new(
        pool,
        queue,
        config.topics.clone(),
        clock,
        SchedulerSettings::from_config(&config),
    );

    let producer_retries = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run(FailureType::ProducerPublish).await })
    };
    let consumer_retries = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run(FailureType::ConsumerProcessing).await })
    };
    let stale_sweep = tokio::spawn(async move { coordinator.run_stale_sweep().await });
    let promoter = tokio::spawn(async move { scheduler.run().await });

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        _ = producer_retries => tracing::error!("Producer retry coordinator exited"),
        _ = consumer_retries => tracing::error!("Consumer retry coordinator exited"),
        _ = stale_sweep => tracing::error!("Stale-claim sweep exited"),
        _ = promoter => tracing::error!("Scheduler exited"),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Courier dispatch stopped.");
    Ok(())
}
