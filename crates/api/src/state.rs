//! Shared application state for the Axum API server.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use courier_common::clock::SystemClock;
use courier_common::config::AppConfig;
use courier_common::queue::RedisDeliveryQueue;
use courier_dispatch::producer::MessageProducer;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub producer: MessageProducer<RedisDeliveryQueue>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(pool: PgPool, redis: ConnectionManager, config: AppConfig) -> Self {
        let producer = MessageProducer::new(
            pool.clone(),
            RedisDeliveryQueue::new(redis),
            config.topics.clone(),
            Arc::new(SystemClock),
        );
        Self {
            pool,
            producer,
            config,
        }
    }
}
