use serde::Deserialize;

use crate::types::Channel;

/// Per-channel delivery destinations on the broker.
///
/// The dead-letter destination for a channel is derived by appending `:dlq`
/// to its delivery topic, so the two can never drift apart in config.
#[derive(Debug, Clone, Deserialize)]
pub struct Topics {
    pub email: String,
    pub whatsapp: String,
}

impl Topics {
    /// Delivery destination for a channel.
    pub fn for_channel(&self, channel: Channel) -> &str {
        match channel {
            Channel::Email => &self.email,
            Channel::WhatsApp => &self.whatsapp,
        }
    }

    /// Dead-letter destination for a channel.
    pub fn dlq_for_channel(&self, channel: Channel) -> String {
        format!("{}:dlq", self.for_channel(channel))
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum retry attempts before a message is routed to the DLQ (default: 3)
    pub max_retries: i32,

    /// Minimum age of a FAILED message before it becomes eligible for reclaim,
    /// in seconds (default: 300)
    pub retry_delay_secs: i64,

    /// Page size for the retry coordinator's eligibility scan (default: 50)
    pub retry_batch_size: i64,

    /// Page size for the scheduled-message promoter (default: 100)
    pub schedule_batch_size: i64,

    /// Retry coordinator tick interval in seconds (default: 300)
    pub retry_tick_interval_secs: u64,

    /// Scheduler tick interval in seconds (default: 60)
    pub schedule_tick_interval_secs: u64,

    /// Age after which an unfinished RETRYING claim is demoted back to FAILED,
    /// in seconds (default: 900)
    pub retrying_expiry_secs: i64,

    /// Broker destinations per channel
    pub topics: Topics,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// API server port (default: 3000)
    pub api_port: u16,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            max_retries: parse_var("MAX_RETRIES", "3")?,
            retry_delay_secs: parse_var("RETRY_DELAY_SECS", "300")?,
            retry_batch_size: parse_var("RETRY_BATCH_SIZE", "50")?,
            schedule_batch_size: parse_var("SCHEDULE_BATCH_SIZE", "100")?,
            retry_tick_interval_secs: parse_var("RETRY_TICK_INTERVAL_SECS", "300")?,
            schedule_tick_interval_secs: parse_var("SCHEDULE_TICK_INTERVAL_SECS", "60")?,
            retrying_expiry_secs: parse_var("RETRYING_EXPIRY_SECS", "900")?,
            topics: Topics {
                email: std::env::var("EMAIL_TOPIC")
                    .unwrap_or_else(|_| "notifications:email".to_string()),
                whatsapp: std::env::var("WHATSAPP_TOPIC")
                    .unwrap_or_else(|_| "notifications:whatsapp".to_string()),
            },
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "20")?,
            api_port: parse_var("API_PORT", "3000")?,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a valid {}", name, std::any::type_name::<T>()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlq_destination_derived_from_topic() {
        let topics = Topics {
            email: "notifications:email".to_string(),
            whatsapp: "notifications:whatsapp".to_string(),
        };
        assert_eq!(topics.for_channel(Channel::Email), "notifications:email");
        assert_eq!(
            topics.dlq_for_channel(Channel::WhatsApp),
            "notifications:whatsapp:dlq"
        );
    }
}
