use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create the PostgreSQL pool shared by the API server and the dispatch
/// jobs.
///
/// Every lifecycle write (claims, status updates, history appends) runs a
/// short per-message transaction on this pool. A saturated pool surfaces
/// as an acquire timeout after 5 seconds. Sized via `DB_MAX_CONNECTIONS`.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}
