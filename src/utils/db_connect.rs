// src/utils/db_connect.rs

use anyhow::{Context, Result};
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use log::info;
use std::time::Duration;
use tokio_postgres::{Config, NoTls};

use crate::utils::config::DatabaseConfig;

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

fn build_pg_config(settings: &DatabaseConfig) -> Config {
    let mut config = Config::new();
    config
        .host(&settings.host)
        .port(settings.port)
        .dbname(&settings.dbname)
        .user(&settings.user)
        .password(&settings.password);
    config.application_name("immitracker_templates");
    config.connect_timeout(Duration::from_secs(10));
    config
}

/// Builds the connection pool and checks it with `SELECT 1`.
pub async fn connect(settings: &DatabaseConfig) -> Result<PgPool> {
    info!(
        "Connecting to PostgreSQL at {}:{}/{}...",
        settings.host, settings.port, settings.dbname
    );
    let manager = PostgresConnectionManager::new(build_pg_config(settings), NoTls);

    let pool = Pool::builder()
        .max_size(settings.pool_size)
        .min_idle(Some(1))
        .idle_timeout(Some(Duration::from_secs(180)))
        .connection_timeout(Duration::from_secs(15))
        .build(manager)
        .await
        .context("Failed to build database connection pool")?;

    let conn = pool
        .get()
        .await
        .context("Failed to get test connection from pool")?;
    conn.query_one("SELECT 1", &[])
        .await
        .context("Test query 'SELECT 1' failed")?;
    drop(conn);
    info!("Database connection pool initialized successfully.");
    Ok(pool)
}

/// (connections, idle connections) as reported by the pool.
pub fn get_pool_status(pool: &PgPool) -> (u32, u32) {
    let state = pool.state();
    (state.connections, state.idle_connections)
}
