//! Database connection pool and schema migrations.
//!
//! Uses PostgreSQL with sqlx. Stores and repositories take a clone of the pool.

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Instant;

use crate::config::DatabaseConfig;
use crate::error::{ErrorCode, InspectorError, Result};

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| {
                InspectorError::with_internal(
                    ErrorCode::DatabaseConnectionFailed,
                    "Failed to connect to database",
                    e.to_string(),
                )
            })?;

        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database pool created"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending migrations from `migrations/`.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| InspectorError::from(sqlx::Error::Migrate(Box::new(e))))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// Round-trip a trivial query, returning the latency.
    pub async fn ping(&self) -> Result<std::time::Duration> {
        let started = Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(started.elapsed())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
