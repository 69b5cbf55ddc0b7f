//! Postgres storage adapters
//!
//! - `knowledge_items` via SeaORM ([`PgPrimaryStore`])
//! - `item_embeddings` via sqlx + pgvector ([`PgVectorIndex`])
//!
//! Both share one [`DbPool`].

pub mod models;
mod primary;
mod schema;
mod vector;

pub use primary::PgPrimaryStore;
pub use vector::PgVectorIndex;

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// ORM connection plus a raw sqlx pool for vector queries
#[derive(Clone)]
pub struct DbPool {
    orm: DatabaseConnection,
    pg: PgPool,
}

impl DbPool {
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database...");

        let mut opts = ConnectOptions::new(url);
        opts.max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .sqlx_logging(false);

        let orm = Database::connect(opts)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let pg = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| AppError::VectorIndexConnection {
                message: format!("pgvector connection failed: {}", e),
            })?;

        info!("Database connections established");
        Ok(Self { orm, pg })
    }

    pub fn orm(&self) -> &DatabaseConnection {
        &self.orm
    }

    pub fn pg(&self) -> &PgPool {
        &self.pg
    }

    /// Create the extension and both tables if missing.
    pub async fn ensure_schema(&self, dimension: usize) -> Result<()> {
        for stmt in schema::statements(dimension) {
            self.orm.execute_unprepared(&stmt).await?;
        }
        info!(dimension, "Database schema ensured");
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.orm
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Database ping failed: {}", e),
            })?;
        Ok(())
    }
}
