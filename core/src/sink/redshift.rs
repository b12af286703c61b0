use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

use crate::config::WarehouseConfig;
use crate::errors::SinkError;
use crate::sink::Warehouse;

/// Redshift cluster reached over the PostgreSQL wire protocol through a
/// single shared connection.
pub struct RedshiftWarehouse {
    pool: PgPool,
}

impl RedshiftWarehouse {
    /// Opens the connection eagerly so an unreachable warehouse fails startup.
    pub async fn connect(config: &WarehouseConfig) -> Result<Self, SinkError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password);

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .test_before_acquire(true)
            .connect_with(options)
            .await
            .map_err(|e| SinkError::Connection {
                reason: e.to_string(),
            })?;

        info!(host = %config.host, port = config.port, database = %config.database, "Connected to warehouse");
        Ok(Self { pool })
    }
}

#[async_trait]
impl Warehouse for RedshiftWarehouse {
    #[instrument(skip_all)]
    async fn execute(&self, sql: &str) -> Result<u64, SinkError> {
        let result = sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(classify_error)?;
        Ok(result.rows_affected())
    }
}

fn classify_error(err: sqlx::Error) -> SinkError {
    match err {
        sqlx::Error::Database(db) => SinkError::Statement {
            reason: db.to_string(),
        },
        other => SinkError::Connection {
            reason: other.to_string(),
        },
    }
}
