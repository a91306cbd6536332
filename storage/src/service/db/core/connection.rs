//! Connection management module
//!
//! Opens the pool for the single configured dialect, retrying with a doubling
//! backoff. An interrupt (Ctrl-C, or any caller-supplied shutdown future)
//! aborts both a pending connect and a pending sleep.

use super::config::{DbServiceConfig, PoolConfig};
use super::dialect::Dialect;
use super::executor::{bind_args, DbExecutor, QueryTracer};
use super::statement::Statement;
use super::transaction::Tx;
use super::types::ConnectionStats;
use crate::tool::error::DbError;
use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::AnyPool;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Shared database pool bound to one dialect
#[derive(Clone)]
pub struct ConnectionManager {
    /// Connection pool
    pool: AnyPool,

    dialect: Dialect,

    tracer: QueryTracer,

    /// Attempts it took to connect
    attempts: u32,
}

impl ConnectionManager {
    /// Connects, aborting on Ctrl-C
    pub async fn connect(config: &DbServiceConfig) -> Result<Self, DbError> {
        Self::connect_until(config, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for interrupt signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Connects, aborting when `shutdown` completes
    ///
    /// The shutdown future is dropped as soon as this returns, so no signal
    /// watcher outlives a successful connect.
    pub async fn connect_until<S>(config: &DbServiceConfig, shutdown: S) -> Result<Self, DbError>
    where
        S: Future<Output = ()>,
    {
        let dialect = config.db_config.dialect()?;
        let url = config.db_config.connection_url()?;
        sqlx::any::install_default_drivers();

        let pool_config = &config.pool_config;
        let options = pool_options(pool_config);
        let tracer = QueryTracer {
            enable_query_logging: config.query_config.enable_query_logging,
            slow_query_threshold: Duration::from_millis(config.query_config.slow_query_threshold_ms),
        };

        tokio::pin!(shutdown);
        let mut delay = pool_config.initial_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!("Connecting to {} database (attempt {})", dialect, attempt);

            let result = tokio::select! {
                result = options.clone().connect(&url) => result,
                _ = &mut shutdown => {
                    warn!("Database connect interrupted");
                    return Err(DbError::Interrupted);
                }
            };

            match result {
                Ok(pool) => {
                    info!("Connected to {} database after {} attempt(s)", dialect, attempt);
                    return Ok(Self {
                        pool,
                        dialect,
                        tracer,
                        attempts: attempt,
                    });
                }
                Err(e) if attempt >= pool_config.connect_attempts => {
                    error!("Failed to connect after {} attempts: {}", attempt, e);
                    return Err(DbError::Connection {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {} failed, retrying in {:?}: {}",
                        attempt, delay, e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut shutdown => {
                            warn!("Database connect interrupted while waiting to retry");
                            return Err(DbError::Interrupted);
                        }
                    }
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Begins a native transaction
    pub async fn begin(&self) -> Result<Tx, DbError> {
        let native = self.pool.begin().await?;
        Ok(Tx::new(self.dialect, self.tracer.clone(), native))
    }

    /// Perform health check
    pub async fn health_check(&self) -> Result<bool, DbError> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                debug!("Database health check passed");
                Ok(true)
            }
            Err(e) => {
                error!("Database health check failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            dialect: Some(self.dialect),
            size: self.pool.size(),
            idle: self.pool.num_idle() as u32,
            connect_attempts: self.attempts,
        }
    }

    /// Gracefully close all connections
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }
}

fn pool_options(config: &PoolConfig) -> AnyPoolOptions {
    AnyPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
}

#[async_trait]
impl DbExecutor for ConnectionManager {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn transaction(&self) -> Option<&Tx> {
        None
    }

    async fn execute(&self, stmt: &Statement) -> Result<u64, DbError> {
        self.tracer.log_query(stmt);
        let started = Instant::now();
        let result = bind_args(stmt).execute(&self.pool).await?;
        self.tracer.check_slow_query(&stmt.sql, started);
        Ok(result.rows_affected())
    }

    async fn fetch_all(&self, stmt: &Statement) -> Result<Vec<AnyRow>, DbError> {
        self.tracer.log_query(stmt);
        let started = Instant::now();
        let rows = bind_args(stmt).fetch_all(&self.pool).await?;
        self.tracer.check_slow_query(&stmt.sql, started);
        Ok(rows)
    }

    async fn fetch_optional(&self, stmt: &Statement) -> Result<Option<AnyRow>, DbError> {
        self.tracer.log_query(stmt);
        Ok(bind_args(stmt).fetch_optional(&self.pool).await?)
    }

    async fn execute_script(&self, script: &str) -> Result<(), DbError> {
        sqlx::Executor::execute(&self.pool, script).await?;
        Ok(())
    }
}
