//! Connection pool plus the transactional boundary.
//!
//! Repositories take `&mut PgConnection`, so the same function runs equally
//! against a pooled connection or inside a transaction handed out by
//! [`Store::run_in_tx`]; the caller decides the boundary, the repository
//! never does.

use crate::config::DatabaseConfig;
use crate::error::{AppError, AppResult};
use futures::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::{PgConnection, PgPool};
use std::time::Duration;

/// Serialization failures under REPEATABLE READ are re-issued this many
/// times before the error is surfaced.
const TX_MAX_ATTEMPTS: u32 = 3;

const PG_SERIALIZATION_FAILURE: &str = "40001";
const PG_DEADLOCK_DETECTED: &str = "40P01";

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(cfg: &DatabaseConfig) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&cfg.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> AppResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Config(format!("migrations failed: {e}")))
    }

    /// Checks out a plain connection for work outside any transaction.
    pub async fn acquire(&self) -> AppResult<PoolConnection<Postgres>> {
        Ok(self.pool.acquire().await?)
    }

    /// Runs `f` inside a REPEATABLE READ transaction, re-issuing the whole
    /// transaction on serialization failure or deadlock, bounded by
    /// [`TX_MAX_ATTEMPTS`].
    pub async fn run_in_tx<T, F>(&self, f: F) -> AppResult<T>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, AppResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut tx = self.pool.begin().await?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
                .execute(&mut *tx)
                .await?;

            match f(&mut *tx).await {
                Ok(value) => match tx.commit().await {
                    Ok(()) => return Ok(value),
                    Err(e) if is_tx_retryable(&e) && attempt < TX_MAX_ATTEMPTS => {
                        tracing::debug!(attempt, error = %e, "retrying transaction after commit conflict");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                },
                Err(err) => {
                    // Rollback failures are not actionable here, the
                    // connection is returned to the pool broken either way.
                    let _ = tx.rollback().await;

                    if let AppError::Database(e) = &err {
                        if is_tx_retryable(e) && attempt < TX_MAX_ATTEMPTS {
                            tracing::debug!(attempt, error = %e, "retrying transaction after serialization failure");
                            continue;
                        }
                    }
                    return Err(err);
                }
            }
        }
    }
}

fn is_tx_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(PG_SERIALIZATION_FAILURE) | Some(PG_DEADLOCK_DETECTED)
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_serialization_class_errors_are_retryable() {
        assert!(!is_tx_retryable(&sqlx::Error::RowNotFound));
        assert!(!is_tx_retryable(&sqlx::Error::PoolClosed));
    }
}
