//! Transactional outbox: durable side-effect intents executed at least once.
//!
//! A job row becomes visible together with the business change that enqueued
//! it (same transaction), then any worker may lease it. Retrying is implicit:
//! a job whose handler failed simply keeps its row, and the lease expiry
//! makes it runnable again.

pub mod jobs;

use crate::config::OutboxConfig;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::ReservedJob;
use crate::repositories::jobs as jobs_repo;
use crate::store::Store;
use crate::types::JobId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const REASON_NOT_REGISTERED: &str = "not_registered";
const REASON_ATTEMPTS_EXCEEDED: &str = "attempts_exceeded";

pub const DEFAULT_MAX_ATTEMPTS: i32 = 30;
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// A registered outbox job. Handlers must be idempotent: delivery is
/// at-least-once and replays de-duplicate on the persisted state they read.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn max_attempts(&self) -> i32 {
        DEFAULT_MAX_ATTEMPTS
    }

    fn execution_timeout(&self) -> Duration {
        DEFAULT_EXECUTION_TIMEOUT
    }

    async fn handle(&self, payload: &str) -> AppResult<()>;
}

pub struct OutboxService {
    store: Store,
    workers: usize,
    idle_time: Duration,
    reserve_for: chrono::Duration,
    registry: Mutex<HashMap<&'static str, Arc<dyn JobHandler>>>,
}

impl OutboxService {
    pub fn new(store: Store, cfg: &OutboxConfig) -> Self {
        Self {
            store,
            workers: cfg.workers,
            idle_time: cfg.idle_time(),
            reserve_for: chrono::Duration::from_std(cfg.reserve_for())
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a handler under its name; duplicate registration is a
    /// startup-fatal conflict.
    pub fn register_job(&self, handler: Arc<dyn JobHandler>) -> AppResult<()> {
        let mut registry = self.registry.lock().expect("outbox registry poisoned");

        let name = handler.name();
        if registry.contains_key(name) {
            return Err(AppError::JobAlreadyRegistered(name.to_string()));
        }
        registry.insert(name, handler);

        Ok(())
    }

    /// Enqueues a job on the caller's connection. Call it on the same
    /// transaction that commits the business change so the job becomes
    /// visible exactly when the change does.
    pub async fn put(
        &self,
        conn: &mut PgConnection,
        name: &str,
        payload: &str,
        available_at: DateTime<Utc>,
    ) -> AppResult<JobId> {
        jobs_repo::create_job(conn, name, payload, available_at).await
    }

    /// Runs the worker loops until the token is cancelled. A worker that is
    /// mid-handler finishes that job (bounded by the handler's execution
    /// timeout) before exiting.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut workers = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let svc = Arc::clone(&self);
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                svc.worker_loop(worker_id + 1, cancel).await;
            }));
        }

        for worker in workers {
            let _ = worker.await;
        }
    }

    async fn worker_loop(&self, worker_id: usize, cancel: CancellationToken) {
        tracing::info!(worker_id, "outbox worker started");

        loop {
            if let Err(e) = self.execute_available_jobs(worker_id, &cancel).await {
                tracing::warn!(worker_id, error = %e, "outbox execute error");
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(worker_id, "outbox worker stopped");
                    return;
                }
                _ = tokio::time::sleep(self.idle_time) => {}
            }
        }
    }

    /// Drains runnable jobs until none is left or cancellation is requested.
    async fn execute_available_jobs(
        &self,
        worker_id: usize,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            if !self.execute_one(worker_id).await? {
                return Ok(());
            }
        }
    }

    /// Leases and runs one job. Returns false when the queue had nothing
    /// runnable.
    async fn execute_one(&self, worker_id: usize) -> AppResult<bool> {
        let job = {
            let mut conn = self.store.acquire().await?;
            let until = Utc::now() + self.reserve_for;
            match jobs_repo::find_and_reserve_job(&mut conn, until).await? {
                Some(job) => job,
                None => return Ok(false),
            }
        };

        tracing::info!(
            worker_id,
            job_name = %job.name,
            job_id = %job.id,
            attempts = job.attempts,
            "executing job"
        );

        let handler = {
            let registry = self.registry.lock().expect("outbox registry poisoned");
            registry.get(job.name.as_str()).cloned()
        };

        let Some(handler) = handler else {
            self.dead_letter(&job, REASON_NOT_REGISTERED).await?;
            return Ok(true);
        };

        let outcome =
            tokio::time::timeout(handler.execution_timeout(), handler.handle(&job.payload)).await;

        match outcome {
            Ok(Ok(())) => {
                metrics::OUTBOX_JOBS_EXECUTED.inc();

                // The handler already took effect; a failed delete only means
                // one extra (idempotent) replay after the lease expires.
                let mut conn = self.store.acquire().await?;
                if let Err(e) = jobs_repo::delete_job(&mut conn, job.id).await {
                    tracing::warn!(job_id = %job.id, error = %e, "failed to delete finished job");
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job.id, job_name = %job.name, error = %e, "job handler failed");
                self.handle_failure(&job, handler.max_attempts()).await?;
            }
            Err(_) => {
                tracing::warn!(job_id = %job.id, job_name = %job.name, "job handler timed out");
                self.handle_failure(&job, handler.max_attempts()).await?;
            }
        }

        Ok(true)
    }

    async fn handle_failure(&self, job: &ReservedJob, max_attempts: i32) -> AppResult<()> {
        metrics::OUTBOX_JOBS_FAILED.inc();

        if job.attempts >= max_attempts {
            return self.dead_letter(job, REASON_ATTEMPTS_EXCEEDED).await;
        }

        // Leave the row in place: the lease expires at reserved_until and
        // another worker picks the job up.
        Ok(())
    }

    /// Moves the job into `failed_jobs` and removes it from the live queue
    /// in one transaction.
    async fn dead_letter(&self, job: &ReservedJob, reason: &'static str) -> AppResult<()> {
        tracing::warn!(job_id = %job.id, job_name = %job.name, reason, "dead-lettering job");

        let name = job.name.clone();
        let payload = job.payload.clone();
        let job_id = job.id;

        self.store
            .run_in_tx(move |conn: &mut PgConnection| {
                let name = name.clone();
                let payload = payload.clone();
                Box::pin(async move {
                    jobs_repo::create_failed_job(conn, &name, &payload, reason).await?;
                    jobs_repo::delete_job(conn, job_id).await?;
                    Ok(())
                })
            })
            .await?;

        metrics::OUTBOX_JOBS_DEAD_LETTERED.inc();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    struct NoopJob;

    #[async_trait]
    impl JobHandler for NoopJob {
        fn name(&self) -> &'static str {
            "noop"
        }

        async fn handle(&self, _payload: &str) -> AppResult<()> {
            Ok(())
        }
    }

    struct TunedJob;

    #[async_trait]
    impl JobHandler for TunedJob {
        fn name(&self) -> &'static str {
            "tuned"
        }

        fn max_attempts(&self) -> i32 {
            5
        }

        fn execution_timeout(&self) -> Duration {
            Duration::from_secs(10)
        }

        async fn handle(&self, _payload: &str) -> AppResult<()> {
            Ok(())
        }
    }

    fn service() -> OutboxService {
        let pool = PgPoolOptions::new().connect_lazy("postgres://localhost/test").unwrap();
        OutboxService::new(
            Store::with_pool(pool),
            &OutboxConfig {
                workers: 2,
                idle_time_ms: 500,
                reserve_for_secs: 60,
            },
        )
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let svc = service();

        svc.register_job(Arc::new(NoopJob)).unwrap();
        assert!(matches!(
            svc.register_job(Arc::new(NoopJob)),
            Err(AppError::JobAlreadyRegistered(name)) if name == "noop"
        ));
    }

    #[test]
    fn handler_defaults_and_overrides() {
        assert_eq!(NoopJob.max_attempts(), DEFAULT_MAX_ATTEMPTS);
        assert_eq!(NoopJob.execution_timeout(), DEFAULT_EXECUTION_TIMEOUT);
        assert_eq!(TunedJob.max_attempts(), 5);
        assert_eq!(TunedJob.execution_timeout(), Duration::from_secs(10));
    }
}
