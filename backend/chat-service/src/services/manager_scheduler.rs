//! Periodic matcher of idle managers to unassigned problems.
//!
//! Ordering is FCFS on problems and FIFO on managers. A crash between taking
//! a manager from the pool and the assignment leaks that manager's slot for
//! one tick; managers rejoin by re-signaling free hands.

use crate::error::{AppError, AppResult};
use crate::models::Problem;
use crate::outbox::jobs::manager_assigned_to_problem;
use crate::outbox::OutboxService;
use crate::repositories::{messages, problems};
use crate::services::manager_pool::ManagerPool;
use crate::store::Store;
use crate::types::{RequestId, UserId};
use chrono::Utc;
use sqlx::PgConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct ManagerScheduler {
    store: Store,
    pool: Arc<ManagerPool>,
    outbox: Arc<OutboxService>,
    idle_duration: Duration,
}

impl ManagerScheduler {
    pub fn new(
        store: Store,
        pool: Arc<ManagerPool>,
        outbox: Arc<OutboxService>,
        idle_duration: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            outbox,
            idle_duration,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("manager scheduler started");

        loop {
            if self.pool.size() > 0 {
                if let Err(e) = self.assign_managers().await {
                    tracing::warn!(error = %e, "assign managers");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("manager scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(self.idle_duration) => {}
            }
        }
    }

    async fn assign_managers(&self) -> AppResult<()> {
        let problem_ids = {
            let mut conn = self.store.acquire().await?;
            problems::problems_without_manager(&mut conn, self.pool.size() as i64).await?
        };

        for problem_id in problem_ids {
            let manager_id = match self.pool.get() {
                Ok(manager_id) => manager_id,
                Err(AppError::NoAvailableManagers) => return Ok(()),
                Err(e) => return Err(e),
            };

            let problem = {
                let mut conn = self.store.acquire().await?;
                match problems::assign_manager_to_problem(&mut conn, manager_id, problem_id).await {
                    Ok(problem) => problem,
                    Err(AppError::NotFound(_)) => {
                        // The problem vanished under us (e.g. just resolved);
                        // skip it, the manager slot comes back next signal.
                        tracing::warn!(problem_id = %problem_id, "problem gone before assignment");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };

            tracing::info!(
                problem_id = %problem.id,
                manager_id = %manager_id,
                "manager assigned to problem"
            );

            self.notify_client_about_assignment(&problem, manager_id)
                .await?;
        }

        Ok(())
    }

    /// One transaction: write the "you have a manager" service message and
    /// enqueue the fan-out job carrying the original author.
    async fn notify_client_about_assignment(
        &self,
        problem: &Problem,
        manager_id: UserId,
    ) -> AppResult<()> {
        let initial = {
            let mut conn = self.store.acquire().await?;
            messages::get_initial_message_by_problem_id(&mut conn, problem.id).await?
        };

        let client_id = initial
            .author_id
            .ok_or_else(|| AppError::Internal("initial problem message has no author".into()))?;

        let problem_id = problem.id;
        let chat_id = problem.chat_id;
        let outbox = Arc::clone(&self.outbox);
        let body = assigned_message_text(manager_id);

        self.store
            .run_in_tx(move |conn: &mut PgConnection| {
                let outbox = Arc::clone(&outbox);
                let body = body.clone();
                Box::pin(async move {
                    let msg = messages::create_service_client_visible(
                        conn,
                        RequestId::new(),
                        problem_id,
                        chat_id,
                        &body,
                    )
                    .await?;

                    let payload =
                        manager_assigned_to_problem::marshal_payload(&manager_assigned_to_problem::Payload {
                            message_id: msg.id,
                            manager_id,
                            client_id,
                        })?;
                    outbox
                        .put(conn, manager_assigned_to_problem::NAME, &payload, Utc::now())
                        .await?;

                    Ok(())
                })
            })
            .await
    }
}

fn assigned_message_text(manager_id: UserId) -> String {
    format!("manager {manager_id} will answer you")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigned_message_carries_the_manager_id() {
        let manager_id = UserId::new();
        assert_eq!(
            assigned_message_text(manager_id),
            format!("manager {manager_id} will answer you")
        );
    }
}
