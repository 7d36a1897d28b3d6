//! Per-manager concurrency cap on open problems.

use crate::error::AppResult;
use crate::repositories::problems;
use crate::store::Store;
use crate::types::UserId;

pub struct ManagerLoadService {
    store: Store,
    max_problems_at_time: i64,
}

impl ManagerLoadService {
    /// `max_problems_at_time` is validated at the config layer (1..=30).
    pub fn new(store: Store, max_problems_at_time: i64) -> Self {
        Self {
            store,
            max_problems_at_time,
        }
    }

    pub async fn can_manager_take_problem(&self, manager_id: UserId) -> AppResult<bool> {
        let mut conn = self.store.acquire().await?;
        let count = problems::get_manager_open_problems_count(&mut conn, manager_id).await?;

        Ok(count < self.max_problems_at_time)
    }
}
