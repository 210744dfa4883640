//! Timeout reclaimer
//!
//! Recovers from workers that died mid-unit. With `cutoff = now - timeout`,
//! HELD locks registered before the cutoff are released and PROCESSING
//! records, json units and tasks started before it go back to INITIAL.
//! FAILED json units and tasks with retries left are re-queued once their
//! last attempt is older than the retry delay.
//!
//! The comparison is strict, so a unit is reset exactly when
//! `now - started_at > timeout`. Running a sweep twice is a no-op the second
//! time.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use collector_common::TenantId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use super::store::{ChangeDataStore, LockStore, TaskStore};
use crate::worker::PeriodicJob;

pub const DEFAULT_RECLAIM_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;
pub const DEFAULT_RECLAIMER_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    pub timeout: Duration,
    pub retry_delay: Duration,
    pub interval: Duration,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_RECLAIM_TIMEOUT_SECS),
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            interval: Duration::from_secs(DEFAULT_RECLAIMER_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub locks_released: u64,
    pub records_reset: u64,
    pub json_reset: u64,
    pub tasks_reset: u64,
    pub json_requeued: u64,
    pub tasks_requeued: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.locks_released
            + self.records_reset
            + self.json_reset
            + self.tasks_reset
            + self.json_requeued
            + self.tasks_requeued
    }
}

pub struct TimeoutReclaimer {
    tenant: TenantId,
    locks: Arc<dyn LockStore>,
    tasks: Arc<dyn TaskStore>,
    data: Arc<dyn ChangeDataStore>,
    config: ReclaimerConfig,
}

impl TimeoutReclaimer {
    pub fn new(
        tenant: TenantId,
        locks: Arc<dyn LockStore>,
        tasks: Arc<dyn TaskStore>,
        data: Arc<dyn ChangeDataStore>,
        config: ReclaimerConfig,
    ) -> Self {
        Self {
            tenant,
            locks,
            tasks,
            data,
            config,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    #[instrument(skip(self), fields(tenant_id = %self.tenant))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let tenant = &self.tenant;
        let cutoff = now
            - chrono::Duration::from_std(self.config.timeout)
                .context("Reclaim timeout out of range")?;
        let retry_cutoff = now
            - chrono::Duration::from_std(self.config.retry_delay)
                .context("Retry delay out of range")?;

        let report = SweepReport {
            locks_released: self
                .locks
                .release_expired_locks(tenant, cutoff)
                .await
                .context("Failed to release expired locks")?,
            records_reset: self
                .data
                .reset_stale_records(tenant, cutoff)
                .await
                .context("Failed to reset stale records")?,
            json_reset: self
                .data
                .reset_stale_json(tenant, cutoff)
                .await
                .context("Failed to reset stale json units")?,
            tasks_reset: self
                .tasks
                .reset_stale_tasks(tenant, cutoff)
                .await
                .context("Failed to reset stale tasks")?,
            json_requeued: self
                .data
                .requeue_failed_json(tenant, retry_cutoff)
                .await
                .context("Failed to requeue failed json units")?,
            tasks_requeued: self
                .tasks
                .requeue_failed_tasks(tenant, retry_cutoff)
                .await
                .context("Failed to requeue failed tasks")?,
        };

        if report.total() > 0 {
            info!(
                locks_released = report.locks_released,
                records_reset = report.records_reset,
                json_reset = report.json_reset,
                tasks_reset = report.tasks_reset,
                json_requeued = report.json_requeued,
                tasks_requeued = report.tasks_requeued,
                "Reclaimed stale work"
            );
        }

        Ok(report)
    }
}

#[async_trait]
impl PeriodicJob for TimeoutReclaimer {
    fn name(&self) -> String {
        format!("reclaimer-{}", self.tenant)
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn run_once(&self) -> Result<()> {
        self.sweep().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::lock::{LockManager, LockRequest};
    use crate::collector::types::{LockStatus, ScheduledTask, UnitStatus};
    use crate::db::MemoryCollectorStore;
    use collector_common::ResourceId;
    use proptest::prelude::*;
    use serde_json::json;

    fn tenant() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    fn reclaimer(store: Arc<MemoryCollectorStore>, timeout_secs: u64) -> TimeoutReclaimer {
        TimeoutReclaimer::new(
            tenant(),
            store.clone(),
            store.clone(),
            store,
            ReclaimerConfig {
                timeout: Duration::from_secs(timeout_secs),
                retry_delay: Duration::from_secs(timeout_secs),
                interval: Duration::from_secs(1),
            },
        )
    }

    async fn processing_task(store: &MemoryCollectorStore) -> ScheduledTask {
        let task = ScheduledTask::new(
            tenant(),
            "t-1",
            ResourceId::from("1001"),
            "claims-sync",
            "CLAIM",
            "55",
            json!({}),
        );
        store.insert_task_if_absent(&task).await.unwrap();
        store.claim_task(&tenant(), "t-1").await.unwrap();
        store.get_task(&tenant(), "t-1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_reset_only_strictly_past_timeout() {
        let store = Arc::new(MemoryCollectorStore::new());
        let reclaimer = reclaimer(store.clone(), 60);
        let task = processing_task(&store).await;
        let started = task.started_at.unwrap();

        let at_boundary = reclaimer
            .sweep_at(started + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(at_boundary.tasks_reset, 0);

        let past = reclaimer
            .sweep_at(started + chrono::Duration::seconds(60) + chrono::Duration::milliseconds(1))
            .await
            .unwrap();
        assert_eq!(past.tasks_reset, 1);

        let task = store.get_task(&tenant(), "t-1").await.unwrap().unwrap();
        assert_eq!(task.status, UnitStatus::Initial);
        assert!(task.started_at.is_none());

        let again = reclaimer
            .sweep_at(started + chrono::Duration::seconds(120))
            .await
            .unwrap();
        assert_eq!(again, SweepReport::default());
    }

    #[tokio::test]
    async fn test_expired_locks_released() {
        let store = Arc::new(MemoryCollectorStore::new());
        let locks = LockManager::with_owner(store.clone(), "dead-worker");
        let lock = locks
            .acquire(&tenant(), LockRequest::unit("CLAIM", "55"))
            .await
            .unwrap()
            .unwrap();

        let reclaimer = reclaimer(store.clone(), 30);
        let report = reclaimer
            .sweep_at(lock.registered_at + chrono::Duration::seconds(31))
            .await
            .unwrap();
        assert_eq!(report.locks_released, 1);
        assert_eq!(store.locks(&tenant()).await[0].status, LockStatus::Released);

        assert!(!locks.release(&lock).await.unwrap());
        assert!(locks
            .acquire(&tenant(), LockRequest::unit("CLAIM", "55"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_failed_task_requeued_until_retries_run_out() {
        let store = Arc::new(MemoryCollectorStore::new());
        let reclaimer = reclaimer(store.clone(), 10);
        let task = ScheduledTask::new(
            tenant(),
            "t-1",
            ResourceId::from("1001"),
            "claims-sync",
            "CLAIM",
            "55",
            json!({}),
        )
        .with_max_retries(2);
        store.insert_task_if_absent(&task).await.unwrap();

        for attempt in 1..=2 {
            store.claim_task(&tenant(), "t-1").await.unwrap();
            store.fail_task(&tenant(), "t-1", None).await.unwrap();
            let failed = store.get_task(&tenant(), "t-1").await.unwrap().unwrap();
            assert_eq!(failed.retry_count, attempt);

            let report = reclaimer
                .sweep_at(failed.updated_at + chrono::Duration::seconds(11))
                .await
                .unwrap();
            let expected = if attempt < 2 { 1 } else { 0 };
            assert_eq!(report.tasks_requeued, expected);
        }

        let task = store.get_task(&tenant(), "t-1").await.unwrap().unwrap();
        assert_eq!(task.status, UnitStatus::Failed);
    }

    proptest! {
        #[test]
        fn prop_reset_iff_elapsed_exceeds_timeout(timeout in 1u64..3_600, elapsed_ms in 0i64..7_200_000) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let store = Arc::new(MemoryCollectorStore::new());
                let reclaimer = reclaimer(store.clone(), timeout);
                let task = processing_task(&store).await;
                let now = task.started_at.unwrap() + chrono::Duration::milliseconds(elapsed_ms);

                let report = reclaimer.sweep_at(now).await.unwrap();
                let expected = u64::from(elapsed_ms > i64::try_from(timeout).unwrap() * 1_000);
                prop_assert_eq!(report.tasks_reset, expected);
                Ok(())
            })?;
        }
    }
}
