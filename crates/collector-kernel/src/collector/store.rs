//! Storage seams of the collector
//!
//! Components only see these traits. Every method is scoped by tenant, and
//! every state transition is a conditional update so that concurrent workers
//! racing on the same row resolve through the database, not through memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use collector_common::{Dependence, ResourceId, TenantId};
use uuid::Uuid;

use super::types::{
    ChangeDataJson, ChangeDataJsonHistory, ChangeDataRecord, CompetitiveLock, EventStatus,
    PendingJson, ScheduledTask, TableCounts, TriggerEvent, TriggerModel, TriggerModule,
    TriggerPlan, TriggerTable,
};
use crate::db::DbResult;

/// Backing rows of the competitive lock
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Insert a HELD row unless one is already held for the same resource.
    /// Returns `true` when this call created the row.
    async fn insert_lock_if_absent(&self, lock: &CompetitiveLock) -> DbResult<bool>;

    /// HELD -> RELEASED for one lock. `false` when it was no longer held.
    async fn release_lock(&self, tenant: &TenantId, lock_id: Uuid) -> DbResult<bool>;

    /// HELD -> RELEASED for every lock registered before `cutoff`
    async fn release_expired_locks(
        &self,
        tenant: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> DbResult<u64>;
}

/// Scheduled task queue
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert unless a task with the same id exists. Returns `true` on insert.
    async fn insert_task_if_absent(&self, task: &ScheduledTask) -> DbResult<bool>;

    async fn get_task(&self, tenant: &TenantId, task_id: &str) -> DbResult<Option<ScheduledTask>>;

    /// INITIAL tasks ordered by priority, then resource order
    async fn list_initial_tasks(&self, tenant: &TenantId, limit: i64)
        -> DbResult<Vec<ScheduledTask>>;

    /// INITIAL -> PROCESSING, stamping `started_at`
    async fn claim_task(&self, tenant: &TenantId, task_id: &str) -> DbResult<bool>;

    /// PROCESSING -> DONE
    async fn complete_task(
        &self,
        tenant: &TenantId,
        task_id: &str,
        result: Option<serde_json::Value>,
    ) -> DbResult<bool>;

    /// PROCESSING -> FAILED, incrementing `retry_count`
    async fn fail_task(
        &self,
        tenant: &TenantId,
        task_id: &str,
        result: Option<serde_json::Value>,
    ) -> DbResult<bool>;

    /// PROCESSING with `started_at < cutoff` -> INITIAL
    async fn reset_stale_tasks(&self, tenant: &TenantId, cutoff: DateTime<Utc>) -> DbResult<u64>;

    /// FAILED with retries left and `updated_at < cutoff` -> INITIAL
    async fn requeue_failed_tasks(&self, tenant: &TenantId, cutoff: DateTime<Utc>)
        -> DbResult<u64>;
}

/// A node of the hierarchy that carries an `is_finished` flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerNode {
    Module(Uuid),
    Model(Uuid),
    Table(Uuid),
}

/// Event -> module -> model -> table
#[async_trait]
pub trait TriggerStore: Send + Sync {
    /// Persist an event and its whole fan-out atomically
    async fn insert_plan(&self, plan: &TriggerPlan) -> DbResult<()>;

    async fn get_event(&self, tenant: &TenantId, event_id: Uuid) -> DbResult<Option<TriggerEvent>>;

    /// Unfinished events, oldest first
    async fn list_open_events(&self, tenant: &TenantId, limit: i64) -> DbResult<Vec<TriggerEvent>>;

    async fn list_modules(&self, tenant: &TenantId, event_id: Uuid)
        -> DbResult<Vec<TriggerModule>>;

    async fn list_models(&self, tenant: &TenantId, event_id: Uuid) -> DbResult<Vec<TriggerModel>>;

    async fn list_tables(&self, tenant: &TenantId, event_id: Uuid) -> DbResult<Vec<TriggerTable>>;

    async fn get_table(&self, tenant: &TenantId, table_id: Uuid) -> DbResult<Option<TriggerTable>>;

    /// Flag a table as extracted. `false` if it already was.
    async fn mark_table_extracted(
        &self,
        tenant: &TenantId,
        table_id: Uuid,
        record_count: i64,
    ) -> DbResult<bool>;

    /// Set `is_finished`. `false` if it already was.
    async fn finish_node(&self, tenant: &TenantId, node: TriggerNode) -> DbResult<bool>;

    /// Move the event forward; FINISHED also sets `is_finished` and `finished_at`.
    /// Never moves an event backwards.
    async fn advance_event(
        &self,
        tenant: &TenantId,
        event_id: Uuid,
        status: EventStatus,
    ) -> DbResult<bool>;
}

/// Records, json units and their history
#[async_trait]
pub trait ChangeDataStore: Send + Sync {
    async fn insert_records(&self, records: &[ChangeDataRecord]) -> DbResult<u64>;

    /// INITIAL -> PROCESSING for up to `limit` records, oldest resource first
    async fn claim_records(&self, tenant: &TenantId, limit: i64)
        -> DbResult<Vec<ChangeDataRecord>>;

    /// Insert each json unit, or fold it into the live INITIAL or FAILED
    /// unit with the same entity key, in one transaction. Records whose
    /// entity is PROCESSING go back to INITIAL for a later cycle; the rest
    /// are marked DONE. Returns the number of units inserted or merged.
    async fn stage_json(
        &self,
        tenant: &TenantId,
        record_ids: &[Uuid],
        units: &[ChangeDataJson],
    ) -> DbResult<u64>;

    /// INITIAL json units with their model attributes, ordered by model
    /// priority, then resource order
    async fn list_initial_json(&self, tenant: &TenantId, limit: i64) -> DbResult<Vec<PendingJson>>;

    /// INITIAL -> PROCESSING
    async fn claim_json(&self, tenant: &TenantId, json_id: Uuid) -> DbResult<bool>;

    /// Append a success history row and remove the live unit
    async fn archive_json(&self, tenant: &TenantId, history: &ChangeDataJsonHistory)
        -> DbResult<()>;

    /// PROCESSING -> FAILED in place and append a failed history row
    async fn fail_json(&self, tenant: &TenantId, history: &ChangeDataJsonHistory) -> DbResult<()>;

    async fn reset_stale_records(&self, tenant: &TenantId, cutoff: DateTime<Utc>)
        -> DbResult<u64>;

    async fn reset_stale_json(&self, tenant: &TenantId, cutoff: DateTime<Utc>) -> DbResult<u64>;

    async fn requeue_failed_json(&self, tenant: &TenantId, cutoff: DateTime<Utc>)
        -> DbResult<u64>;

    async fn table_counts(&self, tenant: &TenantId, table_id: Uuid) -> DbResult<TableCounts>;
}

/// Count queries behind the dependency resolver
#[async_trait]
pub trait DependencyIndex: Send + Sync {
    /// Json units plus scheduled tasks for the entity that are not DONE
    async fn count_open(&self, tenant: &TenantId, dependence: &Dependence) -> DbResult<i64>;

    /// Same, restricted to units whose resource id sorts strictly before `before`
    async fn count_open_before(
        &self,
        tenant: &TenantId,
        model_name: &str,
        object_id: &str,
        before: &ResourceId,
    ) -> DbResult<i64>;

    /// Unfinished models of the event among `model_names`
    async fn count_unfinished_models(
        &self,
        tenant: &TenantId,
        event_id: Uuid,
        model_names: &[String],
    ) -> DbResult<i64>;
}
