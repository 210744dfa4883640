//! PostgreSQL collector store
//!
//! Runtime-checked `sqlx::query` calls against the schema in `migrations/`.
//! Claims use `FOR UPDATE SKIP LOCKED` so that concurrent workers never pick
//! the same row, and every multi-row mutation runs in a transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use collector_common::{Dependence, ResourceId, TenantId};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use crate::collector::store::{
    ChangeDataStore, DependencyIndex, LockStore, TaskStore, TriggerNode, TriggerStore,
};
use crate::collector::types::{
    ChangeDataJson, ChangeDataJsonHistory, ChangeDataRecord, CompetitiveLock, EventStatus,
    HistoryOutcome, LockStatus, PendingJson, ScheduledTask, TableCounts, TriggerEvent,
    TriggerModel, TriggerModule, TriggerPlan, TriggerTable, TriggerType, UnitStatus,
};
use crate::db::{DbError, DbResult};

/// Collector store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgCollectorStore {
    pool: PgPool,
}

impl PgCollectorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn tenant_of(row: &PgRow) -> DbResult<TenantId> {
    let raw: String = row.try_get("tenant_id")?;
    TenantId::parse(&raw).map_err(|_| DbError::decode("tenant_id", raw))
}

fn unit_status_of(row: &PgRow) -> DbResult<UnitStatus> {
    let code: i16 = row.try_get("status")?;
    UnitStatus::from_code(code).ok_or_else(|| DbError::decode("status", code))
}

fn dependencies_of(row: &PgRow) -> DbResult<Vec<Dependence>> {
    let Json(deps): Json<Vec<Dependence>> = row.try_get("depend_on")?;
    Ok(deps)
}

fn task_from_row(row: &PgRow) -> DbResult<ScheduledTask> {
    let resource_id: String = row.try_get("resource_id")?;
    Ok(ScheduledTask {
        tenant_id: tenant_of(row)?,
        task_id: row.try_get("task_id")?,
        resource_id: ResourceId::from(resource_id),
        topic_code: row.try_get("topic_code")?,
        content: row.try_get("content")?,
        model_name: row.try_get("model_name")?,
        object_id: row.try_get("object_id")?,
        depend_on: dependencies_of(row)?,
        status: unit_status_of(row)?,
        result: row.try_get("result")?,
        priority: row.try_get("priority")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        source_key: row.try_get("source_key")?,
        started_at: row.try_get("started_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_from_row(row: &PgRow) -> DbResult<TriggerEvent> {
    let trigger_type: String = row.try_get("trigger_type")?;
    let status: i16 = row.try_get("status")?;
    Ok(TriggerEvent {
        tenant_id: tenant_of(row)?,
        event_trigger_id: row.try_get("event_trigger_id")?,
        trigger_type: TriggerType::parse(&trigger_type)
            .ok_or_else(|| DbError::decode("trigger_type", &trigger_type))?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        is_finished: row.try_get("is_finished")?,
        status: EventStatus::from_code(status).ok_or_else(|| DbError::decode("status", status))?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn module_from_row(row: &PgRow) -> DbResult<TriggerModule> {
    Ok(TriggerModule {
        tenant_id: tenant_of(row)?,
        module_trigger_id: row.try_get("module_trigger_id")?,
        event_trigger_id: row.try_get("event_trigger_id")?,
        module_name: row.try_get("module_name")?,
        priority: row.try_get("priority")?,
        is_finished: row.try_get("is_finished")?,
    })
}

fn model_from_row(row: &PgRow) -> DbResult<TriggerModel> {
    Ok(TriggerModel {
        tenant_id: tenant_of(row)?,
        model_trigger_id: row.try_get("model_trigger_id")?,
        module_trigger_id: row.try_get("module_trigger_id")?,
        event_trigger_id: row.try_get("event_trigger_id")?,
        model_name: row.try_get("model_name")?,
        topic_code: row.try_get("topic_code")?,
        priority: row.try_get("priority")?,
        parallel: row.try_get("parallel")?,
        depend_on: row.try_get("depend_on")?,
        is_finished: row.try_get("is_finished")?,
    })
}

fn table_from_row(row: &PgRow) -> DbResult<TriggerTable> {
    Ok(TriggerTable {
        tenant_id: tenant_of(row)?,
        table_trigger_id: row.try_get("table_trigger_id")?,
        model_trigger_id: row.try_get("model_trigger_id")?,
        module_trigger_id: row.try_get("module_trigger_id")?,
        event_trigger_id: row.try_get("event_trigger_id")?,
        model_name: row.try_get("model_name")?,
        table_name: row.try_get("table_name")?,
        priority: row.try_get("priority")?,
        is_extracted: row.try_get("is_extracted")?,
        record_count: row.try_get("record_count")?,
        is_finished: row.try_get("is_finished")?,
    })
}

fn record_from_row(row: &PgRow) -> DbResult<ChangeDataRecord> {
    let resource_id: String = row.try_get("resource_id")?;
    Ok(ChangeDataRecord {
        tenant_id: tenant_of(row)?,
        record_id: row.try_get("record_id")?,
        table_trigger_id: row.try_get("table_trigger_id")?,
        model_trigger_id: row.try_get("model_trigger_id")?,
        event_trigger_id: row.try_get("event_trigger_id")?,
        resource_id: ResourceId::from(resource_id),
        model_name: row.try_get("model_name")?,
        object_id: row.try_get("object_id")?,
        table_name: row.try_get("table_name")?,
        data_id: row.try_get("data_id")?,
        content: row.try_get("content")?,
        depend_on: dependencies_of(row)?,
        status: unit_status_of(row)?,
        started_at: row.try_get("started_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn json_from_row(row: &PgRow) -> DbResult<ChangeDataJson> {
    let resource_id: String = row.try_get("resource_id")?;
    Ok(ChangeDataJson {
        tenant_id: tenant_of(row)?,
        json_id: row.try_get("json_id")?,
        table_trigger_id: row.try_get("table_trigger_id")?,
        model_trigger_id: row.try_get("model_trigger_id")?,
        event_trigger_id: row.try_get("event_trigger_id")?,
        resource_id: ResourceId::from(resource_id),
        model_name: row.try_get("model_name")?,
        object_id: row.try_get("object_id")?,
        table_name: row.try_get("table_name")?,
        data_id: row.try_get("data_id")?,
        content: row.try_get("content")?,
        depend_on: dependencies_of(row)?,
        status: unit_status_of(row)?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        last_error: row.try_get("last_error")?,
        started_at: row.try_get("started_at")?,
        updated_at: row.try_get("updated_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn pending_from_row(row: &PgRow) -> DbResult<PendingJson> {
    Ok(PendingJson {
        json: json_from_row(row)?,
        topic_code: row.try_get("topic_code")?,
        priority: row.try_get("priority")?,
        parallel: row.try_get("parallel")?,
        model_depend_on: row.try_get("model_depend_on")?,
    })
}

async fn insert_history<'e, E>(executor: E, history: &ChangeDataJsonHistory) -> DbResult<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO change_data_json_history (
            tenant_id, history_id, json_id, table_trigger_id, model_trigger_id,
            event_trigger_id, resource_id, model_name, object_id, content,
            outcome, trace_id, result, error_message, recorded_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(history.tenant_id.as_str())
    .bind(history.history_id)
    .bind(history.json_id)
    .bind(history.table_trigger_id)
    .bind(history.model_trigger_id)
    .bind(history.event_trigger_id)
    .bind(history.resource_id.as_str())
    .bind(&history.model_name)
    .bind(&history.object_id)
    .bind(&history.content)
    .bind(history.outcome.code())
    .bind(&history.trace_id)
    .bind(&history.result)
    .bind(&history.error_message)
    .bind(history.recorded_at)
    .execute(executor)
    .await?;
    Ok(())
}

// ============================================================================
// Locks
// ============================================================================

#[async_trait]
impl LockStore for PgCollectorStore {
    async fn insert_lock_if_absent(&self, lock: &CompetitiveLock) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO competitive_locks (
                tenant_id, lock_id, resource_id, kind, model_name, object_id,
                owner, registered_at, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, resource_id) WHERE status = 0 DO NOTHING
            "#,
        )
        .bind(lock.tenant_id.as_str())
        .bind(lock.lock_id)
        .bind(&lock.resource_id)
        .bind(lock.kind.as_str())
        .bind(&lock.model_name)
        .bind(&lock.object_id)
        .bind(&lock.owner)
        .bind(lock.registered_at)
        .bind(LockStatus::Held.code())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, tenant: &TenantId, lock_id: Uuid) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE competitive_locks SET status = 1 \
             WHERE tenant_id = $1 AND lock_id = $2 AND status = 0",
        )
        .bind(tenant.as_str())
        .bind(lock_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_expired_locks(
        &self,
        tenant: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE competitive_locks SET status = 1 \
             WHERE tenant_id = $1 AND status = 0 AND registered_at < $2",
        )
        .bind(tenant.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Scheduled tasks
// ============================================================================

#[async_trait]
impl TaskStore for PgCollectorStore {
    async fn insert_task_if_absent(&self, task: &ScheduledTask) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_tasks (
                tenant_id, task_id, resource_id, topic_code, content, model_name,
                object_id, depend_on, status, result, priority, retry_count,
                max_retries, source_key, started_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (tenant_id, task_id) DO NOTHING
            "#,
        )
        .bind(task.tenant_id.as_str())
        .bind(&task.task_id)
        .bind(task.resource_id.as_str())
        .bind(&task.topic_code)
        .bind(&task.content)
        .bind(&task.model_name)
        .bind(&task.object_id)
        .bind(Json(&task.depend_on))
        .bind(task.status.code())
        .bind(&task.result)
        .bind(task.priority)
        .bind(task.retry_count)
        .bind(task.max_retries)
        .bind(&task.source_key)
        .bind(task.started_at)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_task(&self, tenant: &TenantId, task_id: &str) -> DbResult<Option<ScheduledTask>> {
        let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE tenant_id = $1 AND task_id = $2")
            .bind(tenant.as_str())
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_initial_tasks(
        &self,
        tenant: &TenantId,
        limit: i64,
    ) -> DbResult<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scheduled_tasks
            WHERE tenant_id = $1 AND status = 0
            ORDER BY priority, octet_length(resource_id), resource_id COLLATE "C"
            LIMIT $2
            "#,
        )
        .bind(tenant.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn claim_task(&self, tenant: &TenantId, task_id: &str) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE scheduled_tasks SET status = 1, started_at = NOW(), updated_at = NOW() \
             WHERE tenant_id = $1 AND task_id = $2 AND status = 0",
        )
        .bind(tenant.as_str())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_task(
        &self,
        tenant: &TenantId,
        task_id: &str,
        result: Option<serde_json::Value>,
    ) -> DbResult<bool> {
        let done = sqlx::query(
            "UPDATE scheduled_tasks SET status = 2, result = $3, updated_at = NOW() \
             WHERE tenant_id = $1 AND task_id = $2 AND status = 1",
        )
        .bind(tenant.as_str())
        .bind(task_id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() == 1)
    }

    async fn fail_task(
        &self,
        tenant: &TenantId,
        task_id: &str,
        result: Option<serde_json::Value>,
    ) -> DbResult<bool> {
        let failed = sqlx::query(
            "UPDATE scheduled_tasks \
             SET status = 3, result = $3, retry_count = retry_count + 1, updated_at = NOW() \
             WHERE tenant_id = $1 AND task_id = $2 AND status = 1",
        )
        .bind(tenant.as_str())
        .bind(task_id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        Ok(failed.rows_affected() == 1)
    }

    async fn reset_stale_tasks(&self, tenant: &TenantId, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE scheduled_tasks SET status = 0, started_at = NULL, updated_at = NOW() \
             WHERE tenant_id = $1 AND status = 1 AND started_at < $2",
        )
        .bind(tenant.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn requeue_failed_tasks(
        &self,
        tenant: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE scheduled_tasks SET status = 0, started_at = NULL, updated_at = NOW() \
             WHERE tenant_id = $1 AND status = 3 AND retry_count < max_retries \
             AND updated_at < $2",
        )
        .bind(tenant.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Trigger hierarchy
// ============================================================================

#[async_trait]
impl TriggerStore for PgCollectorStore {
    async fn insert_plan(&self, plan: &TriggerPlan) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let event = &plan.event;

        sqlx::query(
            r#"
            INSERT INTO trigger_events (
                tenant_id, event_trigger_id, trigger_type, start_time, end_time,
                is_finished, status, created_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.tenant_id.as_str())
        .bind(event.event_trigger_id)
        .bind(event.trigger_type.as_str())
        .bind(event.start_time)
        .bind(event.end_time)
        .bind(event.is_finished)
        .bind(event.status.code())
        .bind(event.created_at)
        .bind(event.finished_at)
        .execute(&mut *tx)
        .await?;

        for module in &plan.modules {
            sqlx::query(
                "INSERT INTO trigger_modules \
                 (tenant_id, module_trigger_id, event_trigger_id, module_name, priority, is_finished) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(module.tenant_id.as_str())
            .bind(module.module_trigger_id)
            .bind(module.event_trigger_id)
            .bind(&module.module_name)
            .bind(module.priority)
            .bind(module.is_finished)
            .execute(&mut *tx)
            .await?;
        }

        for model in &plan.models {
            sqlx::query(
                r#"
                INSERT INTO trigger_models (
                    tenant_id, model_trigger_id, module_trigger_id, event_trigger_id,
                    model_name, topic_code, priority, parallel, depend_on, is_finished
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(model.tenant_id.as_str())
            .bind(model.model_trigger_id)
            .bind(model.module_trigger_id)
            .bind(model.event_trigger_id)
            .bind(&model.model_name)
            .bind(&model.topic_code)
            .bind(model.priority)
            .bind(model.parallel)
            .bind(&model.depend_on)
            .bind(model.is_finished)
            .execute(&mut *tx)
            .await?;
        }

        for table in &plan.tables {
            sqlx::query(
                r#"
                INSERT INTO trigger_tables (
                    tenant_id, table_trigger_id, model_trigger_id, module_trigger_id,
                    event_trigger_id, model_name, table_name, priority, is_extracted,
                    record_count, is_finished
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(table.tenant_id.as_str())
            .bind(table.table_trigger_id)
            .bind(table.model_trigger_id)
            .bind(table.module_trigger_id)
            .bind(table.event_trigger_id)
            .bind(&table.model_name)
            .bind(&table.table_name)
            .bind(table.priority)
            .bind(table.is_extracted)
            .bind(table.record_count)
            .bind(table.is_finished)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_event(&self, tenant: &TenantId, event_id: Uuid) -> DbResult<Option<TriggerEvent>> {
        let row = sqlx::query(
            "SELECT * FROM trigger_events WHERE tenant_id = $1 AND event_trigger_id = $2",
        )
        .bind(tenant.as_str())
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn list_open_events(&self, tenant: &TenantId, limit: i64) -> DbResult<Vec<TriggerEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM trigger_events WHERE tenant_id = $1 AND is_finished = FALSE \
             ORDER BY created_at LIMIT $2",
        )
        .bind(tenant.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn list_modules(
        &self,
        tenant: &TenantId,
        event_id: Uuid,
    ) -> DbResult<Vec<TriggerModule>> {
        let rows = sqlx::query(
            "SELECT * FROM trigger_modules WHERE tenant_id = $1 AND event_trigger_id = $2 \
             ORDER BY priority, module_name",
        )
        .bind(tenant.as_str())
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(module_from_row).collect()
    }

    async fn list_models(&self, tenant: &TenantId, event_id: Uuid) -> DbResult<Vec<TriggerModel>> {
        let rows = sqlx::query(
            "SELECT * FROM trigger_models WHERE tenant_id = $1 AND event_trigger_id = $2 \
             ORDER BY priority, model_name",
        )
        .bind(tenant.as_str())
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(model_from_row).collect()
    }

    async fn list_tables(&self, tenant: &TenantId, event_id: Uuid) -> DbResult<Vec<TriggerTable>> {
        let rows = sqlx::query(
            "SELECT * FROM trigger_tables WHERE tenant_id = $1 AND event_trigger_id = $2 \
             ORDER BY priority, table_name",
        )
        .bind(tenant.as_str())
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(table_from_row).collect()
    }

    async fn get_table(&self, tenant: &TenantId, table_id: Uuid) -> DbResult<Option<TriggerTable>> {
        let row = sqlx::query(
            "SELECT * FROM trigger_tables WHERE tenant_id = $1 AND table_trigger_id = $2",
        )
        .bind(tenant.as_str())
        .bind(table_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(table_from_row).transpose()
    }

    async fn mark_table_extracted(
        &self,
        tenant: &TenantId,
        table_id: Uuid,
        record_count: i64,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE trigger_tables SET is_extracted = TRUE, record_count = $3 \
             WHERE tenant_id = $1 AND table_trigger_id = $2 AND is_extracted = FALSE",
        )
        .bind(tenant.as_str())
        .bind(table_id)
        .bind(record_count)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_table(tenant, table_id).await? {
            Some(_) => Ok(false),
            None => Err(DbError::not_found("Trigger table", table_id)),
        }
    }

    async fn finish_node(&self, tenant: &TenantId, node: TriggerNode) -> DbResult<bool> {
        let (sql, id) = match node {
            TriggerNode::Module(id) => (
                "UPDATE trigger_modules SET is_finished = TRUE \
                 WHERE tenant_id = $1 AND module_trigger_id = $2 AND is_finished = FALSE",
                id,
            ),
            TriggerNode::Model(id) => (
                "UPDATE trigger_models SET is_finished = TRUE \
                 WHERE tenant_id = $1 AND model_trigger_id = $2 AND is_finished = FALSE",
                id,
            ),
            TriggerNode::Table(id) => (
                "UPDATE trigger_tables SET is_finished = TRUE \
                 WHERE tenant_id = $1 AND table_trigger_id = $2 AND is_finished = FALSE",
                id,
            ),
        };

        let result = sqlx::query(sql)
            .bind(tenant.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn advance_event(
        &self,
        tenant: &TenantId,
        event_id: Uuid,
        status: EventStatus,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE trigger_events
            SET status = $3,
                is_finished = ($3 = 2),
                finished_at = CASE WHEN $3 = 2 THEN NOW() ELSE finished_at END
            WHERE tenant_id = $1 AND event_trigger_id = $2 AND status < $3
            "#,
        )
        .bind(tenant.as_str())
        .bind(event_id)
        .bind(status.code())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

// ============================================================================
// Change data
// ============================================================================

#[async_trait]
impl ChangeDataStore for PgCollectorStore {
    async fn insert_records(&self, records: &[ChangeDataRecord]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO change_data_records (
                    tenant_id, record_id, table_trigger_id, model_trigger_id,
                    event_trigger_id, resource_id, model_name, object_id, table_name,
                    data_id, content, depend_on, status, started_at, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT (record_id) DO NOTHING
                "#,
            )
            .bind(record.tenant_id.as_str())
            .bind(record.record_id)
            .bind(record.table_trigger_id)
            .bind(record.model_trigger_id)
            .bind(record.event_trigger_id)
            .bind(record.resource_id.as_str())
            .bind(&record.model_name)
            .bind(&record.object_id)
            .bind(&record.table_name)
            .bind(&record.data_id)
            .bind(&record.content)
            .bind(Json(&record.depend_on))
            .bind(record.status.code())
            .bind(record.started_at)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn claim_records(
        &self,
        tenant: &TenantId,
        limit: i64,
    ) -> DbResult<Vec<ChangeDataRecord>> {
        let rows = sqlx::query(
            r#"
            UPDATE change_data_records
            SET status = 1, started_at = NOW()
            WHERE record_id IN (
                SELECT record_id FROM change_data_records
                WHERE tenant_id = $1 AND status = 0
                ORDER BY octet_length(resource_id), resource_id COLLATE "C"
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(tenant.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<DbResult<Vec<_>>>()?;
        records.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        Ok(records)
    }

    async fn stage_json(
        &self,
        tenant: &TenantId,
        record_ids: &[Uuid],
        units: &[ChangeDataJson],
    ) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut staged = 0;

        for unit in units {
            let result = sqlx::query(
                r#"
                INSERT INTO change_data_json (
                    tenant_id, json_id, table_trigger_id, model_trigger_id,
                    event_trigger_id, resource_id, model_name, object_id, table_name,
                    data_id, content, depend_on, status, retry_count, max_retries,
                    last_error, started_at, updated_at, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                        $16, $17, $18, $19)
                ON CONFLICT ON CONSTRAINT uq_change_data_json_entity DO UPDATE SET
                    content = CASE
                        WHEN jsonb_typeof(change_data_json.content) = 'object'
                         AND jsonb_typeof(EXCLUDED.content) = 'object'
                        THEN change_data_json.content || EXCLUDED.content
                        ELSE EXCLUDED.content
                    END,
                    depend_on = (
                        SELECT COALESCE(jsonb_agg(DISTINCT d), '[]'::jsonb)
                        FROM jsonb_array_elements(change_data_json.depend_on || EXCLUDED.depend_on) d
                    ),
                    resource_id = CASE
                        WHEN (octet_length(EXCLUDED.resource_id), EXCLUDED.resource_id COLLATE "C")
                           > (octet_length(change_data_json.resource_id), change_data_json.resource_id COLLATE "C")
                        THEN EXCLUDED.resource_id
                        ELSE change_data_json.resource_id
                    END,
                    status = 0,
                    retry_count = 0,
                    last_error = NULL,
                    started_at = NULL,
                    updated_at = EXCLUDED.updated_at
                WHERE change_data_json.status <> 1
                "#,
            )
            .bind(unit.tenant_id.as_str())
            .bind(unit.json_id)
            .bind(unit.table_trigger_id)
            .bind(unit.model_trigger_id)
            .bind(unit.event_trigger_id)
            .bind(unit.resource_id.as_str())
            .bind(&unit.model_name)
            .bind(&unit.object_id)
            .bind(&unit.table_name)
            .bind(&unit.data_id)
            .bind(&unit.content)
            .bind(Json(&unit.depend_on))
            .bind(unit.status.code())
            .bind(unit.retry_count)
            .bind(unit.max_retries)
            .bind(&unit.last_error)
            .bind(unit.started_at)
            .bind(unit.updated_at)
            .bind(unit.created_at)
            .execute(&mut *tx)
            .await?;
            staged += result.rows_affected();
        }

        // Records of an entity still PROCESSING wait for the next cycle
        sqlx::query(
            r#"
            UPDATE change_data_records r
            SET status = CASE WHEN busy.json_id IS NULL THEN 2 ELSE 0 END,
                started_at = CASE WHEN busy.json_id IS NULL THEN r.started_at END
            FROM change_data_records src
            LEFT JOIN change_data_json busy
                ON busy.tenant_id = src.tenant_id
               AND busy.event_trigger_id = src.event_trigger_id
               AND busy.model_name = src.model_name
               AND busy.object_id = src.object_id
               AND busy.table_name = src.table_name
               AND busy.data_id = src.data_id
               AND busy.status = 1
            WHERE r.record_id = src.record_id
              AND r.tenant_id = $1
              AND r.record_id = ANY($2)
            "#,
        )
        .bind(tenant.as_str())
        .bind(record_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(staged)
    }

    async fn list_initial_json(&self, tenant: &TenantId, limit: i64) -> DbResult<Vec<PendingJson>> {
        let rows = sqlx::query(
            r#"
            SELECT j.*,
                   m.topic_code,
                   m.priority,
                   m.parallel,
                   m.depend_on AS model_depend_on
            FROM change_data_json j
            JOIN trigger_models m ON m.model_trigger_id = j.model_trigger_id
            WHERE j.tenant_id = $1 AND j.status = 0
            ORDER BY m.priority, octet_length(j.resource_id), j.resource_id COLLATE "C"
            LIMIT $2
            "#,
        )
        .bind(tenant.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pending_from_row).collect()
    }

    async fn claim_json(&self, tenant: &TenantId, json_id: Uuid) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE change_data_json SET status = 1, started_at = NOW(), updated_at = NOW() \
             WHERE tenant_id = $1 AND json_id = $2 AND status = 0",
        )
        .bind(tenant.as_str())
        .bind(json_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn archive_json(
        &self,
        tenant: &TenantId,
        history: &ChangeDataJsonHistory,
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            "DELETE FROM change_data_json WHERE tenant_id = $1 AND json_id = $2 AND status = 1",
        )
        .bind(tenant.as_str())
        .bind(history.json_id)
        .execute(&mut *tx)
        .await?;
        if deleted.rows_affected() != 1 {
            return Err(DbError::not_found("Processing json unit", history.json_id));
        }

        insert_history(&mut *tx, history).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fail_json(&self, tenant: &TenantId, history: &ChangeDataJsonHistory) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let failed = sqlx::query(
            r#"
            UPDATE change_data_json
            SET status = 3, retry_count = retry_count + 1, last_error = $3, updated_at = NOW()
            WHERE tenant_id = $1 AND json_id = $2 AND status = 1
            "#,
        )
        .bind(tenant.as_str())
        .bind(history.json_id)
        .bind(&history.error_message)
        .execute(&mut *tx)
        .await?;
        if failed.rows_affected() != 1 {
            return Err(DbError::not_found("Processing json unit", history.json_id));
        }

        insert_history(&mut *tx, history).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reset_stale_records(
        &self,
        tenant: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE change_data_records SET status = 0, started_at = NULL \
             WHERE tenant_id = $1 AND status = 1 AND started_at < $2",
        )
        .bind(tenant.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reset_stale_json(&self, tenant: &TenantId, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE change_data_json SET status = 0, started_at = NULL, updated_at = NOW() \
             WHERE tenant_id = $1 AND status = 1 AND started_at < $2",
        )
        .bind(tenant.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn requeue_failed_json(
        &self,
        tenant: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE change_data_json SET status = 0, started_at = NULL, updated_at = NOW() \
             WHERE tenant_id = $1 AND status = 3 AND retry_count < max_retries \
             AND updated_at < $2",
        )
        .bind(tenant.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn table_counts(&self, tenant: &TenantId, table_id: Uuid) -> DbResult<TableCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM change_data_records
                 WHERE tenant_id = $1 AND table_trigger_id = $2 AND status <> 2) AS records_open,
                (SELECT COUNT(*) FROM change_data_json
                 WHERE tenant_id = $1 AND table_trigger_id = $2) AS json_open,
                (SELECT COUNT(*) FROM change_data_json_history
                 WHERE tenant_id = $1 AND table_trigger_id = $2 AND outcome = $3) AS succeeded,
                (SELECT COUNT(*) FROM change_data_json_history
                 WHERE tenant_id = $1 AND table_trigger_id = $2 AND outcome = $4) AS failed
            "#,
        )
        .bind(tenant.as_str())
        .bind(table_id)
        .bind(HistoryOutcome::Success.code())
        .bind(HistoryOutcome::Failed.code())
        .fetch_one(&self.pool)
        .await?;

        Ok(TableCounts {
            records_open: row.try_get("records_open")?,
            json_open: row.try_get("json_open")?,
            succeeded: row.try_get("succeeded")?,
            failed: row.try_get("failed")?,
        })
    }
}

// ============================================================================
// Dependency counts
// ============================================================================

#[async_trait]
impl DependencyIndex for PgCollectorStore {
    async fn count_open(&self, tenant: &TenantId, dependence: &Dependence) -> DbResult<i64> {
        let open: i64 = sqlx::query_scalar(
            r#"
            SELECT
                (SELECT COUNT(*) FROM change_data_json
                 WHERE tenant_id = $1 AND model_name = $2 AND object_id = $3)
              + (SELECT COUNT(*) FROM scheduled_tasks
                 WHERE tenant_id = $1 AND model_name = $2 AND object_id = $3 AND status <> 2)
            "#,
        )
        .bind(tenant.as_str())
        .bind(&dependence.model_name)
        .bind(&dependence.object_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(open)
    }

    async fn count_open_before(
        &self,
        tenant: &TenantId,
        model_name: &str,
        object_id: &str,
        before: &ResourceId,
    ) -> DbResult<i64> {
        let open: i64 = sqlx::query_scalar(
            r#"
            SELECT
                (SELECT COUNT(*) FROM change_data_json
                 WHERE tenant_id = $1 AND model_name = $2 AND object_id = $3
                   AND (octet_length(resource_id) < octet_length($4)
                        OR (octet_length(resource_id) = octet_length($4)
                            AND resource_id COLLATE "C" < $4 COLLATE "C")))
              + (SELECT COUNT(*) FROM scheduled_tasks
                 WHERE tenant_id = $1 AND model_name = $2 AND object_id = $3 AND status <> 2
                   AND (octet_length(resource_id) < octet_length($4)
                        OR (octet_length(resource_id) = octet_length($4)
                            AND resource_id COLLATE "C" < $4 COLLATE "C")))
            "#,
        )
        .bind(tenant.as_str())
        .bind(model_name)
        .bind(object_id)
        .bind(before.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(open)
    }

    async fn count_unfinished_models(
        &self,
        tenant: &TenantId,
        event_id: Uuid,
        model_names: &[String],
    ) -> DbResult<i64> {
        if model_names.is_empty() {
            return Ok(0);
        }

        let unfinished: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM trigger_models \
             WHERE tenant_id = $1 AND event_trigger_id = $2 AND is_finished = FALSE \
             AND model_name = ANY($3)",
        )
        .bind(tenant.as_str())
        .bind(event_id)
        .bind(model_names)
        .fetch_one(&self.pool)
        .await?;

        Ok(unfinished)
    }
}
