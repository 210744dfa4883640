//! In-process collector store
//!
//! Implements every store trait over plain collections behind one async
//! mutex, so each trait call is atomic exactly like a single SQL statement or
//! transaction would be. Used by tests and by single-node runs without
//! PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use collector_common::{Dependence, ResourceId, TenantId};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::collector::store::{
    ChangeDataStore, DependencyIndex, LockStore, TaskStore, TriggerNode, TriggerStore,
};
use crate::collector::types::{
    ChangeDataJson, ChangeDataJsonHistory, ChangeDataRecord, CompetitiveLock, EntityKey,
    EventStatus, HistoryOutcome, LockStatus, PendingJson, ScheduledTask, TableCounts, TriggerEvent,
    TriggerModel, TriggerModule, TriggerPlan, TriggerTable, UnitStatus,
};
use crate::db::{DbError, DbResult};

#[derive(Default)]
struct MemoryState {
    locks: Vec<CompetitiveLock>,
    tasks: HashMap<(TenantId, String), ScheduledTask>,
    events: HashMap<Uuid, TriggerEvent>,
    modules: HashMap<Uuid, TriggerModule>,
    models: HashMap<Uuid, TriggerModel>,
    tables: HashMap<Uuid, TriggerTable>,
    records: HashMap<Uuid, ChangeDataRecord>,
    json: HashMap<Uuid, ChangeDataJson>,
    history: Vec<ChangeDataJsonHistory>,
}

/// Collector store kept entirely in memory
#[derive(Default)]
pub struct MemoryCollectorStore {
    state: Mutex<MemoryState>,
}

impl MemoryCollectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn locks(&self, tenant: &TenantId) -> Vec<CompetitiveLock> {
        let state = self.state.lock().await;
        state
            .locks
            .iter()
            .filter(|l| &l.tenant_id == tenant)
            .cloned()
            .collect()
    }

    pub async fn json_units(&self, tenant: &TenantId) -> Vec<ChangeDataJson> {
        let state = self.state.lock().await;
        let mut units: Vec<_> = state
            .json
            .values()
            .filter(|j| &j.tenant_id == tenant)
            .cloned()
            .collect();
        units.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        units
    }

    pub async fn history(&self, tenant: &TenantId) -> Vec<ChangeDataJsonHistory> {
        let state = self.state.lock().await;
        state
            .history
            .iter()
            .filter(|h| &h.tenant_id == tenant)
            .cloned()
            .collect()
    }

    pub async fn records(&self, tenant: &TenantId) -> Vec<ChangeDataRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| &r.tenant_id == tenant)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        records
    }
}

fn unit_order(
    a_priority: i32,
    a_resource: &ResourceId,
    b_priority: i32,
    b_resource: &ResourceId,
) -> std::cmp::Ordering {
    a_priority
        .cmp(&b_priority)
        .then_with(|| a_resource.cmp(b_resource))
}

fn limit_of(limit: i64) -> usize {
    usize::try_from(limit.max(0)).unwrap_or(usize::MAX)
}

#[async_trait]
impl LockStore for MemoryCollectorStore {
    async fn insert_lock_if_absent(&self, lock: &CompetitiveLock) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let held = state.locks.iter().any(|l| {
            l.tenant_id == lock.tenant_id
                && l.resource_id == lock.resource_id
                && l.status == LockStatus::Held
        });
        if held {
            return Ok(false);
        }
        state.locks.push(lock.clone());
        Ok(true)
    }

    async fn release_lock(&self, tenant: &TenantId, lock_id: Uuid) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state
            .locks
            .iter_mut()
            .find(|l| &l.tenant_id == tenant && l.lock_id == lock_id && l.status == LockStatus::Held)
        {
            Some(lock) => {
                lock.status = LockStatus::Released;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release_expired_locks(
        &self,
        tenant: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for lock in state.locks.iter_mut().filter(|l| {
            &l.tenant_id == tenant && l.status == LockStatus::Held && l.registered_at < cutoff
        }) {
            lock.status = LockStatus::Released;
            released += 1;
        }
        Ok(released)
    }
}

#[async_trait]
impl TaskStore for MemoryCollectorStore {
    async fn insert_task_if_absent(&self, task: &ScheduledTask) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let key = (task.tenant_id.clone(), task.task_id.clone());
        if state.tasks.contains_key(&key) {
            return Ok(false);
        }
        state.tasks.insert(key, task.clone());
        Ok(true)
    }

    async fn get_task(&self, tenant: &TenantId, task_id: &str) -> DbResult<Option<ScheduledTask>> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .get(&(tenant.clone(), task_id.to_string()))
            .cloned())
    }

    async fn list_initial_tasks(
        &self,
        tenant: &TenantId,
        limit: i64,
    ) -> DbResult<Vec<ScheduledTask>> {
        let state = self.state.lock().await;
        let mut tasks: Vec<_> = state
            .tasks
            .values()
            .filter(|t| &t.tenant_id == tenant && t.status == UnitStatus::Initial)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| unit_order(a.priority, &a.resource_id, b.priority, &b.resource_id));
        tasks.truncate(limit_of(limit));
        Ok(tasks)
    }

    async fn claim_task(&self, tenant: &TenantId, task_id: &str) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(&(tenant.clone(), task_id.to_string())) {
            Some(task) if task.status == UnitStatus::Initial => {
                let now = Utc::now();
                task.status = UnitStatus::Processing;
                task.started_at = Some(now);
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_task(
        &self,
        tenant: &TenantId,
        task_id: &str,
        result: Option<serde_json::Value>,
    ) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(&(tenant.clone(), task_id.to_string())) {
            Some(task) if task.status == UnitStatus::Processing => {
                task.status = UnitStatus::Done;
                task.result = result;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_task(
        &self,
        tenant: &TenantId,
        task_id: &str,
        result: Option<serde_json::Value>,
    ) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(&(tenant.clone(), task_id.to_string())) {
            Some(task) if task.status == UnitStatus::Processing => {
                task.status = UnitStatus::Failed;
                task.result = result;
                task.retry_count += 1;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_stale_tasks(&self, tenant: &TenantId, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        let mut reset = 0;
        for task in state.tasks.values_mut().filter(|t| {
            &t.tenant_id == tenant
                && t.status == UnitStatus::Processing
                && t.started_at.is_some_and(|at| at < cutoff)
        }) {
            task.status = UnitStatus::Initial;
            task.started_at = None;
            task.updated_at = Utc::now();
            reset += 1;
        }
        Ok(reset)
    }

    async fn requeue_failed_tasks(
        &self,
        tenant: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        let mut requeued = 0;
        for task in state.tasks.values_mut().filter(|t| {
            &t.tenant_id == tenant
                && t.status == UnitStatus::Failed
                && t.retry_count < t.max_retries
                && t.updated_at < cutoff
        }) {
            task.status = UnitStatus::Initial;
            task.started_at = None;
            task.updated_at = Utc::now();
            requeued += 1;
        }
        Ok(requeued)
    }
}

#[async_trait]
impl TriggerStore for MemoryCollectorStore {
    async fn insert_plan(&self, plan: &TriggerPlan) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state
            .events
            .insert(plan.event.event_trigger_id, plan.event.clone());
        for module in &plan.modules {
            state.modules.insert(module.module_trigger_id, module.clone());
        }
        for model in &plan.models {
            state.models.insert(model.model_trigger_id, model.clone());
        }
        for table in &plan.tables {
            state.tables.insert(table.table_trigger_id, table.clone());
        }
        Ok(())
    }

    async fn get_event(&self, tenant: &TenantId, event_id: Uuid) -> DbResult<Option<TriggerEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .get(&event_id)
            .filter(|e| &e.tenant_id == tenant)
            .cloned())
    }

    async fn list_open_events(&self, tenant: &TenantId, limit: i64) -> DbResult<Vec<TriggerEvent>> {
        let state = self.state.lock().await;
        let mut events: Vec<_> = state
            .events
            .values()
            .filter(|e| &e.tenant_id == tenant && !e.is_finished)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        events.truncate(limit_of(limit));
        Ok(events)
    }

    async fn list_modules(
        &self,
        tenant: &TenantId,
        event_id: Uuid,
    ) -> DbResult<Vec<TriggerModule>> {
        let state = self.state.lock().await;
        let mut modules: Vec<_> = state
            .modules
            .values()
            .filter(|m| &m.tenant_id == tenant && m.event_trigger_id == event_id)
            .cloned()
            .collect();
        modules.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.module_name.cmp(&b.module_name)));
        Ok(modules)
    }

    async fn list_models(&self, tenant: &TenantId, event_id: Uuid) -> DbResult<Vec<TriggerModel>> {
        let state = self.state.lock().await;
        let mut models: Vec<_> = state
            .models
            .values()
            .filter(|m| &m.tenant_id == tenant && m.event_trigger_id == event_id)
            .cloned()
            .collect();
        models.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.model_name.cmp(&b.model_name)));
        Ok(models)
    }

    async fn list_tables(&self, tenant: &TenantId, event_id: Uuid) -> DbResult<Vec<TriggerTable>> {
        let state = self.state.lock().await;
        let mut tables: Vec<_> = state
            .tables
            .values()
            .filter(|t| &t.tenant_id == tenant && t.event_trigger_id == event_id)
            .cloned()
            .collect();
        tables.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.table_name.cmp(&b.table_name)));
        Ok(tables)
    }

    async fn get_table(&self, tenant: &TenantId, table_id: Uuid) -> DbResult<Option<TriggerTable>> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .get(&table_id)
            .filter(|t| &t.tenant_id == tenant)
            .cloned())
    }

    async fn mark_table_extracted(
        &self,
        tenant: &TenantId,
        table_id: Uuid,
        record_count: i64,
    ) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state.tables.get_mut(&table_id) {
            Some(table) if &table.tenant_id == tenant && !table.is_extracted => {
                table.is_extracted = true;
                table.record_count = record_count;
                Ok(true)
            }
            Some(table) if &table.tenant_id == tenant => Ok(false),
            _ => Err(DbError::not_found("Trigger table", table_id)),
        }
    }

    async fn finish_node(&self, tenant: &TenantId, node: TriggerNode) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let flag = match node {
            TriggerNode::Module(id) => state
                .modules
                .get_mut(&id)
                .filter(|m| &m.tenant_id == tenant)
                .map(|m| &mut m.is_finished),
            TriggerNode::Model(id) => state
                .models
                .get_mut(&id)
                .filter(|m| &m.tenant_id == tenant)
                .map(|m| &mut m.is_finished),
            TriggerNode::Table(id) => state
                .tables
                .get_mut(&id)
                .filter(|t| &t.tenant_id == tenant)
                .map(|t| &mut t.is_finished),
        };
        match flag {
            Some(flag) if !*flag => {
                *flag = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn advance_event(
        &self,
        tenant: &TenantId,
        event_id: Uuid,
        status: EventStatus,
    ) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state.events.get_mut(&event_id) {
            Some(event) if &event.tenant_id == tenant && event.status.code() < status.code() => {
                event.status = status;
                if status == EventStatus::Finished {
                    event.is_finished = true;
                    event.finished_at = Some(Utc::now());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ChangeDataStore for MemoryCollectorStore {
    async fn insert_records(&self, records: &[ChangeDataRecord]) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for record in records {
            if !state.records.contains_key(&record.record_id) {
                state.records.insert(record.record_id, record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn claim_records(
        &self,
        tenant: &TenantId,
        limit: i64,
    ) -> DbResult<Vec<ChangeDataRecord>> {
        let mut state = self.state.lock().await;
        let mut candidates: Vec<_> = state
            .records
            .values()
            .filter(|r| &r.tenant_id == tenant && r.status == UnitStatus::Initial)
            .map(|r| (r.resource_id.clone(), r.record_id))
            .collect();
        candidates.sort();
        candidates.truncate(limit_of(limit));

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(record) = state.records.get_mut(&id) {
                record.status = UnitStatus::Processing;
                record.started_at = Some(now);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn stage_json(
        &self,
        tenant: &TenantId,
        record_ids: &[Uuid],
        units: &[ChangeDataJson],
    ) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        let mut staged = 0;
        for unit in units {
            let key = unit.entity_key();
            let live = state
                .json
                .values_mut()
                .find(|j| j.tenant_id == unit.tenant_id && j.entity_key() == key);
            match live {
                None => {
                    state.json.insert(unit.json_id, unit.clone());
                    staged += 1;
                }
                Some(live) if live.status == UnitStatus::Processing => {}
                Some(live) => {
                    live.absorb(unit);
                    staged += 1;
                }
            }
        }

        let busy: HashSet<EntityKey> = state
            .json
            .values()
            .filter(|j| &j.tenant_id == tenant && j.status == UnitStatus::Processing)
            .map(ChangeDataJson::entity_key)
            .collect();
        for id in record_ids {
            if let Some(record) = state.records.get_mut(id).filter(|r| &r.tenant_id == tenant) {
                if busy.contains(&record.entity_key()) {
                    record.status = UnitStatus::Initial;
                    record.started_at = None;
                } else {
                    record.status = UnitStatus::Done;
                }
            }
        }
        Ok(staged)
    }

    async fn list_initial_json(&self, tenant: &TenantId, limit: i64) -> DbResult<Vec<PendingJson>> {
        let state = self.state.lock().await;
        let mut pending = Vec::new();
        for json in state
            .json
            .values()
            .filter(|j| &j.tenant_id == tenant && j.status == UnitStatus::Initial)
        {
            let model = state
                .models
                .get(&json.model_trigger_id)
                .ok_or_else(|| DbError::not_found("Trigger model", json.model_trigger_id))?;
            pending.push(PendingJson {
                json: json.clone(),
                topic_code: model.topic_code.clone(),
                priority: model.priority,
                parallel: model.parallel,
                model_depend_on: model.depend_on.clone(),
            });
        }
        pending.sort_by(|a, b| {
            unit_order(a.priority, &a.json.resource_id, b.priority, &b.json.resource_id)
        });
        pending.truncate(limit_of(limit));
        Ok(pending)
    }

    async fn claim_json(&self, tenant: &TenantId, json_id: Uuid) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state.json.get_mut(&json_id) {
            Some(json) if &json.tenant_id == tenant && json.status == UnitStatus::Initial => {
                let now = Utc::now();
                json.status = UnitStatus::Processing;
                json.started_at = Some(now);
                json.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn archive_json(
        &self,
        tenant: &TenantId,
        history: &ChangeDataJsonHistory,
    ) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state
            .json
            .get(&history.json_id)
            .filter(|j| &j.tenant_id == tenant && j.status == UnitStatus::Processing)
            .ok_or_else(|| DbError::not_found("Processing json unit", history.json_id))?;
        state.json.remove(&history.json_id);
        state.history.push(history.clone());
        Ok(())
    }

    async fn fail_json(&self, tenant: &TenantId, history: &ChangeDataJsonHistory) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let live = state
            .json
            .get_mut(&history.json_id)
            .filter(|j| &j.tenant_id == tenant && j.status == UnitStatus::Processing)
            .ok_or_else(|| DbError::not_found("Processing json unit", history.json_id))?;
        live.status = UnitStatus::Failed;
        live.retry_count += 1;
        live.last_error = history.error_message.clone();
        live.updated_at = Utc::now();
        state.history.push(history.clone());
        Ok(())
    }

    async fn reset_stale_records(
        &self,
        tenant: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        let mut reset = 0;
        for record in state.records.values_mut().filter(|r| {
            &r.tenant_id == tenant
                && r.status == UnitStatus::Processing
                && r.started_at.is_some_and(|at| at < cutoff)
        }) {
            record.status = UnitStatus::Initial;
            record.started_at = None;
            reset += 1;
        }
        Ok(reset)
    }

    async fn reset_stale_json(&self, tenant: &TenantId, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        let mut reset = 0;
        for json in state.json.values_mut().filter(|j| {
            &j.tenant_id == tenant
                && j.status == UnitStatus::Processing
                && j.started_at.is_some_and(|at| at < cutoff)
        }) {
            json.status = UnitStatus::Initial;
            json.started_at = None;
            json.updated_at = Utc::now();
            reset += 1;
        }
        Ok(reset)
    }

    async fn requeue_failed_json(
        &self,
        tenant: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        let mut requeued = 0;
        for json in state.json.values_mut().filter(|j| {
            &j.tenant_id == tenant
                && j.status == UnitStatus::Failed
                && j.retry_count < j.max_retries
                && j.updated_at < cutoff
        }) {
            json.status = UnitStatus::Initial;
            json.started_at = None;
            json.updated_at = Utc::now();
            requeued += 1;
        }
        Ok(requeued)
    }

    async fn table_counts(&self, tenant: &TenantId, table_id: Uuid) -> DbResult<TableCounts> {
        let state = self.state.lock().await;
        let count = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);

        let records_open = state
            .records
            .values()
            .filter(|r| {
                &r.tenant_id == tenant && r.table_trigger_id == table_id && r.status.is_open()
            })
            .count();
        let json_open = state
            .json
            .values()
            .filter(|j| &j.tenant_id == tenant && j.table_trigger_id == table_id)
            .count();
        let (succeeded, failed) = state
            .history
            .iter()
            .filter(|h| &h.tenant_id == tenant && h.table_trigger_id == table_id)
            .fold((0, 0), |(ok, err), h| match h.outcome {
                HistoryOutcome::Success => (ok + 1, err),
                HistoryOutcome::Failed => (ok, err + 1),
            });

        Ok(TableCounts {
            records_open: count(records_open),
            json_open: count(json_open),
            succeeded: count(succeeded),
            failed: count(failed),
        })
    }
}

#[async_trait]
impl DependencyIndex for MemoryCollectorStore {
    async fn count_open(&self, tenant: &TenantId, dependence: &Dependence) -> DbResult<i64> {
        let state = self.state.lock().await;
        let json = state
            .json
            .values()
            .filter(|j| {
                &j.tenant_id == tenant && dependence.targets(&j.model_name, &j.object_id)
            })
            .count();
        let tasks = state
            .tasks
            .values()
            .filter(|t| {
                &t.tenant_id == tenant
                    && t.status.is_open()
                    && dependence.targets(&t.model_name, &t.object_id)
            })
            .count();
        Ok(i64::try_from(json + tasks).unwrap_or(i64::MAX))
    }

    async fn count_open_before(
        &self,
        tenant: &TenantId,
        model_name: &str,
        object_id: &str,
        before: &ResourceId,
    ) -> DbResult<i64> {
        let state = self.state.lock().await;
        let json = state
            .json
            .values()
            .filter(|j| {
                &j.tenant_id == tenant
                    && j.model_name == model_name
                    && j.object_id == object_id
                    && &j.resource_id < before
            })
            .count();
        let tasks = state
            .tasks
            .values()
            .filter(|t| {
                &t.tenant_id == tenant
                    && t.status.is_open()
                    && t.model_name == model_name
                    && t.object_id == object_id
                    && &t.resource_id < before
            })
            .count();
        Ok(i64::try_from(json + tasks).unwrap_or(i64::MAX))
    }

    async fn count_unfinished_models(
        &self,
        tenant: &TenantId,
        event_id: Uuid,
        model_names: &[String],
    ) -> DbResult<i64> {
        let state = self.state.lock().await;
        let unfinished = state
            .models
            .values()
            .filter(|m| {
                &m.tenant_id == tenant
                    && m.event_trigger_id == event_id
                    && !m.is_finished
                    && model_names.contains(&m.model_name)
            })
            .count();
        Ok(i64::try_from(unfinished).unwrap_or(i64::MAX))
    }
}
