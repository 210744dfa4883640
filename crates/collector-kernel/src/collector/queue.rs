//! Dispatch queues
//!
//! The scheduler runs the same cycle over two sources of work: json units
//! produced by the record stager, and scheduled tasks produced by
//! connectors. Each source is adapted to [`DispatchQueue`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use collector_common::TenantId;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::modules::ModuleCatalog;
use super::pipeline::Invocation;
use super::store::{ChangeDataStore, TaskStore};
use super::types::{ChangeDataJson, ChangeDataJsonHistory, HistoryOutcome, ScheduledTask};

/// Where a planned unit lives
#[derive(Debug, Clone)]
pub enum UnitSource {
    Json(Box<ChangeDataJson>),
    Task,
}

/// A unit ready for the lock and dependency checks
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Payload handed to the pipeline
    pub envelope: ScheduledTask,
    pub event_trigger_id: Option<Uuid>,
    pub parallel: bool,
    /// Models of the same event that must be finished first
    pub model_depend_on: Vec<String>,
    pub source: UnitSource,
}

impl WorkUnit {
    pub fn tenant(&self) -> &TenantId {
        &self.envelope.tenant_id
    }

    pub fn model_name(&self) -> &str {
        &self.envelope.model_name
    }

    pub fn object_id(&self) -> &str {
        &self.envelope.object_id
    }
}

#[async_trait]
pub trait DispatchQueue: Send + Sync {
    fn name(&self) -> &'static str;

    /// INITIAL units, ordered by priority then resource order
    async fn pending(&self, tenant: &TenantId, limit: i64) -> Result<Vec<WorkUnit>>;

    /// INITIAL -> PROCESSING. `false` if someone else moved it first.
    async fn claim(&self, unit: &WorkUnit) -> Result<bool>;

    async fn complete(&self, unit: &WorkUnit, invocation: &Invocation) -> Result<()>;

    async fn fail(
        &self,
        unit: &WorkUnit,
        invocation: Option<&Invocation>,
        reason: &str,
    ) -> Result<()>;
}

/// ChangeDataJson units; the envelope is built here
pub struct JsonQueue {
    store: Arc<dyn ChangeDataStore>,
}

impl JsonQueue {
    pub fn new(store: Arc<dyn ChangeDataStore>) -> Self {
        Self { store }
    }

    fn json_of(unit: &WorkUnit) -> Result<&ChangeDataJson> {
        match &unit.source {
            UnitSource::Json(json) => Ok(&**json),
            UnitSource::Task => anyhow::bail!(
                "Work unit {} is not a json unit",
                unit.envelope.task_id
            ),
        }
    }
}

#[async_trait]
impl DispatchQueue for JsonQueue {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn pending(&self, tenant: &TenantId, limit: i64) -> Result<Vec<WorkUnit>> {
        let pending = self
            .store
            .list_initial_json(tenant, limit)
            .await
            .context("Failed to list pending json units")?;

        Ok(pending
            .into_iter()
            .map(|p| {
                let json = p.json;
                let mut envelope = ScheduledTask::new(
                    json.tenant_id.clone(),
                    json.json_id.to_string(),
                    json.resource_id.clone(),
                    p.topic_code,
                    json.model_name.clone(),
                    json.object_id.clone(),
                    json.content.clone(),
                )
                .with_priority(p.priority)
                .with_max_retries(json.max_retries);
                envelope.depend_on = json.depend_on.clone();
                envelope.retry_count = json.retry_count;

                WorkUnit {
                    envelope,
                    event_trigger_id: Some(json.event_trigger_id),
                    parallel: p.parallel,
                    model_depend_on: p.model_depend_on,
                    source: UnitSource::Json(Box::new(json)),
                }
            })
            .collect())
    }

    async fn claim(&self, unit: &WorkUnit) -> Result<bool> {
        let json = Self::json_of(unit)?;
        self.store
            .claim_json(unit.tenant(), json.json_id)
            .await
            .context("Failed to claim json unit")
    }

    async fn complete(&self, unit: &WorkUnit, invocation: &Invocation) -> Result<()> {
        let json = Self::json_of(unit)?;
        let history = ChangeDataJsonHistory::from_json(
            json,
            HistoryOutcome::Success,
            invocation.trace_id.clone(),
            invocation.result.clone(),
            None,
        );
        self.store
            .archive_json(unit.tenant(), &history)
            .await
            .context("Failed to archive json unit")
    }

    async fn fail(
        &self,
        unit: &WorkUnit,
        invocation: Option<&Invocation>,
        reason: &str,
    ) -> Result<()> {
        let json = Self::json_of(unit)?;
        let history = ChangeDataJsonHistory::from_json(
            json,
            HistoryOutcome::Failed,
            invocation.and_then(|i| i.trace_id.clone()),
            invocation.and_then(|i| i.result.clone()),
            Some(reason.to_string()),
        );
        self.store
            .fail_json(unit.tenant(), &history)
            .await
            .context("Failed to record json failure")
    }
}

/// Scheduled tasks written by connectors. The catalog decides whether a
/// task's model dispatches per object or one unit at a time.
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    catalog: Arc<ModuleCatalog>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, catalog: Arc<ModuleCatalog>) -> Self {
        Self { store, catalog }
    }
}

#[async_trait]
impl DispatchQueue for TaskQueue {
    fn name(&self) -> &'static str {
        "task"
    }

    async fn pending(&self, tenant: &TenantId, limit: i64) -> Result<Vec<WorkUnit>> {
        let tasks = self
            .store
            .list_initial_tasks(tenant, limit)
            .await
            .context("Failed to list pending tasks")?;

        Ok(tasks
            .into_iter()
            .map(|task| WorkUnit {
                parallel: self
                    .catalog
                    .model(&task.model_name)
                    .map_or(true, |model| model.parallel),
                envelope: task,
                event_trigger_id: None,
                model_depend_on: Vec::new(),
                source: UnitSource::Task,
            })
            .collect())
    }

    async fn claim(&self, unit: &WorkUnit) -> Result<bool> {
        self.store
            .claim_task(unit.tenant(), &unit.envelope.task_id)
            .await
            .context("Failed to claim task")
    }

    async fn complete(&self, unit: &WorkUnit, invocation: &Invocation) -> Result<()> {
        let result = json!({
            "traceId": invocation.trace_id,
            "result": invocation.result,
        });
        let updated = self
            .store
            .complete_task(unit.tenant(), &unit.envelope.task_id, Some(result))
            .await
            .context("Failed to complete task")?;
        if !updated {
            warn!(
                tenant_id = %unit.tenant(),
                task_id = %unit.envelope.task_id,
                "Task left PROCESSING before completion was recorded"
            );
        }
        Ok(())
    }

    async fn fail(
        &self,
        unit: &WorkUnit,
        invocation: Option<&Invocation>,
        reason: &str,
    ) -> Result<()> {
        let result = json!({
            "traceId": invocation.and_then(|i| i.trace_id.clone()),
            "result": invocation.and_then(|i| i.result.clone()),
            "error": reason,
        });
        let updated = self
            .store
            .fail_task(unit.tenant(), &unit.envelope.task_id, Some(result))
            .await
            .context("Failed to record task failure")?;
        if !updated {
            warn!(
                tenant_id = %unit.tenant(),
                task_id = %unit.envelope.task_id,
                "Task left PROCESSING before failure was recorded"
            );
        }
        Ok(())
    }
}
