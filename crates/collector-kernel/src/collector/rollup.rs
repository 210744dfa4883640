//! Completion roll-up
//!
//! Walks the hierarchy of every unfinished event bottom-up and flips
//! `is_finished` where everything below is done. Each event is rolled up under
//! its own `event:` lock so that only one worker mutates it at a time.

use anyhow::{Context, Result};
use async_trait::async_trait;
use collector_common::TenantId;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};
use uuid::Uuid;

use super::lock::{LockManager, LockRequest};
use super::store::{ChangeDataStore, TriggerNode, TriggerStore};
use super::types::{EventStatus, TriggerEvent};
use crate::worker::PeriodicJob;

pub const DEFAULT_ROLLUP_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_ROLLUP_BATCH_SIZE: i64 = 50;

#[derive(Debug, Clone)]
pub struct RollupConfig {
    pub batch_size: i64,
    pub interval: Duration,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_ROLLUP_BATCH_SIZE,
            interval: Duration::from_secs(DEFAULT_ROLLUP_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupReport {
    pub events_checked: usize,
    pub events_locked: usize,
    pub tables_finished: usize,
    pub models_finished: usize,
    pub modules_finished: usize,
    pub events_finished: usize,
    pub errors: usize,
}

pub struct CompletionRollup {
    tenant: TenantId,
    triggers: Arc<dyn TriggerStore>,
    data: Arc<dyn ChangeDataStore>,
    locks: Arc<LockManager>,
    config: RollupConfig,
}

impl CompletionRollup {
    pub fn new(
        tenant: TenantId,
        triggers: Arc<dyn TriggerStore>,
        data: Arc<dyn ChangeDataStore>,
        locks: Arc<LockManager>,
        config: RollupConfig,
    ) -> Self {
        Self {
            tenant,
            triggers,
            data,
            locks,
            config,
        }
    }

    #[instrument(skip(self), fields(tenant_id = %self.tenant))]
    pub async fn run_cycle(&self) -> Result<RollupReport> {
        let events = self
            .triggers
            .list_open_events(&self.tenant, self.config.batch_size)
            .await
            .context("Failed to list open events")?;

        let mut report = RollupReport::default();
        for event in events {
            let request = LockRequest::event(event.event_trigger_id);
            let Some(lock) = self.locks.acquire(&self.tenant, request).await? else {
                report.events_locked += 1;
                continue;
            };

            let outcome = self.roll_up_event(&event, &mut report).await;

            self.locks
                .release(&lock)
                .await
                .context("Lock release failed, aborting roll-up cycle")?;
            match outcome {
                Ok(()) => report.events_checked += 1,
                Err(e) => {
                    error!(
                        event_trigger_id = %event.event_trigger_id,
                        "Roll-up failed: {:#}",
                        e
                    );
                    report.errors += 1;
                }
            }
        }

        if report.tables_finished + report.events_finished > 0 {
            info!(
                tables = report.tables_finished,
                models = report.models_finished,
                modules = report.modules_finished,
                events = report.events_finished,
                "Completion roll-up advanced"
            );
        }

        Ok(report)
    }

    async fn roll_up_event(&self, event: &TriggerEvent, report: &mut RollupReport) -> Result<()> {
        let tenant = &self.tenant;
        let event_id = event.event_trigger_id;

        let tables = self.triggers.list_tables(tenant, event_id).await?;
        let mut finished_tables: HashSet<Uuid> = HashSet::new();
        let mut any_extracted = false;

        for table in &tables {
            any_extracted |= table.is_extracted;
            if table.is_finished {
                finished_tables.insert(table.table_trigger_id);
                continue;
            }
            if !table.is_extracted {
                continue;
            }
            let counts = self.data.table_counts(tenant, table.table_trigger_id).await?;
            if counts.records_open == 0 && counts.json_open == 0 {
                if self
                    .triggers
                    .finish_node(tenant, TriggerNode::Table(table.table_trigger_id))
                    .await?
                {
                    report.tables_finished += 1;
                }
                finished_tables.insert(table.table_trigger_id);
            }
        }

        if any_extracted && event.status == EventStatus::Pending {
            self.triggers
                .advance_event(tenant, event_id, EventStatus::Running)
                .await?;
        }

        let models = self.triggers.list_models(tenant, event_id).await?;
        let mut finished_models: HashSet<Uuid> = HashSet::new();
        for model in &models {
            let done = model.is_finished
                || tables
                    .iter()
                    .filter(|t| t.model_trigger_id == model.model_trigger_id)
                    .all(|t| finished_tables.contains(&t.table_trigger_id));
            if !done {
                continue;
            }
            if !model.is_finished
                && self
                    .triggers
                    .finish_node(tenant, TriggerNode::Model(model.model_trigger_id))
                    .await?
            {
                report.models_finished += 1;
            }
            finished_models.insert(model.model_trigger_id);
        }

        let modules = self.triggers.list_modules(tenant, event_id).await?;
        let mut all_modules_done = true;
        for module in &modules {
            let done = module.is_finished
                || models
                    .iter()
                    .filter(|m| m.module_trigger_id == module.module_trigger_id)
                    .all(|m| finished_models.contains(&m.model_trigger_id));
            if !done {
                all_modules_done = false;
                continue;
            }
            if !module.is_finished
                && self
                    .triggers
                    .finish_node(tenant, TriggerNode::Module(module.module_trigger_id))
                    .await?
            {
                report.modules_finished += 1;
            }
        }

        if all_modules_done
            && self
                .triggers
                .advance_event(tenant, event_id, EventStatus::Finished)
                .await?
        {
            info!(event_trigger_id = %event_id, "Event finished");
            report.events_finished += 1;
        }

        Ok(())
    }
}

#[async_trait]
impl PeriodicJob for CompletionRollup {
    fn name(&self) -> String {
        format!("rollup-{}", self.tenant)
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn run_once(&self) -> Result<()> {
        self.run_cycle().await.map(|_| ())
    }
}
