//! Progress monitor
//!
//! Read-only view over the hierarchy and the change data tables. Nothing here
//! takes a lock, so the numbers are a snapshot that may trail concurrent
//! workers by one transition.

use anyhow::{Context, Result};
use async_trait::async_trait;
use collector_common::TenantId;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use super::store::{ChangeDataStore, TriggerStore};
use super::types::{EventStatus, TriggerTable};
use crate::worker::PeriodicJob;

pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableStatus {
    NotExtracted = 0,
    InProgress = 1,
    Complete = 2,
}

impl TableStatus {
    pub fn code(self) -> i16 {
        self as i16
    }
}

/// `finished / (finished + unfinished)`, and 1.0 once nothing is unfinished
pub fn percent(finished: i64, unfinished: i64) -> f64 {
    if unfinished <= 0 {
        return 1.0;
    }
    let finished = finished.max(0) as f64;
    finished / (finished + unfinished as f64)
}

/// `errors / (finished + errors)`, 0.0 before the first attempt
pub fn error_rate(finished: i64, errors: i64) -> f64 {
    let attempts = finished.max(0) + errors.max(0);
    if attempts == 0 {
        return 0.0;
    }
    errors.max(0) as f64 / attempts as f64
}

#[derive(Debug, Clone, Serialize)]
pub struct TableProgress {
    pub table_trigger_id: Uuid,
    pub model_name: String,
    pub table_name: String,
    pub status: TableStatus,
    pub record_count: i64,
    pub records_open: i64,
    pub unfinished: i64,
    pub finished: i64,
    pub errors: i64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventProgress {
    pub event_trigger_id: Uuid,
    pub status: EventStatus,
    pub tables: Vec<TableProgress>,
    pub unfinished: i64,
    pub finished: i64,
    pub errors: i64,
    pub percent: f64,
    pub error_rate: f64,
}

pub struct Monitor {
    tenant: TenantId,
    triggers: Arc<dyn TriggerStore>,
    data: Arc<dyn ChangeDataStore>,
    interval: Duration,
}

impl Monitor {
    pub fn new(
        tenant: TenantId,
        triggers: Arc<dyn TriggerStore>,
        data: Arc<dyn ChangeDataStore>,
        interval: Duration,
    ) -> Self {
        Self {
            tenant,
            triggers,
            data,
            interval,
        }
    }

    async fn progress_of(&self, table: &TriggerTable) -> Result<TableProgress> {
        let counts = self
            .data
            .table_counts(&self.tenant, table.table_trigger_id)
            .await
            .context("Failed to count table progress")?;

        let status = if !table.is_extracted {
            TableStatus::NotExtracted
        } else if counts.records_open == 0 && counts.json_open == 0 {
            TableStatus::Complete
        } else {
            TableStatus::InProgress
        };

        Ok(TableProgress {
            table_trigger_id: table.table_trigger_id,
            model_name: table.model_name.clone(),
            table_name: table.table_name.clone(),
            status,
            record_count: table.record_count,
            records_open: counts.records_open,
            unfinished: counts.json_open,
            finished: counts.succeeded,
            errors: counts.failed,
            percent: percent(counts.succeeded, counts.json_open),
        })
    }

    pub async fn table_progress(&self, table_id: Uuid) -> Result<TableProgress> {
        let table = self
            .triggers
            .get_table(&self.tenant, table_id)
            .await
            .context("Failed to load trigger table")?
            .with_context(|| format!("Trigger table {} not found", table_id))?;
        self.progress_of(&table).await
    }

    pub async fn event_progress(&self, event_id: Uuid) -> Result<EventProgress> {
        let event = self
            .triggers
            .get_event(&self.tenant, event_id)
            .await
            .context("Failed to load trigger event")?
            .with_context(|| format!("Trigger event {} not found", event_id))?;
        let tables = self
            .triggers
            .list_tables(&self.tenant, event_id)
            .await
            .context("Failed to list trigger tables")?;

        let mut progress = Vec::with_capacity(tables.len());
        for table in &tables {
            progress.push(self.progress_of(table).await?);
        }

        let unfinished = progress.iter().map(|t| t.unfinished).sum();
        let finished = progress.iter().map(|t| t.finished).sum();
        let errors = progress.iter().map(|t| t.errors).sum();

        Ok(EventProgress {
            event_trigger_id: event.event_trigger_id,
            status: event.status,
            tables: progress,
            unfinished,
            finished,
            errors,
            percent: percent(finished, unfinished),
            error_rate: error_rate(finished, errors),
        })
    }

    /// Progress of every open event
    #[instrument(skip(self), fields(tenant_id = %self.tenant))]
    pub async fn report(&self, limit: i64) -> Result<Vec<EventProgress>> {
        let events = self
            .triggers
            .list_open_events(&self.tenant, limit)
            .await
            .context("Failed to list open events")?;

        let mut reports = Vec::with_capacity(events.len());
        for event in events {
            reports.push(self.event_progress(event.event_trigger_id).await?);
        }
        Ok(reports)
    }
}

#[async_trait]
impl PeriodicJob for Monitor {
    fn name(&self) -> String {
        format!("monitor-{}", self.tenant)
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<()> {
        for event in self.report(100).await? {
            info!(
                event_trigger_id = %event.event_trigger_id,
                status = ?event.status,
                finished = event.finished,
                unfinished = event.unfinished,
                errors = event.errors,
                percent = event.percent,
                error_rate = event.error_rate,
                "Event progress"
            );
        }
        Ok(())
    }
}
