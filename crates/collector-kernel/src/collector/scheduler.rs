//! Dispatch scheduler
//!
//! One cycle walks the pending units of a [`DispatchQueue`] in priority and
//! resource order. For each unit:
//! 1. take the unit (or model) lock, skipping the unit if it is held
//! 2. check dependencies, skipping the unit if they are not complete
//! 3. claim it (INITIAL -> PROCESSING)
//! 4. invoke the pipeline and record DONE or FAILED
//! 5. release the lock, whatever happened above
//!
//! A failing unit never stops the cycle. A failing lock release does.

use anyhow::{Context, Result};
use async_trait::async_trait;
use collector_common::TenantId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use super::dependency::DependencyResolver;
use super::lock::{LockManager, LockRequest};
use super::pipeline::{Credential, PipelineInvoker};
use super::queue::{DispatchQueue, WorkUnit};
use crate::worker::PeriodicJob;

pub const DEFAULT_SCHEDULER_BATCH_SIZE: i64 = 200;
pub const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_size: i64,
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SCHEDULER_BATCH_SIZE,
            interval: Duration::from_secs(DEFAULT_SCHEDULER_INTERVAL_SECS),
        }
    }
}

/// Tally of one scheduler cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub listed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub locked: usize,
    pub not_ready: usize,
    pub already_claimed: usize,
    pub errors: usize,
}

impl CycleReport {
    pub fn dispatched(&self) -> usize {
        self.succeeded + self.failed
    }
}

enum UnitOutcome {
    Succeeded,
    Failed,
    NotReady,
    AlreadyClaimed,
}

pub struct Scheduler<Q> {
    tenant: TenantId,
    queue: Q,
    locks: Arc<LockManager>,
    resolver: DependencyResolver,
    pipeline: Arc<dyn PipelineInvoker>,
    credential: Credential,
    config: SchedulerConfig,
}

impl<Q: DispatchQueue> Scheduler<Q> {
    pub fn new(
        tenant: TenantId,
        queue: Q,
        locks: Arc<LockManager>,
        resolver: DependencyResolver,
        pipeline: Arc<dyn PipelineInvoker>,
        credential: Credential,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            tenant,
            queue,
            locks,
            resolver,
            pipeline,
            credential,
            config,
        }
    }

    #[instrument(skip(self), fields(tenant_id = %self.tenant, queue = self.queue.name()))]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let units = self.queue.pending(&self.tenant, self.config.batch_size).await?;
        let mut report = CycleReport {
            listed: units.len(),
            ..CycleReport::default()
        };

        for unit in units {
            let request = if unit.parallel {
                LockRequest::unit(unit.model_name(), unit.object_id())
            } else {
                LockRequest::model(unit.model_name())
            };

            let Some(lock) = self.locks.acquire(&self.tenant, request).await? else {
                report.locked += 1;
                continue;
            };

            let outcome = self.dispatch(&unit).await;

            self.locks
                .release(&lock)
                .await
                .context("Lock release failed, aborting scheduler cycle")?;

            match outcome {
                Ok(UnitOutcome::Succeeded) => report.succeeded += 1,
                Ok(UnitOutcome::Failed) => report.failed += 1,
                Ok(UnitOutcome::NotReady) => report.not_ready += 1,
                Ok(UnitOutcome::AlreadyClaimed) => report.already_claimed += 1,
                Err(e) => {
                    error!(
                        resource_id = %unit.envelope.resource_id,
                        model_name = %unit.envelope.model_name,
                        object_id = %unit.envelope.object_id,
                        task_id = %unit.envelope.task_id,
                        "Unit processing failed: {:#}",
                        e
                    );
                    report.errors += 1;
                }
            }
        }

        if report.listed > 0 {
            info!(
                listed = report.listed,
                succeeded = report.succeeded,
                failed = report.failed,
                locked = report.locked,
                not_ready = report.not_ready,
                errors = report.errors,
                "Scheduler cycle finished"
            );
        }

        Ok(report)
    }

    /// Everything that happens while the unit's lock is held
    async fn dispatch(&self, unit: &WorkUnit) -> Result<UnitOutcome> {
        if !self.resolver.is_satisfied(unit).await? {
            return Ok(UnitOutcome::NotReady);
        }

        if !self.queue.claim(unit).await? {
            return Ok(UnitOutcome::AlreadyClaimed);
        }

        let envelope = &unit.envelope;
        match self
            .pipeline
            .invoke(&envelope.topic_code, envelope, &self.credential)
            .await
        {
            Ok(invocation) if invocation.success => {
                self.queue.complete(unit, &invocation).await?;
                Ok(UnitOutcome::Succeeded)
            }
            Ok(invocation) => {
                warn!(
                    resource_id = %envelope.resource_id,
                    model_name = %envelope.model_name,
                    object_id = %envelope.object_id,
                    trace_id = ?invocation.trace_id,
                    "Pipeline reported failure"
                );
                self.queue
                    .fail(unit, Some(&invocation), "pipeline reported failure")
                    .await?;
                Ok(UnitOutcome::Failed)
            }
            Err(e) => {
                warn!(
                    resource_id = %envelope.resource_id,
                    model_name = %envelope.model_name,
                    object_id = %envelope.object_id,
                    "Pipeline invocation failed: {}",
                    e
                );
                self.queue.fail(unit, None, &e.to_string()).await?;
                Ok(UnitOutcome::Failed)
            }
        }
    }
}

#[async_trait]
impl<Q: DispatchQueue + 'static> PeriodicJob for Scheduler<Q> {
    fn name(&self) -> String {
        format!("scheduler-{}-{}", self.queue.name(), self.tenant)
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn run_once(&self) -> Result<()> {
        self.run_cycle().await.map(|_| ())
    }
}
