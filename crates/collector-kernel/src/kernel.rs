//! Wiring of the periodic components
//!
//! Storage, object store and pipeline handles are created once by the binary
//! and passed in here; every tenant gets its own set of jobs over the same
//! handles.

use collector_common::TenantId;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::collector::connector::{ConnectorConfig, OssConnector};
use crate::collector::dependency::DependencyResolver;
use crate::collector::lock::LockManager;
use crate::collector::modules::ModuleCatalog;
use crate::collector::monitor::Monitor;
use crate::collector::pipeline::{Credential, PipelineInvoker};
use crate::collector::queue::{JsonQueue, TaskQueue};
use crate::collector::reclaimer::{ReclaimerConfig, TimeoutReclaimer};
use crate::collector::rollup::{CompletionRollup, RollupConfig};
use crate::collector::scheduler::{Scheduler, SchedulerConfig};
use crate::collector::stager::{RecordStager, StagerConfig};
use crate::collector::store::{
    ChangeDataStore, DependencyIndex, LockStore, TaskStore, TriggerStore,
};
use crate::config::KernelConfig;
use crate::storage::ObjectStore;
use crate::worker::{PeriodicJob, Supervisor};

/// The store traits, usually all backed by one adapter
#[derive(Clone)]
pub struct KernelStores {
    pub locks: Arc<dyn LockStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub triggers: Arc<dyn TriggerStore>,
    pub data: Arc<dyn ChangeDataStore>,
    pub dependencies: Arc<dyn DependencyIndex>,
}

impl KernelStores {
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: LockStore + TaskStore + TriggerStore + ChangeDataStore + DependencyIndex + 'static,
    {
        Self {
            locks: store.clone(),
            tasks: store.clone(),
            triggers: store.clone(),
            data: store.clone(),
            dependencies: store,
        }
    }
}

#[derive(Clone)]
pub struct KernelServices {
    pub stores: KernelStores,
    pub objects: Arc<dyn ObjectStore>,
    pub pipeline: Arc<dyn PipelineInvoker>,
    pub catalog: Arc<ModuleCatalog>,
    pub locks: Arc<LockManager>,
}

/// Per-component settings shared by every tenant
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub credential: Credential,
    pub connector: ConnectorConfig,
    pub scheduler: SchedulerConfig,
    pub stager: StagerConfig,
    pub rollup: RollupConfig,
    pub reclaimer: ReclaimerConfig,
    pub monitor_interval: Duration,
}

impl From<&KernelConfig> for WorkerSettings {
    fn from(config: &KernelConfig) -> Self {
        Self {
            credential: config.pipeline.credential.clone(),
            connector: config.connector.clone(),
            scheduler: config.scheduler.clone(),
            stager: config.stager.clone(),
            rollup: config.rollup.clone(),
            reclaimer: config.reclaimer.clone(),
            monitor_interval: config.monitor_interval,
        }
    }
}

/// Every periodic job of one tenant
pub fn tenant_jobs(
    tenant: &TenantId,
    services: &KernelServices,
    settings: &WorkerSettings,
) -> Vec<Arc<dyn PeriodicJob>> {
    let stores = &services.stores;
    let resolver = || DependencyResolver::new(stores.dependencies.clone());

    let mut jobs: Vec<Arc<dyn PeriodicJob>> = Vec::with_capacity(7);
    jobs.push(Arc::new(OssConnector::new(
        tenant.clone(),
        services.objects.clone(),
        stores.tasks.clone(),
        services.locks.clone(),
        services.catalog.clone(),
        settings.connector.clone(),
    )));
    jobs.push(Arc::new(RecordStager::new(
        tenant.clone(),
        stores.data.clone(),
        settings.stager.clone(),
    )));
    jobs.push(Arc::new(Scheduler::new(
        tenant.clone(),
        JsonQueue::new(stores.data.clone()),
        services.locks.clone(),
        resolver(),
        services.pipeline.clone(),
        settings.credential.clone(),
        settings.scheduler.clone(),
    )));
    jobs.push(Arc::new(Scheduler::new(
        tenant.clone(),
        TaskQueue::new(stores.tasks.clone(), services.catalog.clone()),
        services.locks.clone(),
        resolver(),
        services.pipeline.clone(),
        settings.credential.clone(),
        settings.scheduler.clone(),
    )));
    jobs.push(Arc::new(CompletionRollup::new(
        tenant.clone(),
        stores.triggers.clone(),
        stores.data.clone(),
        services.locks.clone(),
        settings.rollup.clone(),
    )));
    jobs.push(Arc::new(TimeoutReclaimer::new(
        tenant.clone(),
        stores.locks.clone(),
        stores.tasks.clone(),
        stores.data.clone(),
        settings.reclaimer.clone(),
    )));
    jobs.push(Arc::new(Monitor::new(
        tenant.clone(),
        stores.triggers.clone(),
        stores.data.clone(),
        settings.monitor_interval,
    )));
    jobs
}

pub async fn spawn_tenant_workers(
    supervisor: &mut Supervisor,
    tenants: &[TenantId],
    services: &KernelServices,
    settings: &WorkerSettings,
) {
    for tenant in tenants {
        let jobs = tenant_jobs(tenant, services, settings);
        info!(tenant_id = %tenant, jobs = jobs.len(), "Spawning tenant workers");
        for job in jobs {
            supervisor.spawn(job).await;
        }
    }
}
