//! Test helpers for collector kernel integration tests
//!
//! Builds a complete kernel over the in-memory adapters, with a pipeline
//! double that records every invocation and fails on demand.

#![allow(dead_code)]

use async_trait::async_trait;
use collector_common::TenantId;
use collector_kernel::collector::{
    connector::{ConnectorConfig, OssConnector},
    dependency::DependencyResolver,
    hierarchy::TriggerHierarchy,
    lock::LockManager,
    modules::ModuleCatalog,
    monitor::Monitor,
    pipeline::{Credential, Invocation, PipelineError, PipelineInvoker},
    queue::{JsonQueue, TaskQueue},
    reclaimer::{ReclaimerConfig, TimeoutReclaimer},
    rollup::{CompletionRollup, RollupConfig},
    scheduler::{Scheduler, SchedulerConfig},
    stager::{RecordStager, StagerConfig},
    types::ScheduledTask,
};
use collector_kernel::db::MemoryCollectorStore;
use collector_kernel::storage::MemoryObjectStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const CATALOG: &str = r#"
    [[module]]
    name = "policies"
    priority = 1

    [[module.model]]
    name = "POLICY"
    topic_code = "policy-sync"
    tables = ["policy"]

    [[module]]
    name = "claims"
    priority = 2

    [[module.model]]
    name = "CLAIM"
    topic_code = "claims-sync"
    depend_on = ["POLICY"]
    tables = ["claim"]
"#;

pub fn tenant() -> TenantId {
    TenantId::parse("acme").unwrap()
}

/// One recorded pipeline call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub topic_code: String,
    pub resource_id: String,
    pub model_name: String,
    pub object_id: String,
}

/// Pipeline double. Objects listed in `failing` get an HTTP 500.
#[derive(Default)]
pub struct RecordingPipeline {
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Call>>,
}

impl RecordingPipeline {
    pub async fn fail_object(&self, object_id: &str) {
        self.failing.lock().await.insert(object_id.to_string());
    }

    pub async fn heal(&self) {
        self.failing.lock().await.clear();
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    pub async fn resources(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|c| c.resource_id.clone())
            .collect()
    }
}

#[async_trait]
impl PipelineInvoker for RecordingPipeline {
    async fn invoke(
        &self,
        topic_code: &str,
        payload: &ScheduledTask,
        credential: &Credential,
    ) -> Result<Invocation, PipelineError> {
        assert_eq!(credential.token(), "test-pat");
        self.calls.lock().await.push(Call {
            topic_code: topic_code.to_string(),
            resource_id: payload.resource_id.to_string(),
            model_name: payload.model_name.clone(),
            object_id: payload.object_id.clone(),
        });

        if self.failing.lock().await.contains(&payload.object_id) {
            return Err(PipelineError::Status {
                status: 500,
                body: "pipeline unavailable".to_string(),
            });
        }

        Ok(Invocation {
            trace_id: Some(format!("trace-{}", payload.task_id)),
            success: true,
            result: Some(serde_json::json!({"accepted": true})),
        })
    }
}

/// A single kernel instance over shared in-memory state
pub struct Kernel {
    pub store: Arc<MemoryCollectorStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub pipeline: Arc<RecordingPipeline>,
    pub catalog: Arc<ModuleCatalog>,
    pub locks: Arc<LockManager>,
}

impl Kernel {
    pub fn new() -> Self {
        let store = Arc::new(MemoryCollectorStore::new());
        Self::sharing(
            store,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(RecordingPipeline::default()),
            "worker-a",
        )
    }

    /// Another worker process over the same database, bucket and pipeline
    pub fn sharing(
        store: Arc<MemoryCollectorStore>,
        objects: Arc<MemoryObjectStore>,
        pipeline: Arc<RecordingPipeline>,
        owner: &str,
    ) -> Self {
        let catalog = Arc::new(ModuleCatalog::from_toml_str(CATALOG).unwrap());
        let locks = Arc::new(LockManager::with_owner(store.clone(), owner));
        Self {
            store,
            objects,
            pipeline,
            catalog,
            locks,
        }
    }

    pub fn peer(&self, owner: &str) -> Self {
        Self::sharing(
            self.store.clone(),
            self.objects.clone(),
            self.pipeline.clone(),
            owner,
        )
    }

    pub fn hierarchy(&self) -> TriggerHierarchy {
        TriggerHierarchy::new(self.catalog.clone(), self.store.clone(), self.store.clone())
    }

    pub fn connector(&self) -> OssConnector {
        OssConnector::new(
            tenant(),
            self.objects.clone(),
            self.store.clone(),
            self.locks.clone(),
            self.catalog.clone(),
            ConnectorConfig::default(),
        )
    }

    pub fn stager(&self) -> RecordStager {
        RecordStager::new(tenant(), self.store.clone(), StagerConfig::default())
    }

    pub fn task_scheduler(&self) -> Scheduler<TaskQueue> {
        Scheduler::new(
            tenant(),
            TaskQueue::new(self.store.clone(), self.catalog.clone()),
            self.locks.clone(),
            DependencyResolver::new(self.store.clone()),
            self.pipeline.clone(),
            Credential::new("test-pat"),
            SchedulerConfig::default(),
        )
    }

    pub fn json_scheduler(&self) -> Scheduler<JsonQueue> {
        Scheduler::new(
            tenant(),
            JsonQueue::new(self.store.clone()),
            self.locks.clone(),
            DependencyResolver::new(self.store.clone()),
            self.pipeline.clone(),
            Credential::new("test-pat"),
            SchedulerConfig::default(),
        )
    }

    pub fn rollup(&self) -> CompletionRollup {
        CompletionRollup::new(
            tenant(),
            self.store.clone(),
            self.store.clone(),
            self.locks.clone(),
            RollupConfig::default(),
        )
    }

    /// Reclaimer that requeues failed units immediately
    pub fn reclaimer(&self, timeout: Duration) -> TimeoutReclaimer {
        TimeoutReclaimer::new(
            tenant(),
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            ReclaimerConfig {
                timeout,
                retry_delay: Duration::ZERO,
                interval: Duration::from_secs(1),
            },
        )
    }

    pub fn monitor(&self) -> Monitor {
        Monitor::new(
            tenant(),
            self.store.clone(),
            self.store.clone(),
            Duration::from_secs(60),
        )
    }
}
