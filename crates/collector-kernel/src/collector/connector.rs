//! Object storage ingestion connector
//!
//! Drains `{prefix}/{tenant}/` of a bucket into the scheduled task queue.
//! Every key is handled under its own `oss:` lock so any number of connector
//! instances can poll the same prefix. The source object is only deleted
//! after the task row exists; a crash in between re-ingests the same key,
//! which maps onto the same deterministic task id.

use anyhow::{Context, Result};
use async_trait::async_trait;
use collector_common::TenantId;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::key::{file_name, ObjectKey};
use super::lock::{LockManager, LockRequest};
use super::modules::ModuleCatalog;
use super::stager::DEFAULT_MAX_RETRIES;
use super::store::TaskStore;
use super::types::ScheduledTask;
use crate::storage::ObjectStore;
use crate::worker::PeriodicJob;

pub const DEFAULT_CONNECTOR_PREFIX: &str = "inbox";
pub const DEFAULT_DEAD_LETTER_PREFIX: &str = "dead-letter";
pub const DEFAULT_CONNECTOR_MAX_KEYS: i32 = 100;
pub const DEFAULT_CONNECTOR_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub prefix: String,
    pub dead_letter_prefix: String,
    pub max_keys: i32,
    /// Topic for models missing from the module catalog. Without one, such
    /// keys are dead-lettered.
    pub default_topic_code: Option<String>,
    pub max_retries: i32,
    pub interval: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_CONNECTOR_PREFIX.to_string(),
            dead_letter_prefix: DEFAULT_DEAD_LETTER_PREFIX.to_string(),
            max_keys: DEFAULT_CONNECTOR_MAX_KEYS,
            default_topic_code: None,
            max_retries: DEFAULT_MAX_RETRIES,
            interval: Duration::from_secs(DEFAULT_CONNECTOR_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectorReport {
    pub listed: usize,
    pub ingested: usize,
    /// Keys whose task already existed; the object was still removed
    pub duplicates: usize,
    pub dead_lettered: usize,
    pub locked: usize,
    pub errors: usize,
}

enum KeyOutcome {
    Ingested,
    Duplicate,
    DeadLettered,
}

/// Deterministic task id for an object key
pub fn task_id_for(tenant: &TenantId, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Object payloads are JSON; anything else is carried as a JSON string
fn payload_of(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

pub struct OssConnector {
    tenant: TenantId,
    objects: Arc<dyn ObjectStore>,
    tasks: Arc<dyn TaskStore>,
    locks: Arc<LockManager>,
    catalog: Arc<ModuleCatalog>,
    config: ConnectorConfig,
}

impl OssConnector {
    pub fn new(
        tenant: TenantId,
        objects: Arc<dyn ObjectStore>,
        tasks: Arc<dyn TaskStore>,
        locks: Arc<LockManager>,
        catalog: Arc<ModuleCatalog>,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            tenant,
            objects,
            tasks,
            locks,
            catalog,
            config,
        }
    }

    pub fn inbox_prefix(&self) -> String {
        format!("{}/{}/", self.config.prefix, self.tenant)
    }

    pub fn dead_letter_key(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.dead_letter_prefix,
            self.tenant,
            file_name(key)
        )
    }

    #[instrument(skip(self), fields(tenant_id = %self.tenant))]
    pub async fn run_cycle(&self) -> Result<ConnectorReport> {
        let prefix = self.inbox_prefix();
        let keys = self
            .objects
            .list(&prefix, self.config.max_keys)
            .await
            .with_context(|| format!("Failed to list objects under {}", prefix))?;

        let mut report = ConnectorReport {
            listed: keys.len(),
            ..ConnectorReport::default()
        };

        for key in keys {
            let Some(lock) = self.locks.acquire(&self.tenant, LockRequest::oss(&key)).await? else {
                report.locked += 1;
                continue;
            };

            let outcome = self.process_key(&key).await;

            self.locks
                .release(&lock)
                .await
                .context("Lock release failed, aborting connector cycle")?;

            match outcome {
                Ok(KeyOutcome::Ingested) => report.ingested += 1,
                Ok(KeyOutcome::Duplicate) => report.duplicates += 1,
                Ok(KeyOutcome::DeadLettered) => report.dead_lettered += 1,
                Err(e) => {
                    error!(key = %key, "Object ingestion failed: {:#}", e);
                    report.errors += 1;
                }
            }
        }

        if report.listed > 0 {
            info!(
                listed = report.listed,
                ingested = report.ingested,
                duplicates = report.duplicates,
                dead_lettered = report.dead_lettered,
                locked = report.locked,
                errors = report.errors,
                "Connector cycle finished"
            );
        }

        Ok(report)
    }

    async fn process_key(&self, key: &str) -> Result<KeyOutcome> {
        let object_key = match ObjectKey::from_path(key) {
            Ok(object_key) => object_key,
            Err(e) => {
                warn!(key = %key, "Object key pattern error: {}", e);
                self.dead_letter(key).await?;
                return Ok(KeyOutcome::DeadLettered);
            }
        };

        let model = self.catalog.model(&object_key.model_name);
        let topic_code = model
            .map(|m| m.topic_code.clone())
            .or_else(|| self.config.default_topic_code.clone());
        let Some(topic_code) = topic_code else {
            warn!(
                key = %key,
                model_name = %object_key.model_name,
                "No topic configured for model"
            );
            self.dead_letter(key).await?;
            return Ok(KeyOutcome::DeadLettered);
        };
        let priority = model.map(|m| m.priority).unwrap_or_default();

        let bytes = self
            .objects
            .get(key)
            .await
            .with_context(|| format!("Failed to fetch object {}", key))?;

        let ObjectKey {
            resource_id,
            model_name,
            object_id,
            dependence,
        } = object_key;

        let task = ScheduledTask::new(
            self.tenant.clone(),
            task_id_for(&self.tenant, key),
            resource_id,
            topic_code,
            model_name,
            object_id,
            payload_of(&bytes),
        )
        .with_dependence(dependence)
        .with_priority(priority)
        .with_max_retries(self.config.max_retries)
        .with_source_key(key);

        let inserted = self
            .tasks
            .insert_task_if_absent(&task)
            .await
            .context("Failed to persist scheduled task")?;

        self.objects
            .delete(key)
            .await
            .with_context(|| format!("Failed to delete ingested object {}", key))?;

        if inserted {
            debug!(
                key = %key,
                task_id = %task.task_id,
                resource_id = %task.resource_id,
                model_name = %task.model_name,
                object_id = %task.object_id,
                "Object ingested"
            );
            Ok(KeyOutcome::Ingested)
        } else {
            debug!(key = %key, task_id = %task.task_id, "Task already existed");
            Ok(KeyOutcome::Duplicate)
        }
    }

    async fn dead_letter(&self, key: &str) -> Result<()> {
        let target = self.dead_letter_key(key);
        self.objects
            .copy(key, &target)
            .await
            .with_context(|| format!("Failed to copy {} to {}", key, target))?;
        self.objects
            .delete(key)
            .await
            .with_context(|| format!("Failed to delete dead-lettered object {}", key))?;
        info!(key = %key, target = %target, "Object dead-lettered");
        Ok(())
    }
}

#[async_trait]
impl PeriodicJob for OssConnector {
    fn name(&self) -> String {
        format!("connector-{}", self.tenant)
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn run_once(&self) -> Result<()> {
        self.run_cycle().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryCollectorStore;
    use crate::storage::MemoryObjectStore;
    use collector_common::Dependence;
    use serde_json::json;

    const CATALOG: &str = r#"
        [[module]]
        name = "claims"

        [[module.model]]
        name = "CLAIM"
        topic_code = "claims-sync"
        priority = 4
        tables = ["claim"]
    "#;

    fn tenant() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    struct Fixture {
        objects: Arc<MemoryObjectStore>,
        store: Arc<MemoryCollectorStore>,
        connector: OssConnector,
    }

    fn fixture(config: ConnectorConfig) -> Fixture {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = Arc::new(MemoryCollectorStore::new());
        let locks = Arc::new(LockManager::with_owner(store.clone(), "test-worker"));
        let catalog = Arc::new(ModuleCatalog::from_toml_str(CATALOG).unwrap());
        let connector = OssConnector::new(
            tenant(),
            objects.clone(),
            store.clone(),
            locks,
            catalog,
            config,
        );
        Fixture {
            objects,
            store,
            connector,
        }
    }

    #[test]
    fn test_task_id_is_deterministic_per_tenant() {
        let acme = tenant();
        let other = TenantId::parse("globex").unwrap();
        let key = "inbox/acme/1001~CLAIM~55";
        assert_eq!(task_id_for(&acme, key), task_id_for(&acme, key));
        assert_ne!(task_id_for(&acme, key), task_id_for(&other, key));
        assert_eq!(task_id_for(&acme, key).len(), 64);
    }

    #[test]
    fn test_payload_falls_back_to_string() {
        assert_eq!(payload_of(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(payload_of(b"not json"), json!("not json"));
    }

    #[tokio::test]
    async fn test_ingests_valid_keys() {
        let f = fixture(ConnectorConfig::default());
        f.objects
            .put("inbox/acme/1001~CLAIM~55", br#"{"amount":10}"#.to_vec())
            .await
            .unwrap();
        f.objects
            .put("inbox/acme/1002~CLAIM~55~POLICY~10", b"raw".to_vec())
            .await
            .unwrap();

        let report = f.connector.run_cycle().await.unwrap();
        assert_eq!(report.listed, 2);
        assert_eq!(report.ingested, 2);
        assert!(f.objects.keys().await.is_empty());

        let tasks = f.store.list_initial_tasks(&tenant(), 10).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].resource_id.as_str(), "1001");
        assert_eq!(tasks[0].topic_code, "claims-sync");
        assert_eq!(tasks[0].priority, 4);
        assert_eq!(tasks[0].content, json!({"amount": 10}));
        assert!(tasks[0].depend_on.is_empty());
        assert_eq!(tasks[1].depend_on, vec![Dependence::new("POLICY", "10")]);
        assert_eq!(tasks[1].content, json!("raw"));
        assert_eq!(
            tasks[1].source_key.as_deref(),
            Some("inbox/acme/1002~CLAIM~55~POLICY~10")
        );

        let locks = f.store.locks(&tenant()).await;
        assert_eq!(locks.len(), 2);
        assert!(locks.iter().all(|l| l.resource_id.starts_with("oss:")));
    }

    #[tokio::test]
    async fn test_bad_key_is_dead_lettered() {
        let f = fixture(ConnectorConfig::default());
        f.objects.put("inbox/acme/bad~key", b"{}".to_vec()).await.unwrap();

        let report = f.connector.run_cycle().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(f.objects.keys().await, vec!["dead-letter/acme/bad~key".to_string()]);
        assert!(f.store.list_initial_tasks(&tenant(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_model_uses_default_topic_or_dead_letters() {
        let f = fixture(ConnectorConfig::default());
        f.objects
            .put("inbox/acme/7~INVOICE~3", b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(f.connector.run_cycle().await.unwrap().dead_lettered, 1);

        let f = fixture(ConnectorConfig {
            default_topic_code: Some("fallback".to_string()),
            ..ConnectorConfig::default()
        });
        f.objects
            .put("inbox/acme/7~INVOICE~3", b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(f.connector.run_cycle().await.unwrap().ingested, 1);
        let tasks = f.store.list_initial_tasks(&tenant(), 10).await.unwrap();
        assert_eq!(tasks[0].topic_code, "fallback");
    }

    #[tokio::test]
    async fn test_reingest_after_crash_is_duplicate() {
        let f = fixture(ConnectorConfig::default());
        let key = "inbox/acme/1001~CLAIM~55";
        f.objects.put(key, b"{}".to_vec()).await.unwrap();
        f.connector.run_cycle().await.unwrap();

        // object reappears as if the delete had never happened
        f.objects.put(key, b"{}".to_vec()).await.unwrap();
        let report = f.connector.run_cycle().await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert!(!f.objects.contains(key).await);
        assert_eq!(f.store.list_initial_tasks(&tenant(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_held_oss_lock_skips_key() {
        let f = fixture(ConnectorConfig::default());
        let key = "inbox/acme/1001~CLAIM~55";
        f.objects.put(key, b"{}".to_vec()).await.unwrap();

        let other = LockManager::with_owner(f.store.clone(), "other-worker");
        other
            .acquire(&tenant(), LockRequest::oss(key))
            .await
            .unwrap()
            .unwrap();

        let report = f.connector.run_cycle().await.unwrap();
        assert_eq!(report.locked, 1);
        assert!(f.objects.contains(key).await);
    }

    #[tokio::test]
    async fn test_other_tenants_prefix_untouched() {
        let f = fixture(ConnectorConfig::default());
        f.objects
            .put("inbox/globex/1001~CLAIM~55", b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(f.connector.run_cycle().await.unwrap().listed, 0);
    }
}
