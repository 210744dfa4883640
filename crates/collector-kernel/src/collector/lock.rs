//! Competitive lock manager
//!
//! Mutual exclusion between workers rests entirely on the storage layer's
//! partial unique index over HELD rows. Acquisition never blocks: a held
//! resource is skipped and retried on the next cycle.

use anyhow::{Context, Result};
use chrono::Utc;
use collector_common::TenantId;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::LockStore;
use super::types::{CompetitiveLock, LockKind, LockStatus};

/// What to lock, with its namespaced resource name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub resource_id: String,
    pub kind: LockKind,
    pub model_name: Option<String>,
    pub object_id: Option<String>,
}

impl LockRequest {
    pub fn generic(name: impl Into<String>) -> Self {
        Self {
            resource_id: name.into(),
            kind: LockKind::Generic,
            model_name: None,
            object_id: None,
        }
    }

    /// One object-storage key
    pub fn oss(key: &str) -> Self {
        Self {
            resource_id: format!("oss:{}", key),
            kind: LockKind::Oss,
            model_name: None,
            object_id: None,
        }
    }

    /// One business entity; serializes all versions of it
    pub fn unit(model_name: &str, object_id: &str) -> Self {
        Self {
            resource_id: format!("unit:{}~{}", model_name, object_id),
            kind: LockKind::Resource,
            model_name: Some(model_name.to_string()),
            object_id: Some(object_id.to_string()),
        }
    }

    /// A whole model, for models that must not run in parallel
    pub fn model(model_name: &str) -> Self {
        Self {
            resource_id: format!("model:{}", model_name),
            kind: LockKind::Resource,
            model_name: Some(model_name.to_string()),
            object_id: None,
        }
    }

    pub fn event(event_trigger_id: Uuid) -> Self {
        Self::generic(format!("event:{}", event_trigger_id))
    }
}

/// Identity written into `owner` on every lock this process takes
pub fn worker_identity() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

pub struct LockManager {
    store: Arc<dyn LockStore>,
    owner: String,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self::with_owner(store, worker_identity())
    }

    pub fn with_owner(store: Arc<dyn LockStore>, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Try to take the lock. `None` means another worker holds it.
    pub async fn acquire(
        &self,
        tenant: &TenantId,
        request: LockRequest,
    ) -> Result<Option<CompetitiveLock>> {
        let lock = CompetitiveLock {
            tenant_id: tenant.clone(),
            lock_id: Uuid::new_v4(),
            resource_id: request.resource_id,
            kind: request.kind,
            model_name: request.model_name,
            object_id: request.object_id,
            owner: self.owner.clone(),
            registered_at: Utc::now(),
            status: LockStatus::Held,
        };

        let inserted = self
            .store
            .insert_lock_if_absent(&lock)
            .await
            .with_context(|| format!("Failed to acquire lock {}", lock.resource_id))?;

        if inserted {
            debug!(
                tenant_id = %tenant,
                resource_id = %lock.resource_id,
                lock_id = %lock.lock_id,
                "Lock acquired"
            );
            Ok(Some(lock))
        } else {
            info!(
                tenant_id = %tenant,
                resource_id = %lock.resource_id,
                "Lock held by another worker, skipping"
            );
            Ok(None)
        }
    }

    /// Release a held lock. Returns `false` when it had already been
    /// released, usually by the reclaimer after a timeout.
    pub async fn release(&self, lock: &CompetitiveLock) -> Result<bool> {
        let released = self
            .store
            .release_lock(&lock.tenant_id, lock.lock_id)
            .await
            .with_context(|| format!("Failed to release lock {}", lock.resource_id))?;

        if released {
            debug!(
                tenant_id = %lock.tenant_id,
                resource_id = %lock.resource_id,
                lock_id = %lock.lock_id,
                "Lock released"
            );
        } else {
            warn!(
                tenant_id = %lock.tenant_id,
                resource_id = %lock.resource_id,
                lock_id = %lock.lock_id,
                "Lock was no longer held at release"
            );
        }

        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryCollectorStore;

    fn tenant() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    #[test]
    fn test_resource_names_are_namespaced() {
        assert_eq!(LockRequest::oss("in/acme/1~A~1").resource_id, "oss:in/acme/1~A~1");
        assert_eq!(LockRequest::unit("CLAIM", "55").resource_id, "unit:CLAIM~55");
        assert_eq!(LockRequest::model("CLAIM").resource_id, "model:CLAIM");
        assert_eq!(LockRequest::unit("CLAIM", "55").kind, LockKind::Resource);
        assert!(LockRequest::event(Uuid::nil()).resource_id.starts_with("event:"));
    }

    #[tokio::test]
    async fn test_second_acquire_is_contention() {
        let manager = LockManager::new(Arc::new(MemoryCollectorStore::new()));

        let first = manager.acquire(&tenant(), LockRequest::generic("r")).await.unwrap();
        let second = manager.acquire(&tenant(), LockRequest::generic("r")).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_release_allows_reacquire_and_keeps_rows() {
        let store = Arc::new(MemoryCollectorStore::new());
        let manager = LockManager::new(store.clone());

        let lock = manager
            .acquire(&tenant(), LockRequest::generic("r"))
            .await
            .unwrap()
            .unwrap();
        assert!(manager.release(&lock).await.unwrap());
        assert!(!manager.release(&lock).await.unwrap());

        assert!(manager
            .acquire(&tenant(), LockRequest::generic("r"))
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.locks(&tenant()).await.len(), 2);
    }

    #[tokio::test]
    async fn test_tenants_do_not_contend() {
        let manager = LockManager::new(Arc::new(MemoryCollectorStore::new()));
        let other = TenantId::parse("globex").unwrap();

        assert!(manager.acquire(&tenant(), LockRequest::generic("r")).await.unwrap().is_some());
        assert!(manager.acquire(&other, LockRequest::generic("r")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let store = Arc::new(MemoryCollectorStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let manager = LockManager::with_owner(store.clone(), format!("worker-{}", i));
            handles.push(tokio::spawn(async move {
                manager
                    .acquire(&tenant(), LockRequest::unit("CLAIM", "55"))
                    .await
                    .unwrap()
                    .is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
