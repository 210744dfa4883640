//! Capture submission and extraction hand-off
//!
//! A capture request fans out into the event -> module -> model -> table
//! hierarchy from the static module catalog. Extractors later hand their rows
//! back per table through [`TriggerHierarchy::ingest_records`].

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use collector_common::{Dependence, ResourceId, TenantId};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::modules::{CollectorModuleConfig, ModuleCatalog};
use super::store::{ChangeDataStore, TriggerStore};
use super::types::{
    ChangeDataRecord, EventStatus, TriggerEvent, TriggerModel, TriggerModule, TriggerPlan,
    TriggerTable, TriggerType, UnitStatus,
};

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub tenant: TenantId,
    pub trigger_type: TriggerType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Restrict the capture to these modules; `None` captures all of them
    pub modules: Option<Vec<String>>,
}

/// One row produced by an extractor
#[derive(Debug, Clone)]
pub struct ExtractedRow {
    pub resource_id: ResourceId,
    pub object_id: String,
    pub data_id: String,
    pub content: serde_json::Value,
    pub depend_on: Vec<Dependence>,
}

pub struct TriggerHierarchy {
    catalog: Arc<ModuleCatalog>,
    triggers: Arc<dyn TriggerStore>,
    data: Arc<dyn ChangeDataStore>,
}

impl TriggerHierarchy {
    pub fn new(
        catalog: Arc<ModuleCatalog>,
        triggers: Arc<dyn TriggerStore>,
        data: Arc<dyn ChangeDataStore>,
    ) -> Self {
        Self {
            catalog,
            triggers,
            data,
        }
    }

    fn selected_modules(&self, filter: Option<&[String]>) -> Result<Vec<&CollectorModuleConfig>> {
        let Some(names) = filter else {
            return Ok(self.catalog.modules.iter().collect());
        };
        names
            .iter()
            .map(|name| {
                self.catalog
                    .module(name)
                    .with_context(|| format!("Unknown module '{}'", name))
            })
            .collect()
    }

    /// Build the whole fan-out for a request without persisting it
    pub fn plan(&self, request: &CaptureRequest) -> Result<TriggerPlan> {
        if request.end_time < request.start_time {
            bail!(
                "Capture window ends before it starts: {} > {}",
                request.start_time,
                request.end_time
            );
        }

        let selected = self.selected_modules(request.modules.as_deref())?;
        if selected.is_empty() {
            bail!("Capture request selects no modules");
        }

        let tenant = &request.tenant;
        let event = TriggerEvent {
            tenant_id: tenant.clone(),
            event_trigger_id: Uuid::new_v4(),
            trigger_type: request.trigger_type,
            start_time: request.start_time,
            end_time: request.end_time,
            is_finished: false,
            status: EventStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
        };

        let mut plan = TriggerPlan {
            event,
            modules: Vec::new(),
            models: Vec::new(),
            tables: Vec::new(),
        };
        let event_id = plan.event.event_trigger_id;

        for module_config in selected {
            let module_id = Uuid::new_v4();
            plan.modules.push(TriggerModule {
                tenant_id: tenant.clone(),
                module_trigger_id: module_id,
                event_trigger_id: event_id,
                module_name: module_config.name.clone(),
                priority: module_config.priority,
                is_finished: false,
            });

            for model_config in &module_config.models {
                let model_id = Uuid::new_v4();
                plan.models.push(TriggerModel {
                    tenant_id: tenant.clone(),
                    model_trigger_id: model_id,
                    module_trigger_id: module_id,
                    event_trigger_id: event_id,
                    model_name: model_config.name.clone(),
                    topic_code: model_config.topic_code.clone(),
                    priority: model_config.priority,
                    parallel: model_config.parallel,
                    depend_on: model_config.depend_on.clone(),
                    is_finished: false,
                });

                plan.tables.extend(model_config.tables.iter().map(|table_name| TriggerTable {
                    tenant_id: tenant.clone(),
                    table_trigger_id: Uuid::new_v4(),
                    model_trigger_id: model_id,
                    module_trigger_id: module_id,
                    event_trigger_id: event_id,
                    model_name: model_config.name.clone(),
                    table_name: table_name.clone(),
                    priority: model_config.priority,
                    is_extracted: false,
                    record_count: 0,
                    is_finished: false,
                }));
            }
        }

        Ok(plan)
    }

    /// Validate a capture request and persist its fan-out atomically
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant))]
    pub async fn submit_capture(&self, request: &CaptureRequest) -> Result<TriggerPlan> {
        let plan = self.plan(request)?;
        self.triggers
            .insert_plan(&plan)
            .await
            .context("Failed to persist capture plan")?;

        info!(
            event_trigger_id = %plan.event.event_trigger_id,
            trigger_type = plan.event.trigger_type.as_str(),
            modules = plan.modules.len(),
            models = plan.models.len(),
            tables = plan.tables.len(),
            "Capture submitted"
        );
        Ok(plan)
    }

    /// Store a table's extracted rows and mark it extracted. Returns the
    /// number of records written.
    #[instrument(skip(self, rows), fields(tenant_id = %tenant, table_trigger_id = %table_id))]
    pub async fn ingest_records(
        &self,
        tenant: &TenantId,
        table_id: Uuid,
        rows: Vec<ExtractedRow>,
    ) -> Result<u64> {
        let table = self
            .triggers
            .get_table(tenant, table_id)
            .await
            .context("Failed to load trigger table")?
            .with_context(|| format!("Trigger table {} not found", table_id))?;
        if table.is_extracted {
            bail!("Trigger table {} was already extracted", table_id);
        }

        let now = Utc::now();
        let records: Vec<ChangeDataRecord> = rows
            .into_iter()
            .map(|row| ChangeDataRecord {
                tenant_id: tenant.clone(),
                record_id: Uuid::new_v4(),
                table_trigger_id: table.table_trigger_id,
                model_trigger_id: table.model_trigger_id,
                event_trigger_id: table.event_trigger_id,
                resource_id: row.resource_id,
                model_name: table.model_name.clone(),
                object_id: row.object_id,
                table_name: table.table_name.clone(),
                data_id: row.data_id,
                content: row.content,
                depend_on: row.depend_on,
                status: UnitStatus::Initial,
                started_at: None,
                created_at: now,
            })
            .collect();

        let inserted = if records.is_empty() {
            0
        } else {
            self.data
                .insert_records(&records)
                .await
                .context("Failed to store extracted records")?
        };

        let count = i64::try_from(records.len()).unwrap_or(i64::MAX);
        let marked = self
            .triggers
            .mark_table_extracted(tenant, table_id, count)
            .await
            .context("Failed to mark table extracted")?;
        if !marked {
            bail!("Trigger table {} was extracted concurrently", table_id);
        }

        info!(
            model_name = %table.model_name,
            table_name = %table.table_name,
            records = inserted,
            "Table extracted"
        );
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryCollectorStore;
    use chrono::Duration;
    use serde_json::json;

    const CATALOG: &str = r#"
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
        tables = ["claim", "claim_line"]
    "#;

    fn tenant() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    fn hierarchy(store: Arc<MemoryCollectorStore>) -> TriggerHierarchy {
        let catalog = ModuleCatalog::from_toml_str(CATALOG).unwrap();
        TriggerHierarchy::new(Arc::new(catalog), store.clone(), store)
    }

    fn request(modules: Option<Vec<String>>) -> CaptureRequest {
        let end = Utc::now();
        CaptureRequest {
            tenant: tenant(),
            trigger_type: TriggerType::Window,
            start_time: end - Duration::hours(1),
            end_time: end,
            modules,
        }
    }

    #[tokio::test]
    async fn test_submit_fans_out_whole_catalog() {
        let store = Arc::new(MemoryCollectorStore::new());
        let plan = hierarchy(store.clone()).submit_capture(&request(None)).await.unwrap();

        assert_eq!(plan.modules.len(), 2);
        assert_eq!(plan.models.len(), 2);
        assert_eq!(plan.tables.len(), 3);

        let event_id = plan.event.event_trigger_id;
        let stored = store.get_event(&tenant(), event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Pending);
        assert_eq!(store.list_tables(&tenant(), event_id).await.unwrap().len(), 3);
        let claim = plan.models.iter().find(|m| m.model_name == "CLAIM").unwrap();
        assert_eq!(claim.depend_on, vec!["POLICY".to_string()]);
    }

    #[tokio::test]
    async fn test_module_filter() {
        let store = Arc::new(MemoryCollectorStore::new());
        let hierarchy = hierarchy(store);

        let plan = hierarchy
            .submit_capture(&request(Some(vec!["claims".to_string()])))
            .await
            .unwrap();
        assert_eq!(plan.modules.len(), 1);
        assert_eq!(plan.tables.len(), 2);

        let err = hierarchy
            .submit_capture(&request(Some(vec!["billing".to_string()])))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("billing"));
    }

    #[tokio::test]
    async fn test_inverted_window_rejected() {
        let store = Arc::new(MemoryCollectorStore::new());
        let mut req = request(None);
        std::mem::swap(&mut req.start_time, &mut req.end_time);
        assert!(hierarchy(store).submit_capture(&req).await.is_err());
    }

    #[tokio::test]
    async fn test_ingest_marks_table_once() {
        let store = Arc::new(MemoryCollectorStore::new());
        let hierarchy = hierarchy(store.clone());
        let plan = hierarchy.submit_capture(&request(None)).await.unwrap();
        let table = plan.tables.iter().find(|t| t.table_name == "claim").unwrap();

        let rows = vec![ExtractedRow {
            resource_id: ResourceId::from("1001"),
            object_id: "55".to_string(),
            data_id: "55".to_string(),
            content: json!({"amount": 10}),
            depend_on: vec![Dependence::new("POLICY", "10")],
        }];
        let written = hierarchy
            .ingest_records(&tenant(), table.table_trigger_id, rows)
            .await
            .unwrap();
        assert_eq!(written, 1);

        let stored = store
            .get_table(&tenant(), table.table_trigger_id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_extracted);
        assert_eq!(stored.record_count, 1);
        let records = store.records(&tenant()).await;
        assert_eq!(records[0].model_name, "CLAIM");
        assert_eq!(records[0].table_name, "claim");

        assert!(hierarchy
            .ingest_records(&tenant(), table.table_trigger_id, Vec::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_empty_extraction_is_valid() {
        let store = Arc::new(MemoryCollectorStore::new());
        let hierarchy = hierarchy(store.clone());
        let plan = hierarchy.submit_capture(&request(None)).await.unwrap();
        let table = &plan.tables[0];

        let written = hierarchy
            .ingest_records(&tenant(), table.table_trigger_id, Vec::new())
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert!(hierarchy
            .ingest_records(&tenant(), Uuid::new_v4(), Vec::new())
            .await
            .is_err());
    }
}
