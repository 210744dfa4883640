//! Record stager
//!
//! Turns extracted ChangeDataRecords into ChangeDataJson units. Records are
//! claimed in resource order and grouped per entity
//! `(event, model, object, table, data id)`; each group becomes one unit whose
//! content is the key-wise merge of the group's objects, later versions
//! winning. A group whose entity already has a live unit is folded into it,
//! unless that unit is being dispatched; then its records wait for a later
//! cycle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use collector_common::{Dependence, TenantId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use super::store::ChangeDataStore;
use super::types::{merge_content, ChangeDataJson, ChangeDataRecord, EntityKey, UnitStatus};
use crate::worker::PeriodicJob;

pub const DEFAULT_STAGER_BATCH_SIZE: i64 = 500;
pub const DEFAULT_STAGER_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_MAX_RETRIES: i32 = 3;

#[derive(Debug, Clone)]
pub struct StagerConfig {
    pub batch_size: i64,
    pub max_retries: i32,
    pub interval: Duration,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_STAGER_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            interval: Duration::from_secs(DEFAULT_STAGER_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageReport {
    pub claimed: usize,
    pub staged: u64,
}

/// Collapse records into one json unit per entity
pub fn merge_records(records: Vec<ChangeDataRecord>, max_retries: i32) -> Vec<ChangeDataJson> {
    let mut groups: BTreeMap<EntityKey, Vec<ChangeDataRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.entity_key()).or_default().push(record);
    }

    let now = Utc::now();
    let mut units: Vec<ChangeDataJson> = groups
        .into_values()
        .filter_map(|mut group| {
            group.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
            let mut versions = group.into_iter();
            let first = versions.next()?;

            let mut content = first.content.clone();
            let mut depend_on: Vec<Dependence> = first.depend_on.clone();
            let mut latest = first;
            for record in versions {
                merge_content(&mut content, record.content.clone());
                for dep in &record.depend_on {
                    if !depend_on.contains(dep) {
                        depend_on.push(dep.clone());
                    }
                }
                latest = record;
            }

            Some(ChangeDataJson {
                tenant_id: latest.tenant_id,
                json_id: Uuid::new_v4(),
                table_trigger_id: latest.table_trigger_id,
                model_trigger_id: latest.model_trigger_id,
                event_trigger_id: latest.event_trigger_id,
                resource_id: latest.resource_id,
                model_name: latest.model_name,
                object_id: latest.object_id,
                table_name: latest.table_name,
                data_id: latest.data_id,
                content,
                depend_on,
                status: UnitStatus::Initial,
                retry_count: 0,
                max_retries,
                last_error: None,
                started_at: None,
                updated_at: now,
                created_at: now,
            })
        })
        .collect();

    units.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
    units
}

pub struct RecordStager {
    tenant: TenantId,
    store: Arc<dyn ChangeDataStore>,
    config: StagerConfig,
}

impl RecordStager {
    pub fn new(tenant: TenantId, store: Arc<dyn ChangeDataStore>, config: StagerConfig) -> Self {
        Self {
            tenant,
            store,
            config,
        }
    }

    #[instrument(skip(self), fields(tenant_id = %self.tenant))]
    pub async fn run_cycle(&self) -> Result<StageReport> {
        let records = self
            .store
            .claim_records(&self.tenant, self.config.batch_size)
            .await
            .context("Failed to claim change data records")?;
        if records.is_empty() {
            return Ok(StageReport::default());
        }

        let claimed = records.len();
        let record_ids: Vec<Uuid> = records.iter().map(|r| r.record_id).collect();
        let units = merge_records(records, self.config.max_retries);

        let staged = self
            .store
            .stage_json(&self.tenant, &record_ids, &units)
            .await
            .context("Failed to stage json units")?;

        info!(claimed, staged, "Records staged");
        Ok(StageReport { claimed, staged })
    }
}

#[async_trait]
impl PeriodicJob for RecordStager {
    fn name(&self) -> String {
        format!("stager-{}", self.tenant)
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
    use crate::collector::types::{ChangeDataJsonHistory, HistoryOutcome};
    use crate::db::MemoryCollectorStore;
    use collector_common::ResourceId;
    use serde_json::json;

    fn tenant() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    fn record(
        event: Uuid,
        resource: &str,
        object: &str,
        content: serde_json::Value,
        depend_on: Vec<Dependence>,
    ) -> ChangeDataRecord {
        ChangeDataRecord {
            tenant_id: tenant(),
            record_id: Uuid::new_v4(),
            table_trigger_id: Uuid::nil(),
            model_trigger_id: Uuid::nil(),
            event_trigger_id: event,
            resource_id: ResourceId::from(resource),
            model_name: "CLAIM".to_string(),
            object_id: object.to_string(),
            table_name: "claim".to_string(),
            data_id: object.to_string(),
            content,
            depend_on,
            status: UnitStatus::Initial,
            started_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_merge_later_versions_win() {
        let event = Uuid::new_v4();
        let units = merge_records(
            vec![
                record(event, "12", "55", json!({"a": 2, "c": 3}), vec![Dependence::new("POLICY", "2")]),
                record(event, "9", "55", json!({"a": 1, "b": 1}), vec![Dependence::new("POLICY", "1")]),
                record(event, "10", "56", json!({"x": 1}), vec![]),
            ],
            5,
        );

        assert_eq!(units.len(), 2);
        let claim_55 = units.iter().find(|u| u.object_id == "55").unwrap();
        assert_eq!(claim_55.content, json!({"a": 2, "b": 1, "c": 3}));
        assert_eq!(claim_55.resource_id.as_str(), "12");
        assert_eq!(
            claim_55.depend_on,
            vec![Dependence::new("POLICY", "1"), Dependence::new("POLICY", "2")]
        );
        assert_eq!(claim_55.max_retries, 5);
        assert_eq!(units[0].resource_id.as_str(), "10");
    }

    #[test]
    fn test_non_object_content_is_replaced() {
        let event = Uuid::new_v4();
        let units = merge_records(
            vec![
                record(event, "1", "55", json!("raw"), vec![]),
                record(event, "2", "55", json!({"a": 1}), vec![]),
            ],
            3,
        );
        assert_eq!(units[0].content, json!({"a": 1}));
    }

    #[test]
    fn test_events_are_not_merged() {
        let units = merge_records(
            vec![
                record(Uuid::new_v4(), "1", "55", json!({}), vec![]),
                record(Uuid::new_v4(), "2", "55", json!({}), vec![]),
            ],
            3,
        );
        assert_eq!(units.len(), 2);
    }

    #[tokio::test]
    async fn test_cycle_stages_and_marks_records_done() {
        let store = Arc::new(MemoryCollectorStore::new());
        let event = Uuid::new_v4();
        store
            .insert_records(&[
                record(event, "1", "55", json!({"a": 1}), vec![]),
                record(event, "2", "55", json!({"b": 1}), vec![]),
            ])
            .await
            .unwrap();

        let stager = RecordStager::new(tenant(), store.clone(), StagerConfig::default());
        let report = stager.run_cycle().await.unwrap();
        assert_eq!(report, StageReport { claimed: 2, staged: 1 });

        assert!(store
            .records(&tenant())
            .await
            .iter()
            .all(|r| r.status == UnitStatus::Done));
        let units = store.json_units(&tenant()).await;
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].content, json!({"a": 1, "b": 1}));

        assert_eq!(stager.run_cycle().await.unwrap(), StageReport::default());
    }

    fn one_per_cycle() -> StagerConfig {
        StagerConfig {
            batch_size: 1,
            ..StagerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_versions_in_separate_batches_merge_into_live_unit() {
        let store = Arc::new(MemoryCollectorStore::new());
        let event = Uuid::new_v4();
        store
            .insert_records(&[
                record(event, "1001", "55", json!({"amount": 1}), vec![]),
                record(event, "1002", "55", json!({"amount": 2}), vec![Dependence::new("POLICY", "7")]),
            ])
            .await
            .unwrap();

        let stager = RecordStager::new(tenant(), store.clone(), one_per_cycle());
        assert_eq!(stager.run_cycle().await.unwrap(), StageReport { claimed: 1, staged: 1 });
        assert_eq!(stager.run_cycle().await.unwrap(), StageReport { claimed: 1, staged: 1 });

        let units = store.json_units(&tenant()).await;
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].content, json!({"amount": 2}));
        assert_eq!(units[0].resource_id.as_str(), "1002");
        assert_eq!(units[0].depend_on, vec![Dependence::new("POLICY", "7")]);
        assert!(store
            .records(&tenant())
            .await
            .iter()
            .all(|r| r.status == UnitStatus::Done));
    }

    #[tokio::test]
    async fn test_failed_unit_takes_newer_version_and_retries_afresh() {
        let store = Arc::new(MemoryCollectorStore::new());
        let event = Uuid::new_v4();
        store
            .insert_records(&[record(event, "1001", "55", json!({"amount": 1}), vec![])])
            .await
            .unwrap();
        let stager = RecordStager::new(tenant(), store.clone(), one_per_cycle());
        stager.run_cycle().await.unwrap();

        let unit = store.json_units(&tenant()).await.remove(0);
        assert!(store.claim_json(&tenant(), unit.json_id).await.unwrap());
        let history = ChangeDataJsonHistory::from_json(
            &unit,
            HistoryOutcome::Failed,
            None,
            None,
            Some("pipeline unavailable".to_string()),
        );
        store.fail_json(&tenant(), &history).await.unwrap();

        store
            .insert_records(&[record(event, "1002", "55", json!({"amount": 2}), vec![])])
            .await
            .unwrap();
        assert_eq!(stager.run_cycle().await.unwrap(), StageReport { claimed: 1, staged: 1 });

        let units = store.json_units(&tenant()).await;
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].json_id, unit.json_id);
        assert_eq!(units[0].status, UnitStatus::Initial);
        assert_eq!(units[0].retry_count, 0);
        assert_eq!(units[0].last_error, None);
        assert_eq!(units[0].content, json!({"amount": 2}));
    }

    #[tokio::test]
    async fn test_processing_unit_defers_newer_version() {
        let store = Arc::new(MemoryCollectorStore::new());
        let event = Uuid::new_v4();
        store
            .insert_records(&[record(event, "1001", "55", json!({"amount": 1}), vec![])])
            .await
            .unwrap();
        let stager = RecordStager::new(tenant(), store.clone(), one_per_cycle());
        stager.run_cycle().await.unwrap();

        let unit = store.json_units(&tenant()).await.remove(0);
        assert!(store.claim_json(&tenant(), unit.json_id).await.unwrap());

        store
            .insert_records(&[record(event, "1002", "55", json!({"amount": 2}), vec![])])
            .await
            .unwrap();
        assert_eq!(stager.run_cycle().await.unwrap(), StageReport { claimed: 1, staged: 0 });

        let waiting = store
            .records(&tenant())
            .await
            .into_iter()
            .find(|r| r.resource_id.as_str() == "1002")
            .unwrap();
        assert_eq!(waiting.status, UnitStatus::Initial);
        assert_eq!(waiting.started_at, None);
        assert_eq!(store.json_units(&tenant()).await[0].content, json!({"amount": 1}));

        let history =
            ChangeDataJsonHistory::from_json(&unit, HistoryOutcome::Success, None, None, None);
        store.archive_json(&tenant(), &history).await.unwrap();

        assert_eq!(stager.run_cycle().await.unwrap(), StageReport { claimed: 1, staged: 1 });
        let units = store.json_units(&tenant()).await;
        assert_eq!(units.len(), 1);
        assert_ne!(units[0].json_id, unit.json_id);
        assert_eq!(units[0].content, json!({"amount": 2}));
        assert_eq!(units[0].resource_id.as_str(), "1002");
    }
}
