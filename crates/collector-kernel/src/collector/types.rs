//! Core types for the collector kernel
//!
//! Status enums are persisted as SMALLINT codes; the numeric values are part
//! of the storage contract and must not be reordered.

use chrono::{DateTime, Utc};
use collector_common::{Dependence, ResourceId, TenantId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a capture run selects source rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    /// Every change inside the event's time window
    Window,
    /// Full extraction of the configured tables
    ByTable,
    /// Explicitly listed records
    ByRecord,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Window => "WINDOW",
            TriggerType::ByTable => "BY_TABLE",
            TriggerType::ByRecord => "BY_RECORD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WINDOW" => Some(TriggerType::Window),
            "BY_TABLE" => Some(TriggerType::ByTable),
            "BY_RECORD" => Some(TriggerType::ByRecord),
            _ => None,
        }
    }
}

/// Lifecycle of a capture run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending = 0,
    Running = 1,
    Finished = 2,
}

impl EventStatus {
    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(EventStatus::Pending),
            1 => Some(EventStatus::Running),
            2 => Some(EventStatus::Finished),
            _ => None,
        }
    }
}

/// Status shared by records, json units and scheduled tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    Initial = 0,
    Processing = 1,
    Done = 2,
    Failed = 3,
}

impl UnitStatus {
    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(UnitStatus::Initial),
            1 => Some(UnitStatus::Processing),
            2 => Some(UnitStatus::Done),
            3 => Some(UnitStatus::Failed),
            _ => None,
        }
    }

    pub fn is_open(self) -> bool {
        self != UnitStatus::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockStatus {
    Held = 0,
    Released = 1,
}

impl LockStatus {
    pub fn code(self) -> i16 {
        self as i16
    }
}

/// Lock variants. All share one table and one uniqueness rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockKind {
    Generic,
    Oss,
    Resource,
}

impl LockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockKind::Generic => "GENERIC",
            LockKind::Oss => "OSS",
            LockKind::Resource => "RESOURCE",
        }
    }
}

/// Outcome stored on an append-only history row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryOutcome {
    Success = 0,
    Failed = 1,
}

impl HistoryOutcome {
    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(HistoryOutcome::Success),
            1 => Some(HistoryOutcome::Failed),
            _ => None,
        }
    }
}

/// Root of a capture run (maps to trigger_events)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub tenant_id: TenantId,
    pub event_trigger_id: Uuid,
    pub trigger_type: TriggerType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub is_finished: bool,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Maps to trigger_modules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerModule {
    pub tenant_id: TenantId,
    pub module_trigger_id: Uuid,
    pub event_trigger_id: Uuid,
    pub module_name: String,
    pub priority: i32,
    pub is_finished: bool,
}

/// Maps to trigger_models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerModel {
    pub tenant_id: TenantId,
    pub model_trigger_id: Uuid,
    pub module_trigger_id: Uuid,
    pub event_trigger_id: Uuid,
    pub model_name: String,
    pub topic_code: String,
    pub priority: i32,
    /// Whether units of this model may be dispatched concurrently
    pub parallel: bool,
    /// Names of models that must finish first within the same event
    pub depend_on: Vec<String>,
    pub is_finished: bool,
}

/// Maps to trigger_tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerTable {
    pub tenant_id: TenantId,
    pub table_trigger_id: Uuid,
    pub model_trigger_id: Uuid,
    pub module_trigger_id: Uuid,
    pub event_trigger_id: Uuid,
    pub model_name: String,
    pub table_name: String,
    pub priority: i32,
    pub is_extracted: bool,
    pub record_count: i64,
    pub is_finished: bool,
}

/// A whole fan-out, persisted in one transaction
#[derive(Debug, Clone)]
pub struct TriggerPlan {
    pub event: TriggerEvent,
    pub modules: Vec<TriggerModule>,
    pub models: Vec<TriggerModel>,
    pub tables: Vec<TriggerTable>,
}

/// One raw extracted row (maps to change_data_records)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDataRecord {
    pub tenant_id: TenantId,
    pub record_id: Uuid,
    pub table_trigger_id: Uuid,
    pub model_trigger_id: Uuid,
    pub event_trigger_id: Uuid,
    pub resource_id: ResourceId,
    pub model_name: String,
    pub object_id: String,
    pub table_name: String,
    pub data_id: String,
    pub content: serde_json::Value,
    pub depend_on: Vec<Dependence>,
    pub status: UnitStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Canonical per-entity unit (maps to change_data_json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDataJson {
    pub tenant_id: TenantId,
    pub json_id: Uuid,
    pub table_trigger_id: Uuid,
    pub model_trigger_id: Uuid,
    pub event_trigger_id: Uuid,
    pub resource_id: ResourceId,
    pub model_name: String,
    pub object_id: String,
    pub table_name: String,
    pub data_id: String,
    pub content: serde_json::Value,
    pub depend_on: Vec<Dependence>,
    pub status: UnitStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Identity of one staged entity: `(event, model, object, table, data id)`
pub type EntityKey = (Uuid, String, String, String, String);

impl ChangeDataRecord {
    pub fn entity_key(&self) -> EntityKey {
        (
            self.event_trigger_id,
            self.model_name.clone(),
            self.object_id.clone(),
            self.table_name.clone(),
            self.data_id.clone(),
        )
    }
}

impl ChangeDataJson {
    pub fn entity_key(&self) -> EntityKey {
        (
            self.event_trigger_id,
            self.model_name.clone(),
            self.object_id.clone(),
            self.table_name.clone(),
            self.data_id.clone(),
        )
    }

    /// Fold a newer version of the same entity into this live unit.
    ///
    /// The unit goes back to INITIAL with a fresh retry budget and takes the
    /// greater resource id.
    pub fn absorb(&mut self, newer: &ChangeDataJson) {
        merge_content(&mut self.content, newer.content.clone());
        for dep in &newer.depend_on {
            if !self.depend_on.contains(dep) {
                self.depend_on.push(dep.clone());
            }
        }
        if newer.resource_id > self.resource_id {
            self.resource_id = newer.resource_id.clone();
        }
        self.status = UnitStatus::Initial;
        self.retry_count = 0;
        self.last_error = None;
        self.started_at = None;
        self.updated_at = newer.updated_at;
    }
}

/// Key-wise merge of two objects, `next` winning; anything else is replaced
pub fn merge_content(base: &mut serde_json::Value, next: serde_json::Value) {
    match (base, next) {
        (serde_json::Value::Object(base), serde_json::Value::Object(next)) => {
            base.extend(next);
        }
        (base, next) => *base = next,
    }
}

/// A json unit joined with the dispatch attributes of its model
#[derive(Debug, Clone)]
pub struct PendingJson {
    pub json: ChangeDataJson,
    pub topic_code: String,
    pub priority: i32,
    pub parallel: bool,
    pub model_depend_on: Vec<String>,
}

/// Append-only processing history (maps to change_data_json_history)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDataJsonHistory {
    pub tenant_id: TenantId,
    pub history_id: Uuid,
    pub json_id: Uuid,
    pub table_trigger_id: Uuid,
    pub model_trigger_id: Uuid,
    pub event_trigger_id: Uuid,
    pub resource_id: ResourceId,
    pub model_name: String,
    pub object_id: String,
    pub content: serde_json::Value,
    pub outcome: HistoryOutcome,
    pub trace_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ChangeDataJsonHistory {
    pub fn from_json(
        json: &ChangeDataJson,
        outcome: HistoryOutcome,
        trace_id: Option<String>,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Self {
        Self {
            tenant_id: json.tenant_id.clone(),
            history_id: Uuid::new_v4(),
            json_id: json.json_id,
            table_trigger_id: json.table_trigger_id,
            model_trigger_id: json.model_trigger_id,
            event_trigger_id: json.event_trigger_id,
            resource_id: json.resource_id.clone(),
            model_name: json.model_name.clone(),
            object_id: json.object_id.clone(),
            content: json.content.clone(),
            outcome,
            trace_id,
            result,
            error_message,
            recorded_at: Utc::now(),
        }
    }
}

/// Dispatch envelope handed to the pipeline (maps to scheduled_tasks)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub tenant_id: TenantId,
    pub task_id: String,
    pub resource_id: ResourceId,
    pub topic_code: String,
    pub content: serde_json::Value,
    pub model_name: String,
    pub object_id: String,
    pub depend_on: Vec<Dependence>,
    pub status: UnitStatus,
    pub result: Option<serde_json::Value>,
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Object key the task was ingested from, if any
    pub source_key: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn new(
        tenant_id: TenantId,
        task_id: impl Into<String>,
        resource_id: ResourceId,
        topic_code: impl Into<String>,
        model_name: impl Into<String>,
        object_id: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            tenant_id,
            task_id: task_id.into(),
            resource_id,
            topic_code: topic_code.into(),
            content,
            model_name: model_name.into(),
            object_id: object_id.into(),
            depend_on: Vec::new(),
            status: UnitStatus::Initial,
            result: None,
            priority: 0,
            retry_count: 0,
            max_retries: 3,
            source_key: None,
            started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_dependence(mut self, dependence: Option<Dependence>) -> Self {
        self.depend_on.extend(dependence);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_source_key(mut self, key: impl Into<String>) -> Self {
        self.source_key = Some(key.into());
        self
    }
}

/// Mutual exclusion row (maps to competitive_locks)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitiveLock {
    pub tenant_id: TenantId,
    pub lock_id: Uuid,
    pub resource_id: String,
    pub kind: LockKind,
    pub model_name: Option<String>,
    pub object_id: Option<String>,
    /// Worker that registered the lock
    pub owner: String,
    pub registered_at: DateTime<Utc>,
    pub status: LockStatus,
}

/// Aggregate counts for one trigger table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    /// Records not yet DONE
    pub records_open: i64,
    /// Json units still in the live table
    pub json_open: i64,
    /// Successful history rows
    pub succeeded: i64,
    /// Failed history rows
    pub failed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            UnitStatus::Initial,
            UnitStatus::Processing,
            UnitStatus::Done,
            UnitStatus::Failed,
        ] {
            assert_eq!(UnitStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(UnitStatus::Failed.code(), 3);
        assert_eq!(UnitStatus::from_code(9), None);
        assert_eq!(LockStatus::Held.code(), 0);
        assert_eq!(LockStatus::Released.code(), 1);
    }

    #[test]
    fn test_trigger_type_strings() {
        assert_eq!(TriggerType::parse("BY_RECORD"), Some(TriggerType::ByRecord));
        assert_eq!(TriggerType::Window.as_str(), "WINDOW");
        assert_eq!(TriggerType::parse("by_table"), None);
    }

    #[test]
    fn test_task_envelope_wire_shape() {
        let tenant = TenantId::parse("acme").unwrap();
        let task = ScheduledTask::new(
            tenant,
            "t-1",
            ResourceId::from("1002"),
            "claims",
            "CLAIM",
            "55",
            serde_json::json!({"amount": 10}),
        )
        .with_dependence(Some(Dependence::new("POLICY", "10")));

        let wire = serde_json::to_value(&task).unwrap();
        assert_eq!(wire["taskId"], "t-1");
        assert_eq!(wire["resourceId"], "1002");
        assert_eq!(wire["status"], "INITIAL");
        assert_eq!(wire["dependOn"][0]["modelName"], "POLICY");
    }
}
