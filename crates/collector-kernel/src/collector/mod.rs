//! Collector kernel components
//!
//! # Architecture
//!
//! - **hierarchy**: capture submission and the event/module/model/table fan-out
//! - **stager**: extracted records -> per-entity json units
//! - **connector**: object storage keys -> scheduled tasks
//! - **scheduler**: lock, dependency check, pipeline dispatch
//! - **rollup**: bottom-up completion of the hierarchy
//! - **reclaimer**: timeout recovery of locks and in-flight units
//! - **monitor**: read-only progress reporting
//!
//! Every component talks to storage only through the traits in [`store`],
//! and coordinates with its peers only through [`lock::LockManager`].

pub mod connector;
pub mod dependency;
pub mod hierarchy;
pub mod key;
pub mod lock;
pub mod modules;
pub mod monitor;
pub mod pipeline;
pub mod queue;
pub mod reclaimer;
pub mod rollup;
pub mod scheduler;
pub mod stager;
pub mod store;
pub mod types;

pub use connector::{ConnectorConfig, ConnectorReport, OssConnector};
pub use dependency::DependencyResolver;
pub use hierarchy::{CaptureRequest, ExtractedRow, TriggerHierarchy};
pub use key::{KeyPatternError, ObjectKey};
pub use lock::{LockManager, LockRequest};
pub use modules::{CollectorModelConfig, CollectorModuleConfig, ModuleCatalog};
pub use monitor::{EventProgress, Monitor, TableProgress, TableStatus};
pub use pipeline::{Credential, HttpPipelineInvoker, Invocation, PipelineConfig, PipelineInvoker};
pub use queue::{DispatchQueue, JsonQueue, TaskQueue, WorkUnit};
pub use reclaimer::{ReclaimerConfig, SweepReport, TimeoutReclaimer};
pub use rollup::{CompletionRollup, RollupConfig, RollupReport};
pub use scheduler::{CycleReport, Scheduler, SchedulerConfig};
pub use stager::{RecordStager, StageReport, StagerConfig};
pub use store::{ChangeDataStore, DependencyIndex, LockStore, TaskStore, TriggerStore};
