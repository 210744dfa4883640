//! Collector Kernel Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Multi-tenant change-data collection runtime: it turns captured source rows
//! and object storage drops into ordered, dependency-aware invocations of a
//! downstream pipeline engine.
//!
//! # Overview
//!
//! - **Capture**: a capture request fans out into an event -> module -> model
//!   -> table hierarchy; extractors hand rows back per table
//! - **Staging**: extracted records are merged into one json unit per entity
//! - **Ingestion**: object storage keys become scheduled tasks
//! - **Scheduling**: units are dispatched under competitive locks once their
//!   dependencies and earlier versions are complete
//! - **Recovery**: a reclaimer releases expired locks and resets stalled units
//! - **Completion**: a roll-up marks the hierarchy finished bottom-up
//!
//! # Architecture
//!
//! Workers run on fixed intervals under a [`worker::Supervisor`]. They share
//! nothing in memory: the `competitive_locks` table is the only source of
//! mutual exclusion, so any number of kernel processes can run side by side.
//!
//! # Example
//!
//! ```no_run
//! use collector_kernel::{config::KernelConfig, worker::Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KernelConfig::load()?;
//!     let supervisor = Supervisor::new(config.max_backoff);
//!     supervisor.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod collector;
pub mod config;
pub mod db;
pub mod kernel;
pub mod storage;
pub mod worker;

// Re-export commonly used types
pub use config::KernelConfig;
pub use kernel::{KernelServices, KernelStores, WorkerSettings};
pub use worker::{PeriodicJob, Supervisor};
