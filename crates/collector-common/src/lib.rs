//! Collector Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared value types, errors and logging for the collector workspace.
//!
//! # Overview
//!
//! - **Types**: tenant and resource identifiers plus the `Dependence` value object
//! - **Error Handling**: `CommonError` for value parsing failures
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use collector_common::{Dependence, ResourceId, TenantId};
//!
//! let tenant = TenantId::parse("acme").unwrap();
//! let dep = Dependence::new("POLICY", "10");
//! assert!(ResourceId::from("999") < ResourceId::from("1000"));
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{Dependence, ResourceId, TenantId};
