//! Error types shared across the collector crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while building shared value types
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommonError {
    #[error("Tenant id must not be empty")]
    EmptyTenant,

    #[error("Invalid tenant id '{0}': only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidTenant(String),

    #[error("Resource id must not be empty")]
    EmptyResourceId,

    #[error("Dependence requires both a model name and an object id, got '{model_name}'/'{object_id}'")]
    IncompleteDependence {
        model_name: String,
        object_id: String,
    },
}
