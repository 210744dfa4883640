//! Value types used throughout the collector
//!
//! Every persisted entity is partitioned by [`TenantId`]. Units of work are
//! ordered by [`ResourceId`] and reference each other through [`Dependence`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{CommonError, Result};

/// Tenant partition key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Validate and wrap a tenant identifier
    pub fn parse(raw: impl AsRef<str>) -> Result<Self> {
        let raw = raw.as_ref().trim();
        if raw.is_empty() {
            return Err(CommonError::EmptyTenant);
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CommonError::InvalidTenant(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Global ordering key of a unit of work.
///
/// Sources hand out monotonically increasing identifiers (sequence numbers,
/// log positions, fixed-width timestamps). The natural order compares the
/// length first and then the bytes, which matches numeric order for unpadded
/// integers and byte order for fixed-width ids. The SQL adapters order by
/// `octet_length(resource_id), resource_id` for the same reason.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(CommonError::EmptyResourceId);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for ResourceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.as_bytes().cmp(other.0.as_bytes()))
    }
}

impl PartialOrd for ResourceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// "I require model X, object Y to be complete"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependence {
    pub model_name: String,
    pub object_id: String,
}

impl Dependence {
    pub fn new(model_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            object_id: object_id.into(),
        }
    }

    /// Build a dependence, rejecting blank halves
    pub fn try_new(model_name: &str, object_id: &str) -> Result<Self> {
        if model_name.trim().is_empty() || object_id.trim().is_empty() {
            return Err(CommonError::IncompleteDependence {
                model_name: model_name.to_string(),
                object_id: object_id.to_string(),
            });
        }
        Ok(Self::new(model_name, object_id))
    }

    /// Whether this dependence points at the given entity
    pub fn targets(&self, model_name: &str, object_id: &str) -> bool {
        self.model_name == model_name && self.object_id == object_id
    }
}

impl fmt::Display for Dependence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model_name, self.object_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tenant_parse() {
        assert_eq!(TenantId::parse(" acme-01 ").unwrap().as_str(), "acme-01");
        assert_eq!(TenantId::parse(""), Err(CommonError::EmptyTenant));
        assert!(matches!(
            TenantId::parse("a/b"),
            Err(CommonError::InvalidTenant(_))
        ));
    }

    #[test]
    fn test_resource_id_natural_order() {
        assert!(ResourceId::from("1001") < ResourceId::from("1002"));
        assert!(ResourceId::from("999") < ResourceId::from("1000"));
        assert!(ResourceId::from("2024-01-02") > ResourceId::from("2024-01-01"));
        assert!(ResourceId::parse("").is_err());
    }

    #[test]
    fn test_resource_id_length_counts_bytes() {
        let mut ids = vec![ResourceId::from("ü"), ResourceId::from("10"), ResourceId::from("9")];
        ids.sort();
        let order: Vec<_> = ids.iter().map(ResourceId::as_str).collect();
        assert_eq!(order, vec!["9", "10", "ü"]);
    }

    #[test]
    fn test_dependence() {
        let dep = Dependence::try_new("POLICY", "10").unwrap();
        assert!(dep.targets("POLICY", "10"));
        assert!(!dep.targets("POLICY", "11"));
        assert_eq!(dep.to_string(), "POLICY/10");
        assert!(Dependence::try_new("POLICY", " ").is_err());
    }

    #[test]
    fn test_dependence_serde_shape() {
        let dep = Dependence::new("POLICY", "10");
        let json = serde_json::to_value(&dep).unwrap();
        assert_eq!(json, serde_json::json!({"modelName": "POLICY", "objectId": "10"}));
    }

    proptest! {
        #[test]
        fn prop_resource_order_matches_numeric(a in 0u64..u64::MAX, b in 0u64..u64::MAX) {
            let ra = ResourceId::from(a.to_string());
            let rb = ResourceId::from(b.to_string());
            prop_assert_eq!(ra.cmp(&rb), a.cmp(&b));
        }
    }
}
