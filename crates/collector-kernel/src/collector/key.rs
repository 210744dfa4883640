//! Object key wire format
//!
//! `resourceId~modelName~objectId` or
//! `resourceId~modelName~objectId~depModelName~depObjectId`.
//! Keys are parsed once here; nothing downstream looks at the raw string again.

use collector_common::{Dependence, ResourceId};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const KEY_DELIMITER: char = '~';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyPatternError {
    #[error("key '{key}' has {found} segments, expected 3 or 5")]
    SegmentCount { key: String, found: usize },

    #[error("key '{key}' has an empty segment at position {position}")]
    EmptySegment { key: String, position: usize },
}

/// A validated object key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    pub resource_id: ResourceId,
    pub model_name: String,
    pub object_id: String,
    pub dependence: Option<Dependence>,
}

impl ObjectKey {
    /// Parse the final path segment of a storage key
    pub fn parse(name: &str) -> Result<Self, KeyPatternError> {
        let segments: Vec<&str> = name.split(KEY_DELIMITER).collect();

        if segments.len() != 3 && segments.len() != 5 {
            return Err(KeyPatternError::SegmentCount {
                key: name.to_string(),
                found: segments.len(),
            });
        }

        if let Some(position) = segments.iter().position(|s| s.trim().is_empty()) {
            return Err(KeyPatternError::EmptySegment {
                key: name.to_string(),
                position,
            });
        }

        let dependence = match segments.as_slice() {
            [_, _, _, dep_model, dep_object] => Some(Dependence::new(*dep_model, *dep_object)),
            _ => None,
        };

        Ok(Self {
            resource_id: ResourceId::from(segments[0]),
            model_name: segments[1].to_string(),
            object_id: segments[2].to_string(),
            dependence,
        })
    }

    /// Parse a full storage path such as `inbox/acme/1001~CLAIM~55`
    pub fn from_path(path: &str) -> Result<Self, KeyPatternError> {
        Self::parse(file_name(path))
    }
}

/// Last `/`-separated segment of a storage path
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl FromStr for ObjectKey {
    type Err = KeyPatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{d}{}{d}{}",
            self.resource_id,
            self.model_name,
            self.object_id,
            d = KEY_DELIMITER
        )?;
        if let Some(dep) = &self.dependence {
            write!(f, "{d}{}{d}{}", dep.model_name, dep.object_id, d = KEY_DELIMITER)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_three_segment_key() {
        let key = ObjectKey::parse("1001~CLAIM~55").unwrap();
        assert_eq!(key.resource_id.as_str(), "1001");
        assert_eq!(key.model_name, "CLAIM");
        assert_eq!(key.object_id, "55");
        assert_eq!(key.dependence, None);
    }

    #[test]
    fn test_five_segment_key() {
        let key = ObjectKey::parse("1002~CLAIM~55~POLICY~10").unwrap();
        assert_eq!(key.resource_id.as_str(), "1002");
        assert_eq!(key.model_name, "CLAIM");
        assert_eq!(key.object_id, "55");
        assert_eq!(key.dependence, Some(Dependence::new("POLICY", "10")));
    }

    #[test]
    fn test_two_segment_key_rejected() {
        assert_eq!(
            ObjectKey::parse("bad~key"),
            Err(KeyPatternError::SegmentCount {
                key: "bad~key".to_string(),
                found: 2
            })
        );
    }

    #[test]
    fn test_four_segment_key_rejected() {
        assert!(matches!(
            ObjectKey::parse("1~A~B~C"),
            Err(KeyPatternError::SegmentCount { found: 4, .. })
        ));
    }

    #[test]
    fn test_empty_segment_rejected() {
        assert_eq!(
            ObjectKey::parse("1001~~55"),
            Err(KeyPatternError::EmptySegment {
                key: "1001~~55".to_string(),
                position: 1
            })
        );
    }

    #[test]
    fn test_from_path_strips_prefix() {
        let key = ObjectKey::from_path("inbox/acme/1001~CLAIM~55").unwrap();
        assert_eq!(key.model_name, "CLAIM");
        assert_eq!(file_name("no-slash"), "no-slash");
    }

    fn segment() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_.-]{1,12}"
    }

    proptest! {
        #[test]
        fn prop_valid_keys_survive_display(
            resource in "[0-9]{1,10}",
            model in segment(),
            object in segment(),
            dep in proptest::option::of((segment(), segment())),
        ) {
            let mut raw = format!("{}~{}~{}", resource, model, object);
            if let Some((m, o)) = &dep {
                raw.push_str(&format!("~{}~{}", m, o));
            }

            let key = ObjectKey::parse(&raw).unwrap();
            prop_assert_eq!(key.to_string(), raw);
            prop_assert_eq!(key.dependence.is_some(), dep.is_some());
        }

        #[test]
        fn prop_wrong_segment_counts_rejected(parts in proptest::collection::vec(segment(), 1..8)) {
            let raw = parts.join("~");
            let result = ObjectKey::parse(&raw);
            if parts.len() == 3 || parts.len() == 5 {
                prop_assert!(result.is_ok());
            } else {
                let is_count_error = matches!(result, Err(KeyPatternError::SegmentCount { .. }));
                prop_assert!(is_count_error);
            }
        }
    }
}
