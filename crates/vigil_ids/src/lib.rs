//! Shared identifier wrappers for Vigil.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Error returned when parsing an identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    message: String,
}

impl IdParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IdParseError {}

macro_rules! define_uuid_id {
    ($(#[$meta:meta])* $name:ident, $label:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                Uuid::parse_str(value)
                    .map_err(|e| IdParseError::new(format!("Invalid {}: {}", $label, e)))?;
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

/// Human-chosen identifiers (suite ids, worker names). Restricted to a
/// conservative charset so they are safe in storage keys and log fields.
macro_rules! define_name_id {
    ($(#[$meta:meta])* $name:ident, $label:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                if value.is_empty() || value.len() > 128 {
                    return Err(IdParseError::new(format!(
                        "Invalid {}: length must be 1..=128",
                        $label
                    )));
                }
                if let Some(bad) = value
                    .chars()
                    .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
                {
                    return Err(IdParseError::new(format!(
                        "Invalid {}: unexpected character {:?}",
                        $label, bad
                    )));
                }
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

define_uuid_id!(ProjectId, "project ID");
define_uuid_id!(TargetId, "target ID");
define_uuid_id!(AuthorizationId, "authorization ID");
define_uuid_id!(RunId, "run ID");
define_uuid_id!(JobId, "job ID");
define_uuid_id!(FindingId, "finding ID");
define_uuid_id!(ArtifactId, "artifact ID");

define_name_id!(SuiteId, "suite ID");
define_name_id!(
    /// Identity a worker executor presents when leasing jobs.
    WorkerId,
    "worker ID"
);

impl WorkerId {
    /// Worker id for executor `index` of the pool named `pool`.
    pub fn for_executor(pool: &str, index: usize) -> Result<Self, IdParseError> {
        Self::parse(&format!("{}-{}", pool, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_ids_roundtrip_through_parse() {
        let id = RunId::new();
        let parsed: RunId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn uuid_ids_reject_garbage() {
        let err = TargetId::parse("not-a-uuid").unwrap_err();
        assert!(err.to_string().contains("target ID"));
    }

    #[test]
    fn name_ids_restrict_charset() {
        assert!(SuiteId::parse("web-baseline").is_ok());
        assert!(SuiteId::parse("deps.audit:v2").is_ok());
        assert!(SuiteId::parse("").is_err());
        assert!(SuiteId::parse("has space").is_err());
        assert!(SuiteId::parse("../etc").is_err());
    }

    #[test]
    fn worker_ids_are_derived_from_pool_name() {
        let id = WorkerId::for_executor("node-a", 3).unwrap();
        assert_eq!(id.as_str(), "node-a-3");
    }
}
