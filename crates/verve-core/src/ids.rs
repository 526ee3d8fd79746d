use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

macro_rules! typed_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Builds an id from an already-prefixed string, validating the prefix.
            pub fn parse(raw: impl Into<String>) -> Result<Self, AppError> {
                let raw = raw.into();
                let suffix = raw.strip_prefix($prefix).ok_or_else(|| {
                    AppError::invalid(format!(
                        "{} must start with '{}', got '{}'",
                        stringify!($name),
                        $prefix,
                        raw
                    ))
                })?;
                if suffix.is_empty() {
                    return Err(AppError::invalid(format!(
                        "{} has empty suffix after prefix '{}'",
                        stringify!($name),
                        $prefix
                    )));
                }
                Ok(Self(raw))
            }

            /// Builds a fresh id from a bare suffix, attaching the type's prefix.
            pub fn new(suffix: impl AsRef<str>) -> Self {
                Self(format!("{}{}", $prefix, suffix.as_ref()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(RepoId, "repo_");
typed_id!(TaskId, "tsk_");
typed_id!(EpicId, "epc_");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_well_formed_id() {
        let id = TaskId::parse("tsk_abc123").expect("valid id");
        assert_eq!(id.0, "tsk_abc123");
    }

    #[test]
    fn parse_rejects_wrong_prefix() {
        let err = TaskId::parse("epc_abc123").unwrap_err();
        assert!(matches!(err, AppError::Invalid(_)));
    }

    #[test]
    fn parse_rejects_empty_suffix() {
        let err = RepoId::parse("repo_").unwrap_err();
        assert!(matches!(err, AppError::Invalid(_)));
    }

    #[test]
    fn new_attaches_prefix() {
        let id = EpicId::new("xyz");
        assert_eq!(id.0, "epc_xyz");
    }

    #[test]
    fn display_matches_inner_string() {
        let id = RepoId::new("acme-api");
        assert_eq!(id.to_string(), "repo_acme-api");
    }
}
