//! Error types for PlanSync shared types

use thiserror::Error;

/// Failure to interpret a value as one of the shared enums
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("Invalid {kind}: {value}")]
    Invalid { kind: &'static str, value: String },
}

impl TypeError {
    pub fn invalid(kind: &'static str, value: impl Into<String>) -> Self {
        Self::Invalid {
            kind,
            value: value.into(),
        }
    }
}
