//! Common error types

use thiserror::Error;

/// Error parsing a persisted enum value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {value}")]
pub struct ParseEnumError {
    /// Which enum was being parsed
    pub kind: &'static str,
    /// The rejected input
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
