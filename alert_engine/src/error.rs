use thiserror::Error;

/// Rejections raised before anything is persisted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid label name: {0:?}")]
    InvalidLabelName(String),

    #[error("Label {0} is reserved and cannot be overridden")]
    ProtectedLabel(String),

    #[error("Invalid layer {given:?}: expected one of {expected}")]
    InvalidLayer { given: String, expected: String },

    #[error("Invalid component {0:?}: must be a label value of at most 63 characters")]
    InvalidComponent(String),

    #[error("Rule has neither an alert nor a record name")]
    MissingName,

    #[error("Rule expression is empty")]
    EmptyExpression,

    #[error("Invalid classification key: {0}")]
    InvalidKey(String),
}
