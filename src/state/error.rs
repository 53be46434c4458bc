//! State construction errors

use crate::types::TypeParseError;
use thiserror::Error;

/// Raised while building a factory from a schema (load time)
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateBuilderError {
    #[error("field '{path}' has type object but no nested schema")]
    MissingNestedSchema { path: String },

    #[error("field '{path}' has an empty nested schema")]
    EmptyNestedSchema { path: String },

    #[error("field '{path}' declares nested fields but is not an object")]
    UnexpectedNestedSchema { path: String },

    #[error("field '{path}' has invalid type: {source}")]
    InvalidType {
        path: String,
        #[source]
        source: TypeParseError,
    },

    #[error("field '{path}' cannot be both required and have a default")]
    RequiredWithDefault { path: String },

    #[error("field '{path}' default does not match type {expected}")]
    InvalidDefault { path: String, expected: String },

    #[error("schema has no fields")]
    EmptySchema,
}

/// Raised when constructing or updating a runtime state
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    #[error("missing required field '{path}'")]
    MissingField { path: String },

    #[error("unknown field '{path}'")]
    UnknownField { path: String },

    #[error("field '{path}' expects {expected}, got {actual}")]
    TypeMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

impl StateError {
    /// Dotted path of the offending field
    pub fn path(&self) -> &str {
        match self {
            StateError::MissingField { path }
            | StateError::UnknownField { path }
            | StateError::TypeMismatch { path, .. } => path,
        }
    }
}
