//! Validation error type

use std::fmt;

/// First problem found in a workflow document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Pipeline stage that rejected the document
    pub stage: &'static str,
    pub message: String,
    /// Where in the document, e.g. `nodes.summarize.outputs`
    pub location: String,
    pub suggestion: Option<String>,
}

impl ValidationError {
    pub fn new(stage: &'static str, message: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            location: location.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at {})", self.message, self.location)?;
        if let Some(ref suggestion) = self.suggestion {
            write!(f, ", did you mean '{}'?", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}
