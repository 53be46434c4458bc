//! Template error types with suggestions

use thiserror::Error;

/// A placeholder that could not be bound to a local input or state field
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unresolved placeholder '{{{placeholder}}}' in template \"{template}\"{}", .suggestion.as_ref().map(|s| format!(", did you mean '{}'?", s)).unwrap_or_default())]
pub struct TemplateResolutionError {
    pub placeholder: String,
    pub template: String,
    pub suggestion: Option<String>,
}

impl TemplateResolutionError {
    /// Create an unresolved placeholder error with optional suggestion
    pub fn unresolved(
        placeholder: impl Into<String>,
        template: impl Into<String>,
        known_names: &[&str],
    ) -> Self {
        let placeholder = placeholder.into();
        let head = placeholder.split('.').next().unwrap_or(&placeholder);
        let suggestion = suggest_correction(head, known_names);
        Self {
            placeholder,
            template: template.into(),
            suggestion,
        }
    }
}

/// Route condition errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConditionError {
    /// Expression does not parse
    #[error("invalid condition '{expr}': {message}")]
    Syntax { expr: String, message: String },

    /// Expression failed against the current state
    #[error("condition '{expr}' failed: {message}{}", .suggestion.as_ref().map(|s| format!(", did you mean '{}'?", s)).unwrap_or_default())]
    Evaluation {
        expr: String,
        message: String,
        suggestion: Option<String>,
    },
}

/// Suggest a correction for a typo using Levenshtein distance
pub fn suggest_correction(typo: &str, candidates: &[&str]) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }

    let mut best_match = None;
    let mut best_distance = usize::MAX;
    let max_distance = (typo.len() / 2).max(2); // Allow up to half the length in edits

    for candidate in candidates {
        let distance = levenshtein_distance(typo, candidate);
        if distance < best_distance && distance <= max_distance {
            best_distance = distance;
            best_match = Some(candidate.to_string());
        }
    }

    best_match
}

/// Calculate Levenshtein distance between two strings
fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let a_len = a_chars.len();
    let b_len = b_chars.len();

    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0usize; b_len + 1];

    for i in 1..=a_len {
        curr[0] = i;
        for j in 1..=b_len {
            let cost = if a_chars[i - 1] == b_chars[j - 1] {
                0
            } else {
                1
            };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_len]
}
