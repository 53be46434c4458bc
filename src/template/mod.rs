//! Template resolution for node inputs and prompts
//!
//! # Features
//!
//! - Placeholder binding: `{topic}`, `{state.topic}`, `{report.meta.title}`
//! - Local inputs shadow state fields
//! - Single-placeholder templates keep the bound value's type
//! - Route conditions as minijinja expressions over state
//!
//! # Example
//!
//! ```ignore
//! use flowstate::template::resolve_string;
//!
//! let prompt = resolve_string("Summarize {state.topic}", &locals, &state)?;
//! ```

mod conditions;
mod errors;
mod resolver;

pub use conditions::{check_condition_syntax, evaluate_condition};
pub use errors::{ConditionError, TemplateResolutionError, suggest_correction};
pub use resolver::{normalize, placeholders, render_value, resolve, resolve_string};
