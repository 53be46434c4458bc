//! Route condition evaluation
//!
//! Conditions are minijinja expressions over state fields, e.g.
//! `score > 5 and not approved`. Fields are available both directly and
//! under `state.` (`state.score`).

use super::errors::{ConditionError, suggest_correction};
use crate::state::RuntimeState;
use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}

fn wrap(expr: &str) -> String {
    format!("{{% if {expr} %}}true{{% else %}}false{{% endif %}}")
}

/// Check that a condition parses; empty conditions are always valid
pub fn check_condition_syntax(expr: &str) -> Result<(), ConditionError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(());
    }
    let mut env = environment();
    env.add_template_owned("condition", wrap(expr))
        .map_err(|e| ConditionError::Syntax {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;
    Ok(())
}

/// Evaluate a condition against a state; an empty condition is true
pub fn evaluate_condition(expr: &str, state: &RuntimeState) -> Result<bool, ConditionError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(true);
    }

    let mut env = environment();
    env.add_template_owned("condition", wrap(expr))
        .map_err(|e| ConditionError::Syntax {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;

    let template = env
        .get_template("condition")
        .map_err(|e| ConditionError::Syntax {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;

    let mut context = state.values().clone();
    context.insert("state".to_string(), state.to_value());

    let rendered = template
        .render(minijinja::Value::from_serialize(Value::Object(context)))
        .map_err(|e| {
            let known: Vec<&str> = state.values().keys().map(|k| k.as_str()).collect();
            let suggestion = first_identifier(expr)
                .filter(|ident| !known.contains(ident) && *ident != "state")
                .and_then(|ident| suggest_correction(ident, &known));
            ConditionError::Evaluation {
                expr: expr.to_string(),
                message: e.to_string(),
                suggestion,
            }
        })?;

    Ok(rendered == "true")
}

/// First identifier-looking token, used for did-you-mean hints
fn first_identifier(expr: &str) -> Option<&str> {
    expr.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .find(|tok| {
            !tok.is_empty()
                && !tok.chars().next().is_some_and(|c| c.is_ascii_digit())
                && !matches!(*tok, "and" | "or" | "not" | "true" | "false" | "none" | "in" | "is")
        })
}
