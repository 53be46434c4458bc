//! Placeholder resolution
//!
//! Placeholders are `{name}` or `{name.sub.path}`. A `state.` prefix is
//! accepted and stripped. Names are looked up in the node's local inputs
//! first and then in state. `{{` and `}}` are literal braces; any other brace
//! that does not wrap an identifier path is left as is.

use super::errors::TemplateResolutionError;
use crate::state::RuntimeState;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{|\}\}|\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\s*\}")
        .expect("placeholder pattern is valid")
});

/// Strip a leading `state.` so `{state.topic}` and `{topic}` are the same
pub fn normalize(path: &str) -> &str {
    match path.strip_prefix("state.") {
        Some(rest) if !rest.is_empty() => rest,
        _ => path,
    }
}

/// Normalized placeholder paths in order of appearance
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| normalize(m.as_str()).to_string()))
        .collect()
}

/// Resolve `template`.
///
/// A template that is exactly one placeholder yields the bound value as is
/// (lists stay lists); anything else renders to a string in which string
/// values are inlined verbatim and other values as JSON.
pub fn resolve(
    template: &str,
    locals: &Map<String, Value>,
    state: &RuntimeState,
) -> Result<Value, TemplateResolutionError> {
    if let Some(caps) = PLACEHOLDER.captures(template) {
        let whole = caps.get(0).map(|m| m.range());
        if let (Some(range), Some(path)) = (whole, caps.get(1)) {
            if range.start == 0 && range.end == template.len() {
                return lookup(path.as_str(), template, locals, state).cloned();
            }
        }
    }
    resolve_string(template, locals, state).map(Value::String)
}

/// Resolve `template` to text
pub fn resolve_string(
    template: &str,
    locals: &Map<String, Value>,
    state: &RuntimeState,
) -> Result<String, TemplateResolutionError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        match caps.get(1) {
            Some(path) => {
                let value = lookup(path.as_str(), template, locals, state)?;
                out.push_str(&render_value(value));
            }
            None => {
                // Escaped brace
                out.push_str(&whole.as_str()[..1]);
            }
        }
    }
    out.push_str(&template[last..]);

    Ok(out)
}

/// Text form of a bound value
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn lookup<'a>(
    raw_path: &str,
    template: &str,
    locals: &'a Map<String, Value>,
    state: &'a RuntimeState,
) -> Result<&'a Value, TemplateResolutionError> {
    let path = normalize(raw_path);
    let mut segments = path.split('.');
    let head = segments.next().unwrap_or(path);

    let root = locals.get(head).or_else(|| state.get(head));
    let found = root.and_then(|root| {
        segments.try_fold(root, |current, segment| current.as_object()?.get(segment))
    });

    found.ok_or_else(|| {
        let known: Vec<&str> = locals
            .keys()
            .map(|k| k.as_str())
            .chain(state.values().keys().map(|k| k.as_str()))
            .collect();
        TemplateResolutionError::unresolved(raw_path, template, &known)
    })
}
