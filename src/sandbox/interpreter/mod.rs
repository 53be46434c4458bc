//! In-process interpreter for a small, safe subset of Python
//!
//! Scripts read their inputs from the `inputs` dict and publish a value by
//! assigning to `result`. There are no imports, no function definitions,
//! no attribute access outside method calls and no I/O apart from `print`,
//! which is captured.

mod ast;
mod builtins;
mod eval;
mod lexer;
mod parser;
mod value;

use eval::Machine;
use serde_json::{Map, Value as Json};
use std::sync::atomic::AtomicBool;
use thiserror::Error;
use value::{Dict, Value};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("SyntaxError: line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: {message} is not allowed")]
    Forbidden { line: usize, message: String },

    #[error("{kind}: line {line}: {message}")]
    Runtime {
        line: usize,
        kind: &'static str,
        message: String,
    },

    #[error("{0} limit exceeded")]
    Limit(&'static str),

    #[error("execution cancelled")]
    Cancelled,
}

impl ScriptError {
    /// Attach a source line. Runtime errors keep the innermost line.
    pub(crate) fn at(self, at: usize) -> Self {
        match self {
            ScriptError::Syntax { message, .. } => ScriptError::Syntax { line: at, message },
            ScriptError::Forbidden { message, .. } => ScriptError::Forbidden { line: at, message },
            ScriptError::Runtime {
                line: 0,
                kind,
                message,
            } => ScriptError::Runtime {
                line: at,
                kind,
                message,
            },
            other => other,
        }
    }
}

/// Runtime error without a line; the statement executor fills it in
pub(crate) fn runtime(kind: &'static str, message: impl Into<String>) -> ScriptError {
    ScriptError::Runtime {
        line: 0,
        kind,
        message: message.into(),
    }
}

/// Hard caps on what a single script run may consume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Statements plus loop iterations
    pub max_steps: u64,
    pub max_items: usize,
    pub max_str_len: usize,
    pub max_output_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: 10_000_000,
            max_items: 1_000_000,
            max_str_len: 10 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// A parsed script, ready to run any number of times
#[derive(Debug, Clone)]
pub struct Program {
    body: Vec<ast::Stmt>,
}

pub fn compile(code: &str) -> Result<Program, ScriptError> {
    Ok(Program {
        body: parser::parse_program(code)?,
    })
}

/// What a finished script produced
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutput {
    pub result: Json,
    pub stdout: String,
}

/// A failed run still reports what was printed before the error
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptFailure {
    pub error: ScriptError,
    pub stdout: String,
}

/// Run `program` with `inputs` bound as a dict. `cancel` is polled on every
/// statement and loop iteration.
pub fn run(
    program: &Program,
    inputs: &Map<String, Json>,
    cancel: &AtomicBool,
    limits: Limits,
) -> Result<ScriptOutput, ScriptFailure> {
    let mut machine = Machine::new(limits, cancel);
    let mut bound = Dict::default();
    for (key, value) in inputs {
        if let Err(error) = bound.insert(Value::str(key.as_str()), Value::from_json(value)) {
            return Err(ScriptFailure {
                error,
                stdout: String::new(),
            });
        }
    }
    machine.set("inputs", Value::dict(bound));

    let outcome = machine.run(&program.body).and_then(|()| match machine.get("result") {
        Some(value) => value.to_json(),
        None => Ok(Json::Null),
    });
    let stdout = machine.stdout().to_string();
    match outcome {
        Ok(result) => Ok(ScriptOutput { result, stdout }),
        Err(error) => Err(ScriptFailure { error, stdout }),
    }
}
