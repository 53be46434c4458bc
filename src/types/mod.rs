//! Field type system for workflow state
//!
//! Parses declarative type strings (`str`, `list[int]`, `dict[str, float]`,
//! `object`) into a [`TypeExpr`] tree and checks JSON values against it.

mod parser;

pub use parser::{TypeExpr, TypeParseError, parse_type, resolve, validate};
