//! flowstate - declarative, checkpointed execution of LLM workflow graphs
//!
//! A workflow document declares typed state fields, nodes that read and
//! write them, and the edges between nodes. The engine validates the graph
//! up front, then walks it node by node: inputs are resolved from state,
//! the model (or a sandboxed script) produces the declared outputs, and each
//! result is applied copy-on-write and checkpointed to SQLite.

pub mod cli;
pub mod config;
pub mod engine;
pub mod executor;
pub mod llm;
pub mod logging;
pub mod sandbox;
pub mod state;
pub mod storage;
pub mod template;
pub mod tools;
pub mod types;
pub mod validation;
