//! CLI module for flowstate
//!
//! This module provides:
//! - Command implementations (validate, run, history, runs)
//! - Output handlers (console, JSON, quiet)
//! - Signal handling for graceful shutdown
//!
//! # Example
//!
//! ```ignore
//! use flowstate::cli::{OutputMode, create_handler, validate_workflow};
//!
//! let handler = create_handler(OutputMode::Console, false);
//! let exit_code = validate_workflow(Path::new("digest.toml"), &config, &*handler)?;
//! ```

pub mod commands;
pub mod output;
pub mod signals;

pub use commands::{list_runs, parse_inputs, run_workflow, show_history, validate_workflow};
pub use output::{OutputEvent, OutputHandler, OutputMode, create_handler};
pub use signals::setup_signal_handlers;
