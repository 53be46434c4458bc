//! Output handlers for CLI commands
//!
//! Supports console (pretty), JSON, and quiet output modes.

use clap::ValueEnum;
use serde::Serialize;
use std::io::{self, Write};

/// Output mode for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

/// Events emitted by CLI commands
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    WorkflowValid {
        name: String,
        nodes: usize,
        edges: usize,
    },
    WorkflowInvalid {
        stage: String,
        message: String,
        location: String,
        suggestion: Option<String>,
    },
    RunStart {
        workflow: String,
        nodes: usize,
    },
    NodeTiming {
        node_id: String,
        duration_ms: u64,
    },
    RunComplete {
        run_id: String,
        success: bool,
        duration_ms: u64,
        total_tokens: u64,
        cost_usd: f64,
        nodes_executed: usize,
    },
    RunError {
        error: String,
    },
    Checkpoint {
        node_id: String,
        status: String,
        duration_ms: u64,
        tokens: u64,
        created_at: String,
    },
    Run {
        run_id: String,
        workflow: String,
        status: String,
        started_at: String,
        duration_ms: Option<u64>,
    },
    Info {
        message: String,
    },
}

pub trait OutputHandler: Send + Sync {
    fn emit(&self, event: OutputEvent);

    /// Write the final result (state JSON for runs)
    fn result(&self, success: bool, output: Option<&str>);
}

pub struct ConsoleHandler {
    debug: bool,
}

impl ConsoleHandler {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    fn format_duration(ms: u64) -> String {
        if ms < 1000 {
            format!("{}ms", ms)
        } else {
            format!("{:.1}s", ms as f64 / 1000.0)
        }
    }
}

impl OutputHandler for ConsoleHandler {
    fn emit(&self, event: OutputEvent) {
        match event {
            OutputEvent::WorkflowValid { name, nodes, edges } => {
                eprintln!("✓ Workflow '{}' is valid ({} nodes, {} edges)", name, nodes, edges);
            }
            OutputEvent::WorkflowInvalid {
                stage,
                message,
                location,
                suggestion,
            } => {
                eprintln!("✗ Validation failed at stage '{}'", stage);
                eprintln!("  {}", message);
                eprintln!("  at: {}", location);
                if let Some(suggestion) = suggestion {
                    eprintln!("  did you mean '{}'?", suggestion);
                }
            }
            OutputEvent::RunStart { workflow, nodes } => {
                eprintln!("Running workflow '{}' ({} nodes)", workflow, nodes);
            }
            OutputEvent::NodeTiming {
                node_id,
                duration_ms,
            } => {
                if self.debug {
                    eprintln!("  {} ({})", node_id, Self::format_duration(duration_ms));
                }
            }
            OutputEvent::RunComplete {
                run_id,
                success,
                duration_ms,
                total_tokens,
                cost_usd,
                nodes_executed,
            } => {
                eprintln!();
                let mark = if success { "✓" } else { "✗" };
                let verb = if success { "completed" } else { "failed" };
                eprintln!(
                    "{} Run {} {} after {} node(s) in {} ({} tokens, ${:.4})",
                    mark,
                    run_id,
                    verb,
                    nodes_executed,
                    Self::format_duration(duration_ms),
                    total_tokens,
                    cost_usd
                );
            }
            OutputEvent::RunError { error } => {
                eprintln!("Error: {}", error);
            }
            OutputEvent::Checkpoint {
                node_id,
                status,
                duration_ms,
                tokens,
                created_at,
            } => {
                let mark = if status == "completed" { "✓" } else { "✗" };
                println!(
                    "{} {:<24} {:>8} {:>8} tokens  {}",
                    mark,
                    node_id,
                    Self::format_duration(duration_ms),
                    tokens,
                    created_at
                );
            }
            OutputEvent::Run {
                run_id,
                workflow,
                status,
                started_at,
                duration_ms,
            } => {
                let duration = duration_ms
                    .map(Self::format_duration)
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:<20} {:<10} {:>8}  {}",
                    run_id, workflow, status, duration, started_at
                );
            }
            OutputEvent::Info { message } => {
                eprintln!("{}", message);
            }
        }
        let _ = io::stderr().flush();
    }

    fn result(&self, _success: bool, output: Option<&str>) {
        if let Some(out) = output {
            println!("{}", out);
        }
    }
}

pub struct JsonHandler {
    pretty: bool,
}

impl JsonHandler {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn print_json<T: Serialize>(&self, value: &T) {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };

        if let Ok(s) = json {
            println!("{}", s);
        }
    }
}

impl OutputHandler for JsonHandler {
    fn emit(&self, event: OutputEvent) {
        self.print_json(&event);
    }

    fn result(&self, success: bool, output: Option<&str>) {
        #[derive(Serialize)]
        struct FinalResult {
            success: bool,
            output: Option<serde_json::Value>,
        }

        // Embed state JSON as a value rather than an escaped string
        let output = output.map(|s| {
            serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.to_string()))
        });
        self.print_json(&FinalResult { success, output });
    }
}

/// Prints only the final result
pub struct QuietHandler;

impl OutputHandler for QuietHandler {
    fn emit(&self, event: OutputEvent) {
        // Listings are the result of history/runs
        match event {
            OutputEvent::Checkpoint { .. } | OutputEvent::Run { .. } => {
                ConsoleHandler::new(false).emit(event)
            }
            OutputEvent::RunError { error } => eprintln!("Error: {}", error),
            _ => {}
        }
    }

    fn result(&self, _success: bool, output: Option<&str>) {
        if let Some(out) = output {
            println!("{}", out);
        }
    }
}

pub fn create_handler(mode: OutputMode, debug: bool) -> Box<dyn OutputHandler> {
    match mode {
        OutputMode::Console => Box::new(ConsoleHandler::new(debug)),
        OutputMode::Json => Box::new(JsonHandler::new(true)),
        OutputMode::Quiet => Box::new(QuietHandler),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records events for assertions
    #[derive(Default)]
    pub(crate) struct RecordingHandler {
        pub events: Mutex<Vec<OutputEvent>>,
        pub results: Mutex<Vec<(bool, Option<String>)>>,
    }

    impl RecordingHandler {
        pub fn events(&self) -> Vec<OutputEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl OutputHandler for RecordingHandler {
        fn emit(&self, event: OutputEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn result(&self, success: bool, output: Option<&str>) {
            self.results
                .lock()
                .unwrap()
                .push((success, output.map(str::to_string)));
        }
    }

    #[test]
    fn test_console_format_duration() {
        assert_eq!(ConsoleHandler::format_duration(500), "500ms");
        assert_eq!(ConsoleHandler::format_duration(1000), "1.0s");
        assert_eq!(ConsoleHandler::format_duration(2500), "2.5s");
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = OutputEvent::RunError {
            error: "boom".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "run_error");
        assert_eq!(value["error"], "boom");
    }

    #[test]
    fn test_create_handler() {
        let _ = create_handler(OutputMode::Console, false);
        let _ = create_handler(OutputMode::Json, false);
        let _ = create_handler(OutputMode::Quiet, false);
    }
}
