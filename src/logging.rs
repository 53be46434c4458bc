//! Tracing subscriber setup for the CLI

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive for a level name; `None` for unknown names
pub fn filter_for(level: &str) -> Option<&'static str> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Some("flowstate=trace"),
        "debug" => Some("flowstate=debug"),
        "info" => Some("flowstate=info"),
        "warn" | "warning" => Some("flowstate=warn"),
        "error" => Some("flowstate=error"),
        _ => None,
    }
}

/// Initialize logging. `level` (from the workflow's observability section)
/// overrides the flags when set. Keep the returned guard alive until exit
/// so buffered file output is flushed.
pub fn init_logging(
    debug: bool,
    quiet: bool,
    level: Option<&str>,
    log_file: Option<PathBuf>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let directive = level.and_then(filter_for).unwrap_or(if debug {
        "flowstate=debug"
    } else if quiet {
        "flowstate=error"
    } else {
        "flowstate=info"
    });
    let env_filter = EnvFilter::new(directive);

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(debug)
        .with_file(debug)
        .with_writer(std::io::stderr);

    if let Some(log_path) = log_file {
        let (dir, name) = split_log_path(&log_path)?;
        std::fs::create_dir_all(&dir)?;

        let appender = tracing_appender::rolling::never(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_target(true)
            .with_line_number(true)
            .with_file(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .try_init()?;
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
        Ok(None)
    }
}

fn split_log_path(path: &Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("log file path has no file name: {}", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, PathBuf::from(name)))
}

/// Default log file path for a workflow
pub fn default_log_path(workflow_name: &str) -> anyhow::Result<PathBuf> {
    let log_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("flowstate")
        .join("logs");

    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let filename = format!("{}-{}.log", workflow_name, timestamp);

    Ok(log_dir.join(filename))
}
