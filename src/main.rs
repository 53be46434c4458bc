use anyhow::Result;
use clap::{Parser, Subcommand};
use flowstate::cli::{
    OutputMode, create_handler, list_runs, run_workflow, setup_signal_handlers, show_history,
    validate_workflow,
};
use flowstate::config::{EngineConfig, load_workflow_file};
use flowstate::engine::CancellationToken;
use flowstate::logging;
use flowstate::storage::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "flowstate")]
#[command(about = "Run declarative LLM workflow graphs with checkpoints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory for .flowstate/config.toml (defaults to current)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Checkpoint database (overrides storage.database)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputMode::Console)]
    output: OutputMode,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Suppress normal output
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow document without running it
    Validate {
        /// Workflow file (.toml or .json)
        workflow: PathBuf,
    },

    /// Run a workflow
    Run {
        /// Workflow file (.toml or .json)
        workflow: PathBuf,

        /// Initial state as key=value pairs
        #[arg(trailing_var_arg = true)]
        inputs: Vec<String>,
    },

    /// Show a run and its checkpoints
    History {
        run_id: String,
    },

    /// List recent runs
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load(cli.dir.as_deref())?;
    let mode = if cli.quiet { OutputMode::Quiet } else { cli.output };
    let handler = create_handler(mode, cli.debug);

    let code = match cli.command {
        Commands::Validate { workflow } => {
            let _guard = logging::init_logging(cli.debug, cli.quiet, None, cli.log_file)?;
            validate_workflow(&workflow, &config, &*handler)?
        }

        Commands::Run { workflow, inputs } => {
            // The document may raise or lower the log level; load errors
            // are reported by the run itself
            let spec = load_workflow_file(&workflow).ok();
            let level = spec
                .as_ref()
                .and_then(|s| s.config.observability.log_level.clone());
            let log_file = cli.log_file.or_else(|| {
                spec.as_ref()
                    .and_then(|s| logging::default_log_path(&s.flow.name).ok())
            });
            let _guard = logging::init_logging(cli.debug, cli.quiet, level.as_deref(), log_file)?;

            let store = Arc::new(open_store(cli.db, &config)?);
            let token = CancellationToken::new();
            tokio::spawn(setup_signal_handlers(token.clone()));

            run_workflow(&workflow, &inputs, &config, store, &*handler, &token).await?
        }

        Commands::History { run_id } => {
            let _guard = logging::init_logging(cli.debug, cli.quiet, None, cli.log_file)?;
            let store = open_store(cli.db, &config)?;
            show_history(&store, &run_id, &*handler)?
        }

        Commands::Runs { limit } => {
            let _guard = logging::init_logging(cli.debug, cli.quiet, None, cli.log_file)?;
            let store = open_store(cli.db, &config)?;
            list_runs(&store, limit, &*handler)?
        }
    };

    std::process::exit(code);
}

fn open_store(db: Option<PathBuf>, config: &EngineConfig) -> Result<SqliteStore> {
    let path = match db {
        Some(path) => path,
        None => config.storage.database_path()?,
    };
    Ok(SqliteStore::open(&path)?)
}
