//! subagent-monitor - hook entry points and diagnostics for subagent tracking
//!
//! `pre-tool-use` and `subagent-stop` are wired as assistant hooks: they read
//! a JSON payload on stdin, print a JSON response on stdout and always exit 0.
//! The remaining subcommands inspect the registry, transcripts and tool-call
//! correlations.

mod hook;
mod report;

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use subagent_monitor_core::logging::LoggingGuard;
use subagent_monitor_core::{ActiveRegistry, Config, Database, FileRegistryStore, Monitor};

use hook::{HookInput, HookResponse};

#[derive(Parser)]
#[command(name = "subagent-monitor")]
#[command(about = "Track subagents spawned by an AI coding assistant")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// PreToolUse hook: register a subagent spawned with the Task tool and
    /// record the caller of MCP tools
    PreToolUse,

    /// SubagentStop hook: attribute the stop and record statistics
    SubagentStop,

    /// Show tracked subagents
    Status {
        /// Only show one session
        #[arg(short, long)]
        session: Option<String>,

        /// Output format: text (default) or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Reconstruct subagent conversations from a transcript
    Chains {
        /// Path to the JSONL transcript
        transcript: PathBuf,

        /// Only show chains of this subagent type
        #[arg(short = 't', long = "type")]
        subagent_type: Option<String>,

        /// Output format: text (default) or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Report the subagent a session is currently running under
    Current {
        #[arg(short, long)]
        session: String,

        /// Output format: text (default) or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Look up which session and subagent made an MCP tool call
    McpContext {
        /// Tool name as the assistant called it (mcp__server__tool)
        #[arg(long, required_unless_present = "stats")]
        tool: Option<String>,

        /// Tool parameters as JSON
        #[arg(long, default_value = "null")]
        params: String,

        /// Leave the correlation in place for later lookups
        #[arg(long)]
        peek: bool,

        /// Show correlation table statistics instead
        #[arg(long)]
        stats: bool,

        /// Output format: json (default) or text
        #[arg(short, long, default_value = "json")]
        format: String,
    },
}

type FileMonitor = Monitor<FileRegistryStore, Database>;

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::PreToolUse => {
            run_hook(hook::pre_tool_use::<FileRegistryStore, Database>);
            Ok(())
        }
        Command::SubagentStop => {
            run_hook(hook::subagent_stop::<FileRegistryStore, Database>);
            Ok(())
        }
        Command::Status { session, format } => {
            let config = Config::load().context("failed to load configuration")?;
            let _log_guard = subagent_monitor_core::logging::init(&config.logging)
                .context("failed to initialize logging")?;
            let registry = open_registry(&config);
            report::status(&registry, session.as_deref(), parse_format(&format)?)
        }
        Command::Chains {
            transcript,
            subagent_type,
            format,
        } => report::chains(&transcript, subagent_type.as_deref(), parse_format(&format)?),
        Command::Current { session, format } => {
            let config = Config::load().context("failed to load configuration")?;
            let _log_guard = subagent_monitor_core::logging::init(&config.logging)
                .context("failed to initialize logging")?;
            let registry = open_registry(&config);
            report::current(&registry, &session, parse_format(&format)?)
        }
        Command::McpContext {
            tool,
            params,
            peek,
            stats,
            format,
        } => {
            let config = Config::load().context("failed to load configuration")?;
            let _log_guard = subagent_monitor_core::logging::init(&config.logging)
                .context("failed to initialize logging")?;
            let format = parse_format(&format)?;
            let db = open_database(&config)?;
            match tool {
                Some(tool) if !stats => {
                    let params: serde_json::Value =
                        serde_json::from_str(&params).context("--params is not valid JSON")?;
                    report::mcp_context(&db, &tool, &params, peek, format)
                }
                _ => report::mcp_stats(&db, format),
            }
        }
    }
}

fn parse_format(format: &str) -> Result<report::Format> {
    match format {
        "text" => Ok(report::Format::Text),
        "json" => Ok(report::Format::Json),
        other => anyhow::bail!("unknown format '{}', expected text or json", other),
    }
}

fn open_registry(config: &Config) -> ActiveRegistry<FileRegistryStore> {
    let store = FileRegistryStore::from_config(config.registry_path(), &config.registry);
    ActiveRegistry::from_config(store, config)
}

/// Run a hook handler. Every failure degrades to a plain "continue".
fn run_hook(handler: impl Fn(&FileMonitor, &HookInput) -> HookResponse) {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("subagent-monitor: {}, using defaults", e);
            Config::default()
        }
    };
    let _log_guard = init_hook_logging(&config);

    let stdin = std::io::stdin();
    let input = if stdin.is_terminal() {
        HookInput::default()
    } else {
        HookInput::from_reader(stdin.lock())
    };
    tracing::debug!(
        event = ?input.hook_event_name,
        tool = ?input.tool_name,
        session_id = ?input.session_id,
        "Hook invoked"
    );

    let response = match open_monitor(&config) {
        Ok(monitor) => handler(&monitor, &input),
        Err(e) => {
            tracing::error!(error = %e, "Failed to open monitor");
            HookResponse::proceed()
        }
    };
    response.print();
}

fn init_hook_logging(config: &Config) -> Option<LoggingGuard> {
    match subagent_monitor_core::logging::init(&config.logging) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("subagent-monitor: failed to initialize logging: {}", e);
            None
        }
    }
}

fn open_monitor(config: &Config) -> Result<FileMonitor> {
    let db = match open_database(config) {
        Ok(db) => db,
        Err(e) => {
            // Registry tracking still works without the statistics database.
            tracing::error!(error = %e, "Statistics database unavailable");
            let db = Database::open_in_memory().context("failed to open fallback database")?;
            db.migrate().context("failed to migrate fallback database")?;
            db
        }
    };
    Ok(Monitor::from_config(open_registry(config), db, config))
}

fn open_database(config: &Config) -> Result<Database> {
    let db_path = config.database_path();
    let db = Database::open_with_timeout(&db_path, config.storage.busy_timeout_ms)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    db.migrate().context("failed to run database migrations")?;
    Ok(db)
}
