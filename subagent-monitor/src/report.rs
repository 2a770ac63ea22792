//! Diagnostic subcommands: `status`, `chains`, `current` and `mcp-context`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use subagent_monitor_core::context::{active_lineage, current_subagent};
use subagent_monitor_core::registry::TrackingSummary;
use subagent_monitor_core::stats::analyze;
use subagent_monitor_core::{
    reconstruct_all, ActiveInvocationRecord, ActiveRegistry, ConversationStats, CorrelationStore,
    RegistryStore, Transcript,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize output")?
    );
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    summary: TrackingSummary,
    subagents: Vec<ActiveInvocationRecord>,
}

pub fn status<S: RegistryStore>(
    registry: &ActiveRegistry<S>,
    session: Option<&str>,
    format: Format,
) -> Result<()> {
    let summary = registry.summary().context("failed to read registry")?;
    let mut subagents = registry.list_all().context("failed to read registry")?;
    if let Some(session) = session {
        subagents.retain(|r| r.session_id == session);
    }
    subagents.sort_by_key(|r| r.started_at);

    if format == Format::Json {
        return print_json(&StatusReport { summary, subagents });
    }

    println!(
        "{} active, {} completing, {} completed",
        summary.active, summary.completing, summary.completed
    );
    if subagents.is_empty() {
        println!("No tracked subagents.");
        return Ok(());
    }
    let now = registry.now();
    println!();
    for record in &subagents {
        println!(
            "  {}  {:<10}  {:<20}  {:>5}s  {}",
            record.tracking_id,
            record.status.as_str(),
            record.subagent_type,
            record.age_secs(now),
            record.description
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct ChainReport {
    subagent_type: String,
    description: String,
    spawn_line: usize,
    root_line: usize,
    messages: usize,
    stats: ConversationStats,
}

pub fn chains(transcript_path: &Path, subagent_type: Option<&str>, format: Format) -> Result<()> {
    let transcript = Transcript::load(transcript_path)
        .with_context(|| format!("failed to read transcript {}", transcript_path.display()))?;
    let reconstruction = reconstruct_all(&transcript);

    let reports: Vec<ChainReport> = reconstruction
        .chains
        .iter()
        .filter(|c| subagent_type.map_or(true, |t| c.subagent_type == t))
        .map(|c| ChainReport {
            subagent_type: c.subagent_type.clone(),
            description: c.description.clone(),
            spawn_line: c.spawn_sequence_index,
            root_line: c.root_sequence_index,
            messages: c.len(),
            stats: analyze(&c.messages),
        })
        .collect();

    if format == Format::Json {
        return print_json(&serde_json::json!({
            "chains": reports,
            "summary": reconstruction.summary(),
            "warnings": reconstruction
                .warnings
                .iter()
                .map(|w| w.to_string())
                .collect::<Vec<_>>(),
            "skipped_lines": transcript.skipped_lines,
        }));
    }

    println!(
        "{} entries, {} spawns, {} chains",
        transcript.entries.len(),
        reconstruction.spawns.len(),
        reconstruction.chains.len()
    );
    for report in &reports {
        println!();
        println!(
            "{} (spawned at line {}, root at line {})",
            report.subagent_type, report.spawn_line, report.root_line
        );
        if !report.description.is_empty() {
            println!("  {}", report.description);
        }
        println!("  {}", report.stats.format_summary());
    }
    if !reconstruction.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &reconstruction.warnings {
            println!("  {}", warning);
        }
    }
    Ok(())
}

pub fn current<S: RegistryStore>(
    registry: &ActiveRegistry<S>,
    session: &str,
    format: Format,
) -> Result<()> {
    let context = current_subagent(registry, session).context("failed to read registry")?;
    let lineage = active_lineage(registry, session).context("failed to read registry")?;

    if format == Format::Json {
        return print_json(&serde_json::json!({
            "context": context,
            "lineage": lineage,
        }));
    }

    match context {
        Some(ctx) => {
            println!(
                "{} (confidence {:.2}, {} active)",
                ctx.subagent_type, ctx.confidence, ctx.active_count
            );
            if lineage.len() > 1 {
                println!("lineage: {}", lineage.join(" > "));
            }
        }
        None => println!("main conversation"),
    }
    Ok(())
}

/// Caller context for an MCP tool call. Unless `peek` is set the correlation
/// is consumed and a second lookup finds nothing.
pub fn mcp_context(
    store: &impl CorrelationStore,
    tool: &str,
    params: &serde_json::Value,
    peek: bool,
    format: Format,
) -> Result<()> {
    let context = store
        .retrieve_correlation(tool, params, !peek, chrono::Utc::now())
        .context("failed to read correlations")?;

    if format == Format::Json {
        return print_json(&context);
    }
    match context {
        Some(ctx) => println!(
            "session {} {} ({:.1}s ago)",
            ctx.session_id,
            ctx.subagent_type.as_deref().unwrap_or("main conversation"),
            ctx.age_secs
        ),
        None => println!("no matching tool call"),
    }
    Ok(())
}

pub fn mcp_stats(store: &impl CorrelationStore, format: Format) -> Result<()> {
    let stats = store
        .correlation_stats(chrono::Utc::now())
        .context("failed to read correlations")?;

    if format == Format::Json {
        return print_json(&stats);
    }
    println!(
        "{} correlations, {} matched, {} sessions, {} subagents",
        stats.total, stats.matched, stats.unique_sessions, stats.unique_subagents
    );
    Ok(())
}
