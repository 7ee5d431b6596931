//! Command-line interface: argument definitions and presentation.
//!
//! Output comes in two modes: human tables (default) and JSON (--json).

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tabled::{Table, Tabled};
use uuid::Uuid;

use crate::approval::ApprovalDecision;
use crate::domain::Execution;
use crate::error::Result;
use crate::ledger::ExecutionEvent;
use crate::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "drover")]
#[command(version = "0.1.0")]
#[command(about = "Execution orchestrator for automated trading pipelines", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default/{env}/local config files
    #[arg(short, long, default_value = "config")]
    pub config_dir: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the resident orchestrator
    Run {
        /// Use an in-memory ledger with simulated adapters (no database)
        #[arg(long)]
        simulate: bool,
    },
    /// Apply pending database migrations and exit
    Migrate,
    /// Run one sweep in-process and exit
    Sweep {
        /// Which sweep to run
        #[arg(value_enum, default_value_t = SweepKind::Trigger)]
        kind: SweepKind,
    },
    /// Approve a parked execution by its token
    Approve {
        /// Approval token from the notification link
        token: String,
    },
    /// Reject a parked execution by its token
    Reject {
        /// Approval token from the notification link
        token: String,
        /// Reason recorded on the cancelled execution
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show recent executions
    Status {
        /// Maximum rows to show
        #[arg(long, default_value = "20")]
        limit: i64,
        /// JSON output
        #[arg(long)]
        json: bool,
    },
    /// Show the pre-trade report for an execution
    Report {
        /// Execution id
        execution_id: Uuid,
        /// Owning user id
        #[arg(long)]
        user: Uuid,
    },
    /// Show the audit trail for an execution
    Events {
        /// Execution id
        execution_id: Uuid,
        /// Maximum events to show
        #[arg(long, default_value = "50")]
        limit: i64,
        /// JSON output
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SweepKind {
    /// Evaluate periodic triggers and run admitted executions
    Trigger,
    /// Check flagged executions against the broker
    Reconcile,
    /// Stale cleanup, retention purge, and budget resets
    Maintenance,
}

/// Output mode for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

/// Print a vec of Tabled + Serialize items in the chosen mode.
pub fn print_items<T: Tabled + Serialize>(items: &[T], mode: OutputMode) -> Result<()> {
    match mode {
        OutputMode::Table => {
            if items.is_empty() {
                println!("(no results)");
            } else {
                let table = Table::new(items).to_string();
                println!("{table}");
            }
        }
        OutputMode::Json => {
            let json = serde_json::to_string_pretty(items)?;
            println!("{json}");
        }
    }
    Ok(())
}

pub fn print_success(msg: &str) {
    println!("\x1b[32m{msg}\x1b[0m");
}

pub fn print_warn(msg: &str) {
    println!("\x1b[33m{msg}\x1b[0m");
}

pub fn print_error(msg: &str) {
    eprintln!("\x1b[31m{msg}\x1b[0m");
}

#[derive(Debug, Serialize, Tabled)]
pub struct ExecutionRow {
    pub id: String,
    pub pipeline: String,
    pub status: String,
    pub mode: String,
    pub symbol: String,
    pub cost: String,
    pub started: String,
}

impl ExecutionRow {
    pub fn from_execution(execution: &Execution) -> Self {
        Self {
            id: short_id(&execution.id),
            pipeline: short_id(&execution.pipeline_id),
            status: execution.status.to_string(),
            mode: execution.mode.to_string(),
            symbol: execution.symbol.clone().unwrap_or_default(),
            cost: execution
                .cost
                .map(|c| c.to_string())
                .unwrap_or_default(),
            started: execution
                .started_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct EventRow {
    pub at: String,
    pub event: String,
    pub transition: String,
    pub message: String,
}

impl EventRow {
    pub fn from_event(event: &ExecutionEvent) -> Self {
        let transition = match (&event.from_status, &event.to_status) {
            (Some(from), Some(to)) => format!("{} > {}", from, to),
            _ => String::new(),
        };
        Self {
            at: event.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            event: event.event_type.clone(),
            transition,
            message: event.message.clone().unwrap_or_default(),
        }
    }
}

fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

// ==================== Command handlers ====================

pub async fn show_status(orchestrator: &Orchestrator, limit: i64, mode: OutputMode) -> Result<()> {
    let executions = orchestrator.ledger().recent_executions(limit).await?;
    let rows: Vec<ExecutionRow> = executions.iter().map(ExecutionRow::from_execution).collect();
    print_items(&rows, mode)
}

pub async fn show_events(
    orchestrator: &Orchestrator,
    execution_id: Uuid,
    limit: i64,
    mode: OutputMode,
) -> Result<()> {
    let events = orchestrator.execution_events(execution_id, limit).await?;
    let rows: Vec<EventRow> = events.iter().map(EventRow::from_event).collect();
    print_items(&rows, mode)
}

pub async fn show_report(
    orchestrator: &Orchestrator,
    execution_id: Uuid,
    user_id: Uuid,
) -> Result<()> {
    let report = orchestrator.pre_trade_report(execution_id, user_id).await?;
    println!("Pre-trade report for execution {}\n", execution_id);
    println!("  Action:       {}", report.action.as_deref().unwrap_or("-"));
    println!("  Symbol:       {}", report.symbol.as_deref().unwrap_or("-"));
    println!("  Entry:        {}", format_decimal(report.entry_price));
    println!("  Stop:         {}", format_decimal(report.stop_price));
    println!("  Target:       {}", format_decimal(report.target_price));
    println!("  Size:         {}", format_decimal(report.position_size));
    if let Some(confidence) = report.confidence {
        println!("  Confidence:   {:.0}%", confidence * 100.0);
    }
    if let Some(notes) = &report.risk_notes {
        println!("  Risk notes:   {}", notes);
    }
    println!();
    Ok(())
}

pub async fn approve(orchestrator: &Orchestrator, token: &str) -> Result<()> {
    let execution = orchestrator
        .resolve_approval_inline(token, ApprovalDecision::Approve, None)
        .await?;
    print_success(&format!(
        "Execution {} approved, now {}",
        execution.id, execution.status
    ));
    Ok(())
}

pub async fn reject(orchestrator: &Orchestrator, token: &str, reason: Option<&str>) -> Result<()> {
    let execution = orchestrator
        .resolve_approval_inline(token, ApprovalDecision::Reject, reason)
        .await?;
    print_warn(&format!("Execution {} rejected and cancelled", execution.id));
    Ok(())
}

pub async fn run_sweep(orchestrator: &Orchestrator, kind: SweepKind) -> Result<()> {
    match kind {
        SweepKind::Trigger => {
            let stats = orchestrator.trigger_check_inline().await?;
            print_success(&format!(
                "Trigger sweep: {} evaluated, {} triggered, {} holding an active execution, {} rate-limited, {} errors",
                stats.evaluated,
                stats.triggered,
                stats.skipped_active,
                stats.skipped_rate_limited,
                stats.errors
            ));
        }
        SweepKind::Reconcile => {
            let stats = orchestrator.reconcile_now().await?;
            print_success(&format!(
                "Reconciliation: {} examined, {} completed, {} recovered, {} flagged, {} unreachable, {} errors",
                stats.examined,
                stats.completed,
                stats.recovered,
                stats.flagged,
                stats.unreachable,
                stats.errors
            ));
        }
        SweepKind::Maintenance => {
            let stats = orchestrator.maintenance_now().await?;
            print_success(&format!(
                "Maintenance: {} stale failed, {} purged, {} daily resets, {} monthly resets",
                stats.stale_failed, stats.purged, stats.daily_resets, stats.monthly_resets
            ));
        }
    }
    Ok(())
}

fn format_decimal(value: Option<rust_decimal::Decimal>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
