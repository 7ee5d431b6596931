use clap::Parser;
use drover::adapters::{BrokerClient, DecisionRunner, Notifier, SimulatedBroker, SimulatedRunner, SmsNotifier};
use drover::cli::{self, Cli, Commands, OutputMode};
use drover::config::AppConfig;
use drover::domain::{Pipeline, TriggerMode};
use drover::error::{DroverError, Result};
use drover::ledger::{MemoryLedger, PipelineStore, PostgresLedger};
use drover::orchestrator::Orchestrator;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = dispatch(&cli).await {
        cli::print_error(&format!("error: {e}"));
        std::process::exit(1);
    }
}

async fn dispatch(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Run { simulate } => {
            init_logging();
            run_orchestrator(cli, *simulate).await
        }
        Commands::Migrate => {
            init_logging_simple();
            run_migrate(cli).await
        }
        Commands::Sweep { kind } => {
            init_logging();
            let orchestrator = build_orchestrator(cli, false).await?;
            cli::run_sweep(&orchestrator, *kind).await
        }
        Commands::Approve { token } => {
            init_logging_simple();
            let orchestrator = build_orchestrator(cli, false).await?;
            cli::approve(&orchestrator, token).await
        }
        Commands::Reject { token, reason } => {
            init_logging_simple();
            let orchestrator = build_orchestrator(cli, false).await?;
            cli::reject(&orchestrator, token, reason.as_deref()).await
        }
        Commands::Status { limit, json } => {
            init_logging_simple();
            let orchestrator = build_orchestrator(cli, false).await?;
            cli::show_status(&orchestrator, *limit, OutputMode::from_json_flag(*json)).await
        }
        Commands::Report { execution_id, user } => {
            init_logging_simple();
            let orchestrator = build_orchestrator(cli, false).await?;
            cli::show_report(&orchestrator, *execution_id, *user).await
        }
        Commands::Events { execution_id, limit, json } => {
            init_logging_simple();
            let orchestrator = build_orchestrator(cli, false).await?;
            cli::show_events(
                &orchestrator,
                *execution_id,
                *limit,
                OutputMode::from_json_flag(*json),
            )
            .await
        }
    }
}

/// Resident mode: start the dispatcher and sweep tickers, run until a
/// shutdown signal arrives.
async fn run_orchestrator(cli: &Cli, simulate: bool) -> Result<()> {
    info!("Starting drover execution orchestrator");

    let orchestrator = build_orchestrator(cli, simulate).await?;
    orchestrator.start().await?;

    info!("Orchestrator is running. Press Ctrl+C to stop.");
    shutdown_signal().await;

    info!("Shutting down...");
    orchestrator.shutdown();
    info!("Shutdown complete");
    Ok(())
}

async fn run_migrate(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let ledger = PostgresLedger::new(&config.database.url, config.database.max_connections).await?;
    ledger.migrate().await?;
    cli::print_success("Migrations applied");
    Ok(())
}

/// Wire an orchestrator from config.
///
/// The decision runner and broker are the shipped dry-run stand-ins;
/// embedders supply production implementations through `Orchestrator::new`.
/// With `simulate` the ledger is in-memory too and a demo pipeline is
/// seeded so the trigger sweep has something to pick up.
async fn build_orchestrator(cli: &Cli, simulate: bool) -> Result<Arc<Orchestrator>> {
    let runner: Arc<dyn DecisionRunner> = Arc::new(SimulatedRunner::default());
    let broker: Arc<dyn BrokerClient> = Arc::new(SimulatedBroker::default());

    if simulate {
        info!("Simulation mode: in-memory ledger, no database");
        let config = AppConfig::default();
        let ledger = Arc::new(MemoryLedger::new());
        seed_demo_pipeline(&ledger).await?;
        return Ok(Orchestrator::new(config, ledger, runner, broker, None));
    }

    let config = load_config(cli)?;
    let ledger = PostgresLedger::new(&config.database.url, config.database.max_connections).await?;
    ledger.migrate().await?;
    info!("Database connected");

    let notifier = SmsNotifier::from_config(&config.approval).map(|n| n as Arc<dyn Notifier>);
    if notifier.is_some() {
        info!("SMS notifier active");
    }

    Ok(Orchestrator::new(config, Arc::new(ledger), runner, broker, notifier))
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let config = match AppConfig::load_from(&cli.config_dir) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            info!("Using default configuration");
            AppConfig::default()
        }
    };

    if let Err(problems) = config.validate() {
        for problem in &problems {
            error!("Config: {}", problem);
        }
        return Err(DroverError::Validation(format!(
            "{} configuration problem(s)",
            problems.len()
        )));
    }

    Ok(config)
}

async fn seed_demo_pipeline(ledger: &Arc<MemoryLedger>) -> Result<()> {
    let mut pipeline = Pipeline::new(uuid::Uuid::new_v4(), "demo-momentum", TriggerMode::Periodic);
    pipeline.interval_minutes = 1;
    pipeline.monitor_interval_minutes = 0.25;
    ledger.create_pipeline(&pipeline).await?;
    info!(pipeline_id = %pipeline.id, "Seeded demo pipeline");
    Ok(())
}

/// Confirm the log directory exists and accepts writes before handing it to
/// the rolling appender, which panics on an unwritable path. With
/// `panic = "abort"` in release builds that would take the process down.
fn log_dir_writable(dir: &std::path::Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let marker = dir.join(".drover-write-check");
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&marker)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&marker);
            true
        }
        Err(_) => false,
    }
}

fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,drover=debug,sqlx=warn"));

    let log_dir = std::env::var("DROVER_LOG_DIR")
        .or_else(|_| std::env::var("LOG_DIR"))
        .unwrap_or_else(|_| "/var/log/drover".to_string());

    let file_layer = if log_dir_writable(std::path::Path::new(&log_dir)) {
        let appender = tracing_appender::rolling::daily(&log_dir, "drover.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // The guard flushes on drop; the resident process keeps it forever.
        Box::leak(Box::new(guard));
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
    } else {
        eprintln!(
            "Warning: log directory {} is not writable, file logging disabled",
            log_dir
        );
        None
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if file_logging_enabled {
        eprintln!("Logging to: {}/drover.log", log_dir);
    }
}

fn init_logging_simple() {
    // Minimal logging for one-shot CLI commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
