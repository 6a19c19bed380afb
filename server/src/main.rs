use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use printfarm_server::adapter::{self, ApiType, Coordinates};
use printfarm_server::bus::EventBus;
use printfarm_server::config::Config;
use printfarm_server::crypto::SecretCipher;
use printfarm_server::db::{self, Store};
use printfarm_server::fleet::FleetState;
use printfarm_server::{alerts, backup, dispatch, error, filament, scheduler, session};

const SCHEDULER_INTERVAL: Duration = Duration::from_secs(300);
const DISPATCH_INTERVAL: Duration = Duration::from_secs(30);
const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "printfarm-server", about = "Print farm fleet control plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the fleet service (default).
    Serve,
    /// Scheduler operations.
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },
    /// Printer operations.
    Printer {
        #[command(subcommand)]
        action: PrinterAction,
    },
    /// State-store backups.
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Subcommand)]
enum SchedulerAction {
    /// One-shot batch assignment with optional config overrides.
    Run {
        #[arg(long)]
        horizon_days: Option<i64>,
        #[arg(long)]
        setup_minutes: Option<i64>,
        /// HH:MM local time.
        #[arg(long)]
        blackout_start: Option<String>,
        /// HH:MM local time.
        #[arg(long)]
        blackout_end: Option<String>,
    },
}

#[derive(Subcommand)]
enum PrinterAction {
    /// Probe a printer without binding a session.
    Test {
        host: String,
        credentials: String,
        #[arg(long, default_value = "bambu")]
        api_type: String,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    /// Snapshot the state store.
    Create { path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "printfarm_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Scheduler { action } => run_scheduler_command(action).await,
        Command::Printer { action } => run_printer_command(action).await,
        Command::Backup { action } => run_backup_command(action).await,
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Store> {
    let cipher = SecretCipher::from_base64_key(&config.encryption_key)?;
    let pool = db::connect(&config.database_url).await?;
    db::migrate(&pool).await?;
    Ok(Store::new(pool, cipher))
}

async fn serve() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let store = open_store(&config).await?;
    let bus = EventBus::new();
    let fleet = Arc::new(FleetState::new());

    let accounting = Arc::new(filament::FilamentAccounting::new(
        store.clone(),
        bus.clone(),
        config.catalog_url.clone(),
    ));
    let sessions = Arc::new(session::SessionManager::new(
        store.clone(),
        Arc::clone(&fleet),
        bus.clone(),
        config.clone(),
    ));
    let dispatcher = Arc::new(dispatch::Dispatcher::new(
        store.clone(),
        Arc::clone(&fleet),
        bus.clone(),
        Arc::clone(&sessions),
        Arc::clone(&accounting),
    ));
    let batch_scheduler = Arc::new(scheduler::Scheduler::new(
        store.clone(),
        Arc::clone(&fleet),
        bus.clone(),
        config.clone(),
    ));
    let alert_dispatcher = Arc::new(alerts::AlertDispatcher::new(store.clone(), config.clone()));

    // Bus consumers.
    tokio::spawn(Arc::clone(&accounting).run(bus.subscribe("filament-accounting")));
    tokio::spawn(Arc::clone(&dispatcher).run_reconciler(bus.subscribe("dispatch-reconciler")));
    tokio::spawn(Arc::clone(&alert_dispatcher).run(bus.subscribe("alert-dispatcher")));

    sessions.start_all().await?;

    // Periodic drivers.
    let scheduler_task = {
        let batch_scheduler = Arc::clone(&batch_scheduler);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCHEDULER_INTERVAL);
            loop {
                ticker.tick().await;
                match batch_scheduler.run().await {
                    Ok(_) | Err(error::SchedulerError::AlreadyRunning) => {}
                    Err(e) => tracing::warn!("scheduler run failed: {e}"),
                }
            }
        })
    };
    let dispatch_task = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DISPATCH_INTERVAL);
            loop {
                ticker.tick().await;
                dispatcher.dispatch_due().await;
            }
        })
    };
    let retention_task = {
        let store = store.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
            loop {
                ticker.tick().await;
                match store.prune_audit(config.audit_retention_days).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "audit retention sweep");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("audit sweep failed: {e}"),
                }
                match store.prune_telemetry(config.telemetry_retention_days).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "telemetry retention sweep");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("telemetry sweep failed: {e}"),
                }
            }
        })
    };

    tracing::info!("printfarm service running");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    scheduler_task.abort();
    dispatch_task.abort();
    retention_task.abort();
    sessions.stop_all().await;
    bus.close();
    // Give in-flight subscribers a bounded drain window.
    tokio::time::sleep(SHUTDOWN_DRAIN).await;
    Ok(())
}

async fn run_scheduler_command(action: SchedulerAction) -> anyhow::Result<()> {
    let SchedulerAction::Run { horizon_days, setup_minutes, blackout_start, blackout_end } = action;

    let mut config = Config::from_env()?;
    if let Some(days) = horizon_days {
        config.horizon_days = days;
    }
    if let Some(minutes) = setup_minutes {
        config.setup_minutes = minutes;
    }
    if let Some(start) = blackout_start {
        config.blackout_start = chrono::NaiveTime::parse_from_str(&start, "%H:%M")?;
    }
    if let Some(end) = blackout_end {
        config.blackout_end = chrono::NaiveTime::parse_from_str(&end, "%H:%M")?;
    }

    let store = open_store(&config).await?;
    let bus = EventBus::new();
    let fleet = Arc::new(FleetState::new());
    let batch_scheduler = scheduler::Scheduler::new(store, fleet, bus, config);

    let summary = batch_scheduler.run().await?;
    println!(
        "scheduled {} of {} candidates ({} skipped, {} setup blocks)",
        summary.scheduled_count,
        summary.candidate_count,
        summary.skipped_count,
        summary.setup_blocks
    );
    Ok(())
}

async fn run_printer_command(action: PrinterAction) -> anyhow::Result<()> {
    let PrinterAction::Test { host, credentials, api_type } = action;
    let Some(api_type) = ApiType::parse(&api_type) else {
        eprintln!("unknown api type: {api_type}");
        std::process::exit(1);
    };
    let coordinates = Coordinates { host, credentials };
    match adapter::test_connection(api_type, &coordinates).await {
        Ok(()) => {
            println!("reachable");
            Ok(())
        }
        Err(e) => {
            eprintln!("unreachable: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_backup_command(action: BackupAction) -> anyhow::Result<()> {
    let BackupAction::Create { path } = action;
    let config = Config::from_env()?;
    let store = open_store(&config).await?;
    let bus = EventBus::new();
    match backup::create_backup(&store, &bus, &path).await {
        Ok(written) => {
            println!("{}", written.display());
            Ok(())
        }
        Err(e) => {
            eprintln!("backup failed: {e}");
            std::process::exit(1);
        }
    }
}
