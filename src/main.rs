//! # StockWatch — product restock alerts over Telegram
//!
//! Usage:
//!   stockwatch                        # Start the poller and the bot (same as `run`)
//!   stockwatch check                  # Run one availability check and print the report
//!   stockwatch status                 # List stored product watches
//!   stockwatch --config ./sw.toml run # Custom config file

mod probe;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stockwatch_channels::{CommandHandler, TelegramChannel, serve};
use stockwatch_core::StockWatchConfig;
use stockwatch_core::config::StoreBackend;
use stockwatch_core::traits::{ProductStore, SystemClock, Transport};
use stockwatch_scheduler::{
    AvailabilityPoller, CronSchedule, JsonFileStore, MemoryStore, NotificationEngine, SqliteStore,
    TickOutcome, spawn_poller,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::probe::HttpProber;

/// Upper bound on waiting for queued alerts at shutdown.
const QUEUE_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "stockwatch",
    version,
    about = "📦 StockWatch — product restock alerts over Telegram"
)]
struct Cli {
    /// Config file (default: ~/.stockwatch/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the availability poller and the Telegram bot
    Run,
    /// Run one availability check now and print the report
    Check,
    /// List stored product watches
    Status,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        "stockwatch=debug,stockwatch_scheduler=debug,\
         stockwatch_channels=debug,stockwatch_core=debug"
    } else {
        "info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<StockWatchConfig> {
    let mut config = match &cli.config {
        Some(path) => StockWatchConfig::load_from(Path::new(&expand_path(path)))
            .with_context(|| format!("loading config from {path}"))?,
        None => StockWatchConfig::load().context("loading config")?,
    };
    config.apply_env();
    Ok(config)
}

fn open_store(config: &StockWatchConfig) -> Result<Arc<dyn ProductStore>> {
    let path = match &config.store.path {
        Some(path) => PathBuf::from(expand_path(path)),
        None => config.store.default_path(),
    };
    let store: Arc<dyn ProductStore> = match config.store.backend {
        StoreBackend::Sqlite => Arc::new(
            SqliteStore::open(&path)
                .with_context(|| format!("opening database {}", path.display()))?,
        ),
        StoreBackend::Json => Arc::new(
            JsonFileStore::open(&path)
                .with_context(|| format!("opening store directory {}", path.display()))?,
        ),
        StoreBackend::Memory => {
            tracing::warn!("⚠️ Using in-memory store; watches are lost on exit");
            Arc::new(MemoryStore::new())
        }
    };
    tracing::info!("💾 Store: {:?} at {}", config.store.backend, path.display());
    Ok(store)
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("⚠️ Failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("SIGINT (Ctrl+C) received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}

struct Services {
    store: Arc<dyn ProductStore>,
    prober: Arc<HttpProber>,
    telegram: Arc<TelegramChannel>,
    notifier: Arc<NotificationEngine>,
    poller: Arc<AvailabilityPoller>,
}

fn build_services(config: &StockWatchConfig) -> Result<Services> {
    config.validate()?;
    let store = open_store(config)?;
    let prober = Arc::new(HttpProber::new(&config.probe)?);
    let telegram = Arc::new(TelegramChannel::new(config.telegram.clone())?);
    let transport: Arc<dyn Transport> = telegram.clone();
    let notifier = Arc::new(NotificationEngine::new(
        transport,
        Arc::new(SystemClock),
        &config.notify,
    ));
    let poller = Arc::new(
        AvailabilityPoller::new(store.clone(), prober.clone(), notifier.clone())
            .with_max_concurrent(config.scheduler.max_concurrent_probes),
    );
    Ok(Services {
        store,
        prober,
        telegram,
        notifier,
        poller,
    })
}

async fn run(config: StockWatchConfig) -> Result<()> {
    let schedule = CronSchedule::parse(&config.scheduler.check_interval).with_context(|| {
        format!("invalid check interval {:?}", config.scheduler.check_interval)
    })?;
    let services = build_services(&config)?;

    let me = services.telegram.get_me().await.context("connecting to Telegram")?;
    tracing::info!(
        "🤖 Telegram bot: @{} ({})",
        me.username.as_deref().unwrap_or("unknown"),
        me.first_name
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = tokio::spawn(spawn_poller(
        services.poller.clone(),
        schedule,
        config.scheduler.run_on_start,
        shutdown_rx.clone(),
    ));

    let handler = Arc::new(CommandHandler::new(
        services.store.clone(),
        services.prober.clone(),
        services.telegram.clone(),
        config.monitor.default_location.clone(),
    ));
    let events = services.telegram.clone().start_polling(shutdown_rx.clone());

    tracing::info!(
        "🚀 StockWatch running (checks: {}, default location: {})",
        config.scheduler.check_interval,
        config.monitor.default_location
    );

    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_tx.send(true).ok();
    });
    serve(
        handler,
        events,
        shutdown_rx,
        config.monitor.max_concurrent_commands,
    )
    .await;
    // The update stream can also end on its own; stop the scheduler either way.
    shutdown_tx.send(true).ok();
    scheduler.await.ok();

    let queue = services.notifier.queue();
    let pending = queue.pending().await;
    if pending > 0 {
        tracing::info!("📤 Waiting for {pending} queued alert(s) to drain...");
    }
    if tokio::time::timeout(QUEUE_FLUSH_TIMEOUT, queue.wait_idle())
        .await
        .is_err()
    {
        tracing::warn!(
            "⚠️ Delivery queue did not drain in time; {} alert(s) dropped",
            queue.pending().await
        );
    }
    tracing::info!("👋 StockWatch stopped");
    Ok(())
}

async fn check(config: StockWatchConfig) -> Result<()> {
    let services = build_services(&config)?;
    let report = match services.poller.run_tick().await {
        TickOutcome::Completed(report) => report,
        TickOutcome::Skipped => {
            println!("Check skipped: another check is running");
            return Ok(());
        }
    };
    tokio::time::timeout(QUEUE_FLUSH_TIMEOUT, services.notifier.queue().wait_idle())
        .await
        .ok();
    let output = serde_json::json!({
        "report": report,
        "alerts": services.notifier.history(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn status(config: StockWatchConfig) -> Result<()> {
    let store = open_store(&config)?;
    let watches = store.list_all().await?;
    if watches.is_empty() {
        println!("📋 No products are being monitored.");
        return Ok(());
    }
    println!("📋 {} monitored product(s):\n", watches.len());
    for watch in watches {
        println!("  {}", watch.url);
        println!("    Location:    {}", watch.location_code);
        println!("    Status:      {}", watch.last_availability.label());
        println!("    Subscribers: {}", watch.subscribers.len());
        println!("    Stop id:     {}", watch.fingerprint);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli);

    let config = load_config(&cli)?;
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Check => check(config).await,
        Commands::Status => status(config).await,
    }
}
