//! Prediction-market settlement service entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use prediction_escrow::api::{create_router, AppState};
use prediction_escrow::clock::{Clock, SystemClock};
use prediction_escrow::config::Config;
use prediction_escrow::error::AppError;
use prediction_escrow::escrow::{InMemoryBank, SettlementEngine};
use prediction_escrow::metrics;
use prediction_escrow::registry::{EventRegistry, Identity};
use prediction_escrow::reporter::{ConfiguredSource, Reporter};
use prediction_escrow::store::{Journal, NoJournal, SqliteStore};
use prediction_escrow::utils::shutdown_signal;

/// Binary prediction-market settlement and escrow service.
#[derive(Parser, Debug)]
#[command(name = "prediction-escrow")]
#[command(about = "Settlement and escrow service for binary prediction markets")]
#[command(version)]
struct Args {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP server port (overrides PORT).
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and, if configured, the reporter (default).
    Serve {
        /// HTTP server port (overrides PORT).
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Check configuration validity.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load();

    // Initialize logging
    let verbose = args.verbose || config.as_ref().map(|c| c.verbose).unwrap_or(false);
    let (filter, rejected) = log_filter(verbose, config.as_ref().ok());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    if let Some(directive) = rejected {
        warn!(%directive, "Invalid RUST_LOG, falling back to info");
    }

    let config = config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    match args.command {
        Some(Command::CheckConfig) => cmd_check_config(&config),
        Some(Command::Serve { port }) => cmd_serve(config, port.or(args.port)).await,
        None => cmd_serve(config, args.port).await,
    }
}

/// Log filter from the loaded config, or from the raw environment when the
/// config did not load. Returns the rejected directive, if any.
fn log_filter(verbose: bool, config: Option<&Config>) -> (EnvFilter, Option<String>) {
    if verbose {
        return (EnvFilter::new("prediction_escrow=debug,info"), None);
    }
    match config {
        Some(config) => match EnvFilter::try_new(&config.rust_log) {
            Ok(filter) => (filter, None),
            Err(_) => (EnvFilter::new("info"), Some(config.rust_log.clone())),
        },
        None => (
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            None,
        ),
    }
}

/// Check configuration validity.
fn cmd_check_config(config: &Config) -> anyhow::Result<()> {
    println!("======================================================================");
    println!("PREDICTION ESCROW - CONFIGURATION CHECK");
    println!("======================================================================");

    print!("Validating configuration... ");
    match config.validate() {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    if let Some(identity) = &config.reporter_identity {
        print!("Checking reporter identity... ");
        match Identity::new(identity.as_str()) {
            Ok(_) => println!("OK"),
            Err(e) => {
                println!("FAILED");
                println!("  Error: {}", e);
                return Err(anyhow::anyhow!("Reporter identity invalid"));
            }
        }
    }

    println!("----------------------------------------------------------------------");
    println!("Configuration Summary:");
    println!("  Port: {}", config.port);
    println!("  Mint after resolution: {}", config.allow_mint_after_resolution);
    println!("  Require future settlement: {}", config.require_future_settlement);
    println!("  Log filter: {}", config.rust_log);
    println!(
        "  State database: {}",
        config.state_path.as_deref().unwrap_or("(none, state is in-memory)")
    );
    match config.initial_balances() {
        Ok(accounts) => println!("  Initial balances: {} account(s)", accounts.len()),
        Err(e) => println!("  Initial balances: {}", e),
    }
    match &config.reporter_identity {
        Some(identity) => {
            println!("  Reporter: {} every {}s", identity, config.reporter_poll_interval_secs);
            println!("  Outcome source: {}", config.outcome_source_lower());
            println!("  Congestion threshold: {}", config.congestion_threshold);
        }
        None => println!("  Reporter: disabled"),
    }
    println!("======================================================================");
    println!("CONFIGURATION CHECK PASSED");
    println!("======================================================================");

    Ok(())
}

/// Open the state database, if configured, and rebuild registry and bank
/// from it.
fn open_state(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<(EventRegistry, InMemoryBank, Arc<dyn Journal>)> {
    let policy = config.registry_policy();
    let Some(path) = config.state_path.as_deref() else {
        warn!("STATE_PATH not set, state will not survive a restart");
        let journal: Arc<dyn Journal> = Arc::new(NoJournal);
        return Ok((EventRegistry::new(clock, policy), InMemoryBank::new(), journal));
    };

    let store = Arc::new(SqliteStore::open(path)?);
    let state = store.load().map_err(AppError::from)?;
    let journal: Arc<dyn Journal> = store;
    let (registry, bank) = state.restore(clock, policy, journal.clone())?;
    Ok((registry, bank, journal))
}

/// Run the HTTP API and the optional reporter until shutdown.
async fn cmd_serve(config: Config, port_override: Option<u16>) -> anyhow::Result<()> {
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(AppError::InvalidConfig(e).into());
    }

    let prometheus = metrics::install_recorder()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (registry, bank, journal) = open_state(&config, clock)?;

    let seeded = bank.seed(config.initial_balances().map_err(AppError::InvalidConfig)?);
    journal.put_accounts(&seeded).map_err(AppError::from)?;
    if !seeded.is_empty() {
        info!(accounts = seeded.len(), "Opened initial accounts");
    }

    let registry = Arc::new(registry);
    let bank = Arc::new(bank);
    info!(events = registry.len(), "Registry ready");

    let engine = SettlementEngine::new(registry.clone(), bank.clone(), config.mint_policy());
    let app_state = AppState::new(engine).with_metrics(prometheus);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start HTTP server
    let port = port_override.unwrap_or(config.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let router = create_router(app_state.clone());
    let mut server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    // Start reporter
    let reporter_handle = match &config.reporter_identity {
        Some(identity) => {
            let identity = Identity::new(identity.as_str())?;
            let source = ConfiguredSource::from_config(&config)?;
            let reporter = Reporter::new(identity, registry.clone(), source)
                .with_backoff(config.backoff())
                .with_poll_interval(config.poll_interval());
            let rx = shutdown_rx.clone();
            Some(tokio::spawn(async move { reporter.run(rx).await }))
        }
        None => {
            info!("REPORTER_IDENTITY not set, reporter disabled");
            None
        }
    };

    app_state.set_ready(true);
    info!("========================================");
    info!("PREDICTION ESCROW STARTED");
    info!("========================================");

    shutdown_signal().await;
    app_state.set_ready(false);
    let _ = shutdown_tx.send(true);

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("HTTP server error: {}", e),
        Err(e) => warn!("HTTP server task failed: {}", e),
    }
    if let Some(handle) = reporter_handle {
        if let Err(e) = handle.await {
            warn!("Reporter task failed: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}
