// FX trading bot - CLI entry point

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use fx_trading_bot::{
    Broker, Config, LogNotifier, PreFlightValidator, RestBridgeBroker, SimBroker, TradingEngine,
    TradingError, TradingResult,
};

#[derive(Parser)]
#[command(name = "fx-bot")]
#[command(version = "0.1.0")]
#[command(about = "Multi-strategy FX trading bot", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the trading engine
    Run {
        /// Trade against a simulated broker instead of the live bridge
        #[arg(long)]
        paper: bool,

        /// Stop after this many minutes
        #[arg(long)]
        duration_mins: Option<u64>,

        /// Skip pre-flight validation (not recommended)
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Show pre-flight checks and account state
    Status,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_broker(config: &Config, paper: bool) -> TradingResult<Arc<dyn Broker>> {
    if paper {
        let symbols: Vec<String> = config
            .enabled_strategies()
            .flat_map(|(_, s)| s.symbols.iter().cloned())
            .collect();
        info!("📊 Paper mode: simulated broker with synthetic data");
        Ok(Arc::new(SimBroker::paper(&symbols, 10_000.0)))
    } else {
        let broker = RestBridgeBroker::new(
            &config.broker.bridge_url,
            config.broker.api_token.clone(),
            Duration::from_millis(config.engine.broker_timeout_ms),
        )?;
        Ok(Arc::new(broker))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> TradingResult<()> {
    match cli.command {
        Commands::Init { force } => {
            let path = PathBuf::from(&cli.config);
            if path.exists() && !force {
                warn!(
                    "{} already exists, use --force to overwrite",
                    path.display()
                );
                return Ok(());
            }
            Config::default().to_file(&path)?;
            info!("📁 Wrote default configuration to {}", path.display());
            Ok(())
        }

        Commands::Run {
            paper,
            duration_mins,
            skip_preflight,
        } => {
            let path = PathBuf::from(&cli.config);
            let config = Config::load_or_create(&path)?;
            let broker = build_broker(&config, paper)?;

            if skip_preflight {
                warn!("⚠️  Pre-flight validation skipped");
            } else {
                let validator = PreFlightValidator::new(config.clone(), broker.clone());
                let result = validator.validate_all().await;
                result.display();
                if !result.passed {
                    return Err(TradingError::ValidationFailure(
                        "pre-flight validation failed".to_string(),
                    ));
                }
            }

            let mut engine = TradingEngine::new(broker, config, Arc::new(LogNotifier))?
                .with_config_path(path);

            let stop = engine.stop_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Ctrl-C received, stopping after current cycle");
                    stop.store(true, Ordering::Relaxed);
                }
            });

            let duration = duration_mins.map(|mins| Duration::from_secs(mins * 60));
            engine.run(duration).await
        }

        Commands::Status => {
            let config = Config::load_or_create(&cli.config)?;
            let broker = build_broker(&config, false)?;

            let validator = PreFlightValidator::new(config, broker.clone());
            let result = validator.validate_all().await;
            result.display();

            if let Ok(account) = broker.account_info().await {
                info!(
                    "💰 Balance {:.2} | Equity {:.2} | Free margin {:.2}",
                    account.balance, account.equity, account.free_margin
                );
            }
            if let Ok(positions) = broker.positions().await {
                info!("📋 {} open positions", positions.len());
                for position in positions {
                    info!(
                        "   #{} {} {} {:.2} @ {:.5} PnL {:.2}",
                        position.ticket,
                        position.direction,
                        position.symbol,
                        position.volume,
                        position.entry_price,
                        position.unrealized_pnl
                    );
                }
            }
            Ok(())
        }
    }
}
