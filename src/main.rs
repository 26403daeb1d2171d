//! Leveraged Futures Bot Fleet
//!
//! Runs many independent strategy bots against one Binance futures account.
//! Bots pick coins from a volume signal, follow the account's PnL lean for
//! direction, and manage positions with take-profit, stop-loss and an
//! averaging-down ladder.

mod api;
mod bot;
mod models;
mod trading;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::{BinanceClient, BinancePriceStream, ExchangeClient, FUTURES_REST_URL, FUTURES_WS_URL};
use crate::bot::{BotManager, BotMode};
use crate::models::{SentimentSnapshot, TradeSide, WorkerSnapshot};
use crate::trading::{
    CoinSelector, GlobalSentimentAggregator, MarketSignalProvider, TradingConfig, WorkerConfig,
    WorkerTimings,
};

/// Leveraged futures bot fleet CLI.
#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Run a fleet of leveraged futures trading bots", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Exchange API key
    #[arg(long, env = "BINANCE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Exchange API secret
    #[arg(long, env = "BINANCE_API_SECRET", hide_env_values = true)]
    api_secret: Option<String>,

    /// REST base URL (override for testnet)
    #[arg(long, env = "FLEET_REST_URL", default_value = FUTURES_REST_URL)]
    rest_url: String,

    /// WebSocket stream base URL (override for testnet)
    #[arg(long, env = "FLEET_WS_URL", default_value = FUTURES_WS_URL)]
    ws_url: String,

    /// Quote asset of traded contracts and of the balance
    #[arg(long, env = "FLEET_QUOTE_ASSET", default_value = "USDC")]
    quote: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Direction {
    Buy,
    Sell,
}

impl From<Direction> for TradeSide {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Buy => TradeSide::Buy,
            Direction::Sell => TradeSide::Sell,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start bots and run until Ctrl+C
    Run {
        /// Symbol acquisition mode
        #[arg(short, long, value_enum, default_value = "dynamic")]
        mode: BotMode,

        /// Number of bots to create
        #[arg(short, long, default_value = "1")]
        count: usize,

        /// Pre-assigned symbol (static mode)
        #[arg(short, long)]
        symbol: Option<String>,

        /// Leverage per position
        #[arg(short = 'x', long, default_value = "10")]
        leverage: u32,

        /// Percent of available balance per entry
        #[arg(short, long, default_value = "5")]
        percent: Decimal,

        /// Take-profit ROI percent
        #[arg(short, long, default_value = "100")]
        take_profit: Decimal,

        /// Stop-loss ROI percent (0 disables)
        #[arg(long)]
        stop_loss: Option<Decimal>,

        /// High-water-mark ROI percent that flags the position
        #[arg(long)]
        roi_trigger: Option<Decimal>,

        /// Seconds between status reports
        #[arg(long, default_value = "30")]
        status_interval: u64,
    },

    /// Show account balance and exposure by direction
    Status,

    /// List open account positions
    Positions,

    /// Run one coin-selection pass without trading
    Scan {
        /// Direction to look for
        #[arg(short, long, value_enum)]
        direction: Direction,

        /// Minimum leverage the symbol must allow
        #[arg(short = 'x', long, default_value = "10")]
        leverage: u32,
    },

    /// Show the volume signal and leverage cap for one symbol
    Signal {
        /// Contract symbol, e.g. BTCUSDC
        symbol: String,
    },

    /// Show default timings and trading constants
    Config,
}

impl Cli {
    fn client(&self) -> Result<Arc<BinanceClient>> {
        let client = BinanceClient::with_base_url(
            self.api_key.clone().unwrap_or_default(),
            self.api_secret.clone().unwrap_or_default(),
            self.quote.clone(),
            self.rest_url.clone(),
        )?;
        Ok(Arc::new(client))
    }

    fn require_credentials(&self) -> Result<()> {
        let present = |v: &Option<String>| v.as_deref().map_or(false, |s| !s.is_empty());
        if !present(&self.api_key) || !present(&self.api_secret) {
            anyhow::bail!("BINANCE_API_KEY and BINANCE_API_SECRET must be set");
        }
        Ok(())
    }

    fn trading_config(&self) -> TradingConfig {
        TradingConfig {
            quote_asset: self.quote.to_uppercase(),
            ..TradingConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let trading = cli.trading_config();

    match &cli.command {
        Commands::Run {
            mode,
            count,
            symbol,
            leverage,
            percent,
            take_profit,
            stop_loss,
            roi_trigger,
            status_interval,
        } => {
            cli.require_credentials()?;
            let client: Arc<dyn ExchangeClient> = cli.client()?;
            let prices = Arc::new(BinancePriceStream::with_base_url(cli.ws_url.clone()));

            let config = WorkerConfig {
                leverage: *leverage,
                percent: *percent,
                take_profit: *take_profit,
                stop_loss: *stop_loss,
                roi_trigger: *roi_trigger,
            };

            info!(
                mode = ?mode,
                count = count,
                leverage = leverage,
                percent = %percent,
                take_profit = %take_profit,
                "Starting bot fleet"
            );

            let manager = BotManager::new(client, prices, trading, WorkerTimings::default());
            let ids = manager
                .add_bots(*mode, symbol.as_deref(), *count, config)
                .await
                .context("Failed to create bots")?;

            if ids.is_empty() {
                println!("No bots were created.");
                return Ok(());
            }

            println!("\n=== Futures Bot Fleet ===");
            println!("Bots started:    {}", ids.len());
            println!("Mode:            {:?}", mode);
            println!("Leverage:        {}x", leverage);
            println!("Size per entry:  {}% of balance", percent);
            println!("\nPress Ctrl+C to stop.\n");

            let mut report = tokio::time::interval(Duration::from_secs((*status_interval).max(1)));
            report.tick().await;

            loop {
                tokio::select! {
                    _ = report.tick() => {
                        match manager.system_info().await {
                            Ok(summary) => println!("\n{}", summary),
                            Err(e) => error!(error = %e, "Failed to build account summary"),
                        }
                        print_bots(&manager.bots_info().await);
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                }
            }

            manager.stop_all().await;

            match manager.system_info().await {
                Ok(summary) => println!("\n{}", summary),
                Err(e) => error!(error = %e, "Failed to build final summary"),
            }
        }

        Commands::Status => {
            cli.require_credentials()?;
            let client = cli.client()?;

            let balance = client.balance().await?;
            let sentiment = GlobalSentimentAggregator::new(client.clone()).compute().await?;

            println!("\n=== Account Status ===");
            println!("Quote asset:      {}", client.quote_asset());
            println!("Balance:          ${:.2}", balance);
            print_sentiment(&sentiment);
        }

        Commands::Positions => {
            cli.require_credentials()?;
            let client = cli.client()?;
            let positions = client.positions(None).await?;
            let open: Vec<_> = positions.into_iter().filter(|p| p.is_open()).collect();

            if open.is_empty() {
                println!("No open positions.");
                return Ok(());
            }

            println!(
                "\n{:<16} {:<6} {:>14} {:>14} {:>12} {:>6}",
                "SYMBOL", "SIDE", "AMOUNT", "ENTRY", "UPNL", "LEV"
            );
            println!("{}", "-".repeat(73));

            for p in open {
                println!(
                    "{:<16} {:<6} {:>14} {:>14} {:>12.2} {:>5}x",
                    p.symbol,
                    format!("{:?}", p.side()).to_uppercase(),
                    p.amount.normalize(),
                    p.entry_price.normalize(),
                    p.unrealized_pnl,
                    p.leverage.normalize()
                );
            }
        }

        Commands::Scan {
            direction,
            leverage,
        } => {
            cli.require_credentials()?;
            let client = cli.client()?;
            let selector = CoinSelector::new(client, &trading);
            let target: TradeSide = (*direction).into();

            info!(direction = %target, leverage = leverage, "Scanning instrument universe");
            let eligible = selector
                .eligible_candidates(target, &HashSet::new(), *leverage)
                .await;

            if eligible.is_empty() {
                println!("No symbol currently signals {}.", target);
            } else {
                println!("\nSymbols signalling {} ({}):", target, eligible.len());
                for s in &eligible {
                    println!("  {}", s);
                }
            }
        }

        Commands::Signal { symbol } => {
            let client = cli.client()?;
            let provider = MarketSignalProvider::new(client, &trading);
            let symbol = symbol.to_uppercase();

            let signal = provider.volume_signal(&symbol).await;
            println!("\nSymbol:        {}", symbol);
            println!(
                "Volume signal: {}",
                signal.map(|s| s.to_string()).unwrap_or_else(|| "NONE".to_string())
            );

            if cli.require_credentials().is_ok() {
                match provider.symbol_leverage(&symbol).await {
                    Ok(max) => println!("Max leverage:  {}x", max),
                    Err(e) => println!("Max leverage:  unavailable ({})", e),
                }
            }
        }

        Commands::Config => {
            let timings = WorkerTimings::default();

            println!("\n=== Trading Configuration ===\n");
            println!("Market:");
            println!("  Quote Asset:          {}", trading.quote_asset);
            println!("  Candle Interval:      {}", trading.candle_interval);
            println!("  Candle Window:        {}", trading.candle_limit);
            println!("  Universe Size:        {}", trading.universe_limit);

            println!("\nAveraging Down:");
            println!("  Max Re-entries:       {}", trading.max_average_down);
            let ladder: Vec<String> = trading
                .average_down_ladder
                .iter()
                .map(|l| format!("{}%", l))
                .collect();
            println!("  ROI Ladder:           {}", ladder.join(", "));

            println!("\n=== Worker Timings ===\n");
            println!("  Tick:                 {:?}", timings.tick);
            println!("  Leverage Check:       {:?}", timings.leverage_check);
            println!("  Sentiment Refresh:    {:?}", timings.sentiment_refresh);
            println!("  Position Check:       {:?}", timings.position_check);
            println!("  Trade Retry:          {:?}", timings.trade_retry);
            println!("  Close Cooldown:       {:?}", timings.close_cooldown);
            println!("  Close Retry:          {:?}", timings.close_retry);
            println!("  Average-Down Cooldown:{:?}", timings.average_down_cooldown);
            println!("  Search Backoff:       {:?}", timings.search_backoff);
        }
    }

    Ok(())
}

fn print_sentiment(s: &SentimentSnapshot) {
    println!(
        "Long positions:   {} (P&L: ${:.2}, margin: ${:.2})",
        s.long_count, s.long_pnl, s.long_value
    );
    println!(
        "Short positions:  {} (P&L: ${:.2}, margin: ${:.2})",
        s.short_count, s.short_pnl, s.short_value
    );
    let lean = s
        .leaning()
        .map(|side| side.to_string())
        .unwrap_or_else(|| "TIE".to_string());
    println!("Direction lean:   {}", lean);
}

fn print_bots(bots: &[WorkerSnapshot]) {
    println!(
        "{:<30} {:<14} {:<10} {:<6} {:>12} {:>12} {:>12} {:>4}",
        "BOT", "SYMBOL", "STATUS", "SIDE", "QTY", "ENTRY", "PRICE", "AVG"
    );
    println!("{}", "-".repeat(107));

    for b in bots {
        println!(
            "{:<30} {:<14} {:<10} {:<6} {:>12} {:>12} {:>12} {:>4}",
            truncate(&b.id, 28),
            b.symbol.as_deref().unwrap_or("-"),
            b.status.as_str(),
            format!("{:?}", b.side).to_uppercase(),
            b.quantity.normalize(),
            b.entry_price.normalize(),
            b.current_price
                .map(|p| p.normalize().to_string())
                .unwrap_or_else(|| "-".to_string()),
            b.average_down_count
        );
    }
}

/// Truncate a string to `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
