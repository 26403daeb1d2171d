//! Bot orchestrator: creates and stops workers and reports fleet status.
//!
//! Handles:
//! - Creating workers in static (pre-assigned symbol) or dynamic mode
//! - Owning the shared symbol registry and per-symbol lock table
//! - Stopping one or all workers, releasing their symbols
//! - Per-bot snapshots and an account-wide summary

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::api::{ExchangeClient, PriceStream};
use crate::models::{BotStatus, PositionSide, SystemSummary, WorkerSnapshot};
use crate::trading::{
    BotWorker, CoinSelector, SymbolLockTable, SymbolRegistry, TradingConfig, WorkerConfig,
    WorkerContext, WorkerHandle, WorkerTimings,
};

/// How new workers obtain their symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BotMode {
    /// Every worker starts on the same pre-assigned symbol
    Static,
    /// Workers search the market for their own symbol
    Dynamic,
}

struct ManagedBot {
    handle: WorkerHandle,
    task: JoinHandle<()>,
}

/// Owns every running worker and the state they share.
pub struct BotManager {
    ctx: WorkerContext,
    bots: RwLock<HashMap<String, ManagedBot>>,
    started_at: DateTime<Utc>,
}

impl BotManager {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        prices: Arc<dyn PriceStream>,
        trading: TradingConfig,
        timings: WorkerTimings,
    ) -> Self {
        let selector = Arc::new(CoinSelector::new(client.clone(), &trading));
        Self::with_selector(client, prices, trading, timings, selector)
    }

    /// Create with a specific coin selector (seeded in tests).
    pub fn with_selector(
        client: Arc<dyn ExchangeClient>,
        prices: Arc<dyn PriceStream>,
        trading: TradingConfig,
        timings: WorkerTimings,
        selector: Arc<CoinSelector>,
    ) -> Self {
        Self {
            ctx: WorkerContext {
                client,
                prices,
                registry: Arc::new(SymbolRegistry::new()),
                locks: Arc::new(SymbolLockTable::new()),
                selector,
                trading,
                timings,
            },
            bots: RwLock::new(HashMap::new()),
            started_at: Utc::now(),
        }
    }

    pub fn registry(&self) -> &Arc<SymbolRegistry> {
        &self.ctx.registry
    }

    /// Check the account is reachable; returns the available balance.
    pub async fn verify_connection(&self) -> Result<Decimal> {
        let balance = self
            .ctx
            .client
            .balance()
            .await
            .context("API connection check failed")?;
        info!(balance = %balance, "API connection verified");
        Ok(balance)
    }

    /// Create `count` workers sharing one configuration. Returns the ids
    /// actually created; colliding ids are skipped.
    pub async fn add_bots(
        &self,
        mode: BotMode,
        symbol: Option<&str>,
        count: usize,
        config: WorkerConfig,
    ) -> Result<Vec<String>> {
        self.add_bots_at(mode, symbol, count, config, Utc::now().timestamp())
            .await
    }

    async fn add_bots_at(
        &self,
        mode: BotMode,
        symbol: Option<&str>,
        count: usize,
        mut config: WorkerConfig,
        timestamp: i64,
    ) -> Result<Vec<String>> {
        let symbol = symbol.map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty());
        if mode == BotMode::Static && symbol.is_none() {
            bail!("Static mode requires a symbol");
        }
        if config.leverage == 0 {
            bail!("Leverage must be at least 1");
        }
        if config.percent <= Decimal::ZERO {
            bail!("Percent of balance must be positive");
        }

        if config.stop_loss == Some(Decimal::ZERO) {
            config.stop_loss = None;
        }

        self.verify_connection().await?;

        let mut created = Vec::new();
        let mut bots = self.bots.write().await;

        for i in 0..count {
            let (id, assigned) = match (mode, &symbol) {
                (BotMode::Static, Some(s)) => (format!("{}_{}_{}", s, i, timestamp), Some(s.clone())),
                _ => (format!("DYNAMIC_{}_{}", i, timestamp), None),
            };

            if bots.contains_key(&id) {
                warn!(bot = %id, "Bot id already in use, skipping");
                continue;
            }

            let worker = BotWorker::new(id.clone(), assigned, config.clone(), self.ctx.clone());
            let handle = worker.handle();
            let task = tokio::spawn(worker.run());

            bots.insert(id.clone(), ManagedBot { handle, task });
            created.push(id);
        }

        info!(
            mode = ?mode,
            symbol = ?symbol,
            requested = count,
            created = created.len(),
            leverage = config.leverage,
            percent = %config.percent,
            "Bots created"
        );

        Ok(created)
    }

    /// Stop one worker and wait for its cleanup. Returns `false` for an unknown id.
    pub async fn stop_bot(&self, id: &str) -> bool {
        let Some(bot) = self.bots.write().await.remove(id) else {
            return false;
        };

        bot.handle.request_stop();
        let result = bot.task.await;
        self.reap(bot.handle.id(), result);
        info!(bot = %id, "Bot removed");
        true
    }

    /// Stop every worker concurrently.
    pub async fn stop_all(&self) {
        let bots: Vec<(String, ManagedBot)> = self.bots.write().await.drain().collect();
        if bots.is_empty() {
            return;
        }

        info!(count = bots.len(), "Stopping all bots");

        for (_, bot) in &bots {
            bot.handle.request_stop();
        }

        let results = futures::future::join_all(bots.into_iter().map(|(id, bot)| async move {
            (id, bot.task.await)
        }))
        .await;

        for (id, result) in results {
            self.reap(&id, result);
        }
    }

    /// Clear whatever a finished worker still holds. A worker that panicked
    /// never ran its own shutdown, so its claims are dropped here.
    fn reap(&self, id: &str, result: Result<(), JoinError>) {
        if let Err(e) = result {
            error!(bot = %id, error = %e, "Bot task ended abnormally");
        }

        let leaked = self.ctx.registry.release_owner(id);
        if !leaked.is_empty() {
            warn!(bot = %id, symbols = ?leaked, "Released symbols left by stopped bot");
        }
    }

    pub async fn bot_count(&self) -> usize {
        self.bots.read().await.len()
    }

    /// Latest snapshot of every worker, ordered by id.
    pub async fn bots_info(&self) -> Vec<WorkerSnapshot> {
        let mut info: Vec<WorkerSnapshot> = self
            .bots
            .read()
            .await
            .values()
            .map(|b| b.handle.snapshot())
            .collect();
        info.sort_by(|a, b| a.id.cmp(&b.id));
        info
    }

    /// Balance, worker counts by status and account exposure by direction.
    pub async fn system_info(&self) -> Result<SystemSummary> {
        let balance = self.ctx.client.balance().await.context("Failed to fetch balance")?;
        let positions = self
            .ctx
            .client
            .positions(None)
            .await
            .context("Failed to fetch account positions")?;

        let bots = self.bots_info().await;
        let count = |status: BotStatus| bots.iter().filter(|b| b.status == status).count();

        let mut summary = SystemSummary {
            balance,
            total_bots: bots.len(),
            searching_bots: count(BotStatus::Searching),
            waiting_bots: count(BotStatus::Waiting),
            trading_bots: count(BotStatus::Open),
            total_long_count: 0,
            total_short_count: 0,
            total_long_pnl: Decimal::ZERO,
            total_short_pnl: Decimal::ZERO,
            total_unrealized_pnl: Decimal::ZERO,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        };

        for pos in &positions {
            match pos.side() {
                PositionSide::Long => {
                    summary.total_long_count += 1;
                    summary.total_long_pnl += pos.unrealized_pnl;
                }
                PositionSide::Short => {
                    summary.total_short_count += 1;
                    summary.total_short_pnl += pos.unrealized_pnl;
                }
                PositionSide::Flat => continue,
            }
            summary.total_unrealized_pnl += pos.unrealized_pnl;
        }

        Ok(summary)
    }
}
