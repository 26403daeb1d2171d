//! Trading core: symbol coordination, signals, coin selection, risk rules
//! and the per-bot worker.

mod coin_selector;
mod config;
mod position_sizer;
mod registry;
mod sentiment;
mod signal;
mod strategy;
mod symbol_locks;
mod worker;

pub use coin_selector::CoinSelector;
pub use config::{TradingConfig, WorkerConfig, WorkerTimings};
pub use registry::SymbolRegistry;
pub use sentiment::GlobalSentimentAggregator;
pub use signal::MarketSignalProvider;
pub use symbol_locks::SymbolLockTable;
pub use worker::{BotWorker, WorkerContext, WorkerHandle};
