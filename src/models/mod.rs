//! Data models for orders, positions, candles and status snapshots.

mod candle;
mod position;
mod snapshot;
mod trade;

pub use candle::{Candle, CandleDirection};
pub use position::ExchangePosition;
pub use snapshot::{BotStatus, SentimentSnapshot, SystemSummary, WorkerSnapshot};
pub use trade::{OrderFill, PositionSide, TradeSide};
