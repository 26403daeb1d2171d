//! Exchange access: collaborator traits, Binance futures REST and WebSocket clients.

mod binance_client;
mod exchange;
mod price_stream;
mod types;

#[cfg(test)]
pub mod mock;

pub use binance_client::{BinanceClient, FUTURES_REST_URL};
pub use exchange::{ExchangeClient, PriceStream, PriceTick};
pub use price_stream::{BinancePriceStream, FUTURES_WS_URL};
