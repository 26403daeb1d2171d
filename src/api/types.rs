//! Wire types for the Binance USDⓈ-M futures REST and WebSocket APIs.

use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

use crate::models::{Candle, ExchangePosition};

/// Response from /fapi/v1/ticker/price.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceTickerResponse {
    pub symbol: String,
    pub price: Decimal,
}

/// Response from /fapi/v1/exchangeInfo.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfoResponse {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub contract_type: String,
    #[serde(default)]
    pub quote_asset: String,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

impl SymbolInfo {
    /// Perpetual contract currently open for trading.
    pub fn is_tradable_perpetual(&self) -> bool {
        self.status == "TRADING" && self.contract_type == "PERPETUAL"
    }

    pub fn step_size(&self) -> Option<Decimal> {
        self.filters.iter().find_map(|f| match f {
            SymbolFilter::LotSize { step_size, .. } => Some(*step_size),
            SymbolFilter::Other => None,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        step_size: Decimal,
        min_qty: Decimal,
        max_qty: Decimal,
    },
    #[serde(other)]
    Other,
}

/// One leverage bracket from /fapi/v1/leverageBrackets.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeverageBracket {
    pub bracket: u32,
    pub initial_leverage: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolBrackets {
    pub symbol: String,
    pub brackets: Vec<LeverageBracket>,
}

/// The brackets endpoint answers with a single object when a symbol is given
/// and with a list otherwise; accept both.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LeverageBracketsResponse {
    Single(SymbolBrackets),
    Many(Vec<SymbolBrackets>),
}

impl LeverageBracketsResponse {
    /// Highest initial leverage across the brackets of `symbol`.
    pub fn max_leverage(&self, symbol: &str) -> Option<u32> {
        let entry = match self {
            LeverageBracketsResponse::Single(s) => Some(s),
            LeverageBracketsResponse::Many(list) => list.iter().find(|s| s.symbol == symbol),
        }?;
        entry.brackets.iter().map(|b| b.initial_leverage).max()
    }
}

/// Entry from /fapi/v2/balance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEntry {
    pub asset: String,
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default)]
    pub available_balance: Decimal,
}

/// Entry from /fapi/v2/positionRisk.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRiskEntry {
    pub symbol: String,
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    #[serde(rename = "unRealizedProfit", default)]
    pub unrealized_profit: Decimal,
    #[serde(default)]
    pub leverage: Decimal,
}

impl From<PositionRiskEntry> for ExchangePosition {
    fn from(p: PositionRiskEntry) -> Self {
        ExchangePosition {
            symbol: p.symbol,
            amount: p.position_amt,
            entry_price: p.entry_price,
            unrealized_pnl: p.unrealized_profit,
            leverage: p.leverage,
        }
    }
}

/// Response from POST /fapi/v1/order with `newOrderRespType=RESULT`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResultResponse {
    pub order_id: u64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub executed_qty: Decimal,
    #[serde(default)]
    pub avg_price: Decimal,
}

/// Mark price event from the `<symbol>@markPrice@1s` stream.
#[derive(Debug, Clone, Deserialize)]
pub struct MarkPriceEvent {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub mark_price: Decimal,
}

/// Parse one kline row: `[openTime, open, high, low, close, volume, ...]`.
pub fn parse_kline(row: &[Value]) -> Result<Candle> {
    if row.len() < 6 {
        return Err(anyhow!("Kline row too short: {} fields", row.len()));
    }

    let open_time = row[0]
        .as_i64()
        .ok_or_else(|| anyhow!("Kline open time is not an integer"))?;

    let field = |i: usize| -> Result<Decimal> {
        let s = row[i]
            .as_str()
            .ok_or_else(|| anyhow!("Kline field {} is not a string", i))?;
        Ok(Decimal::from_str(s)?)
    };

    Ok(Candle {
        open_time,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(5)?,
    })
}
