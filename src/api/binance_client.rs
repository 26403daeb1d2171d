//! Binance USDⓈ-M futures REST client.
//!
//! Handles:
//! - HMAC-SHA256 request signing for account endpoints
//! - Market data (prices, klines, exchange info, leverage brackets)
//! - Market order placement and cancellation
//! - Retrying idempotent reads on transient failures

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::models::{Candle, ExchangePosition, OrderFill, TradeSide};

use super::exchange::ExchangeClient;
use super::types::*;

type HmacSha256 = Hmac<Sha256>;

pub const FUTURES_REST_URL: &str = "https://fapi.binance.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const RECV_WINDOW_MS: u64 = 5000;
const MAX_RETRY_ELAPSED: Duration = Duration::from_secs(10);

/// Signed client for the futures API.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    quote_asset: String,
    step_sizes: RwLock<HashMap<String, Decimal>>,
}

impl BinanceClient {
    /// Create a client against the production endpoint.
    pub fn new(api_key: String, api_secret: String, quote_asset: String) -> Result<Self> {
        Self::with_base_url(api_key, api_secret, quote_asset, FUTURES_REST_URL.to_string())
    }

    /// Create with custom base URL (testnet).
    pub fn with_base_url(
        api_key: String,
        api_secret: String,
        quote_asset: String,
        base_url: String,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
            quote_asset: quote_asset.to_uppercase(),
            step_sizes: RwLock::new(HashMap::new()),
        })
    }

    pub fn quote_asset(&self) -> &str {
        &self.quote_asset
    }

    /// Append timestamp, recvWindow and signature to the query parameters.
    fn signed_query(&self, mut params: Vec<(&str, String)>) -> Result<String> {
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));

        let query = serde_urlencoded::to_string(&params)?;

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .context("Invalid API secret length")?;
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{}&signature={}", query, signature))
    }

    /// Send one request and decode the JSON body, failing on non-success status.
    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        signed: bool,
    ) -> std::result::Result<T, RequestError> {
        let mut request = self.http.request(method, url);
        if signed {
            request = request.header("X-MBX-APIKEY", &self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RequestError::Transport(anyhow!(e).context("Request failed")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RequestError::Status(status, body));
        }

        response
            .json()
            .await
            .map_err(|e| RequestError::Decode(anyhow!(e).context("Failed to parse response")))
    }

    /// Public GET with retries on transient failures.
    async fn get_public<T: DeserializeOwned>(&self, path: &str, query: &str) -> Result<T> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        debug!(url = %url, "GET");

        let url = url.as_str();
        retry_transient(move || self.send(Method::GET, url, false)).await
    }

    /// Signed GET with retries on transient failures; re-signed on every attempt.
    async fn get_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T> {
        let params = &params;
        retry_transient(move || async move {
            let query = self
                .signed_query(params.clone())
                .map_err(RequestError::Transport)?;
            let url = format!("{}{}?{}", self.base_url, path, query);
            self.send(Method::GET, &url, true).await
        })
        .await
    }

    /// Signed mutating request. Never retried.
    async fn send_signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T> {
        let query = self.signed_query(params)?;
        let url = format!("{}{}?{}", self.base_url, path, query);
        self.send(method, &url, true).await.map_err(RequestError::into_anyhow)
    }

    async fn exchange_info(&self) -> Result<ExchangeInfoResponse> {
        self.get_public("/fapi/v1/exchangeInfo", "")
            .await
            .context("Failed to fetch exchange info")
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn max_leverage(&self, symbol: &str) -> Result<u32> {
        let response: LeverageBracketsResponse = self
            .get_signed("/fapi/v1/leverageBrackets", vec![("symbol", symbol.to_string())])
            .await
            .with_context(|| format!("Failed to fetch leverage brackets for {}", symbol))?;

        response
            .max_leverage(symbol)
            .ok_or_else(|| anyhow!("No leverage brackets for {}", symbol))
    }

    async fn step_size(&self, symbol: &str) -> Result<Decimal> {
        if let Some(step) = self.step_sizes.read().await.get(symbol) {
            return Ok(*step);
        }

        let info = self.exchange_info().await?;
        let mut cache = self.step_sizes.write().await;
        for s in &info.symbols {
            if let Some(step) = s.step_size() {
                cache.insert(s.symbol.clone(), step);
            }
        }

        cache
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("No LOT_SIZE filter for {}", symbol))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let _: Value = self
            .send_signed(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await
            .with_context(|| format!("Failed to set leverage {}x on {}", leverage, symbol))?;

        debug!(symbol = %symbol, leverage, "Leverage set");
        Ok(())
    }

    async fn balance(&self) -> Result<Decimal> {
        let entries: Vec<BalanceEntry> = self
            .get_signed("/fapi/v2/balance", vec![])
            .await
            .context("Failed to fetch balance")?;

        entries
            .into_iter()
            .find(|b| b.asset == self.quote_asset)
            .map(|b| b.available_balance)
            .ok_or_else(|| anyhow!("Asset {} not found in account", self.quote_asset))
    }

    async fn current_price(&self, symbol: &str) -> Result<Decimal> {
        let ticker: PriceTickerResponse = self
            .get_public("/fapi/v1/ticker/price", &format!("symbol={}", symbol))
            .await
            .with_context(|| format!("Failed to fetch price for {}", symbol))?;
        Ok(ticker.price)
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> Result<OrderFill> {
        let client_order_id = format!("fleet-{}", uuid::Uuid::new_v4().simple());

        info!(
            symbol = %symbol,
            side = %side,
            quantity = %quantity,
            "Sending market order"
        );

        let response: OrderResultResponse = self
            .send_signed(
                Method::POST,
                "/fapi/v1/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("side", side.as_str().to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", quantity.normalize().to_string()),
                    ("newClientOrderId", client_order_id),
                    ("newOrderRespType", "RESULT".to_string()),
                ],
            )
            .await
            .with_context(|| format!("Order rejected for {}", symbol))?;

        Ok(OrderFill {
            order_id: response.order_id.to_string(),
            executed_quantity: response.executed_qty,
            avg_price: response.avg_price,
        })
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let _: Value = self
            .send_signed(
                Method::DELETE,
                "/fapi/v1/allOpenOrders",
                vec![("symbol", symbol.to_string())],
            )
            .await
            .with_context(|| format!("Failed to cancel orders on {}", symbol))?;
        Ok(())
    }

    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>> {
        let params = match symbol {
            Some(s) => vec![("symbol", s.to_string())],
            None => vec![],
        };

        let entries: Vec<PositionRiskEntry> = self
            .get_signed("/fapi/v2/positionRisk", params)
            .await
            .context("Failed to fetch positions")?;

        Ok(entries.into_iter().map(ExchangePosition::from).collect())
    }

    async fn tradable_instruments(&self, limit: usize) -> Result<Vec<String>> {
        let info = self.exchange_info().await?;

        Ok(info
            .symbols
            .into_iter()
            .filter(|s| s.is_tradable_perpetual() && s.quote_asset == self.quote_asset)
            .map(|s| s.symbol)
            .take(limit)
            .collect())
    }

    async fn recent_candles(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let rows: Vec<Vec<Value>> = self
            .get_public(
                "/fapi/v1/klines",
                &format!("symbol={}&interval={}&limit={}", symbol, interval, limit),
            )
            .await
            .with_context(|| format!("Failed to fetch klines for {}", symbol))?;

        rows.iter().map(|row| parse_kline(row)).collect()
    }
}

/// Failure of a single HTTP attempt, classified for retrying.
#[derive(Debug)]
enum RequestError {
    Transport(anyhow::Error),
    Status(StatusCode, String),
    Decode(anyhow::Error),
}

impl RequestError {
    fn is_transient(&self) -> bool {
        match self {
            RequestError::Transport(_) => true,
            RequestError::Status(status, _) => {
                *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || status.is_server_error()
            }
            RequestError::Decode(_) => false,
        }
    }

    fn into_anyhow(self) -> anyhow::Error {
        match self {
            RequestError::Transport(e) | RequestError::Decode(e) => e,
            RequestError::Status(status, body) => {
                anyhow!("Binance API error: {} - {}", status, body)
            }
        }
    }
}

/// Retry `op` with exponential backoff while it fails transiently.
async fn retry_transient<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, RequestError>>,
{
    let policy = ExponentialBackoff {
        max_elapsed_time: Some(MAX_RETRY_ELAPSED),
        ..Default::default()
    };

    let op = &op;
    backoff::future::retry(policy, move || {
        let attempt = op();
        async move {
            attempt.await.map_err(|e| {
                if e.is_transient() {
                    warn!(error = ?e, "Transient Binance error, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
    .map_err(RequestError::into_anyhow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_query_appends_signature() {
        let client = BinanceClient::new(
            "key".to_string(),
            "secret".to_string(),
            "usdc".to_string(),
        )
        .unwrap();

        let query = client
            .signed_query(vec![("symbol", "BTCUSDC".to_string())])
            .unwrap();

        assert!(query.starts_with("symbol=BTCUSDC&recvWindow=5000&timestamp="));
        let signature = query.rsplit("signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert_eq!(client.quote_asset(), "USDC");
    }

    #[test]
    fn test_transient_classification() {
        assert!(RequestError::Status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(RequestError::Status(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(!RequestError::Status(StatusCode::BAD_REQUEST, String::new()).is_transient());
        assert!(!RequestError::Decode(anyhow!("bad json")).is_transient());
    }
}
