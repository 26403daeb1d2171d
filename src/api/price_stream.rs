//! Mark-price feed over the Binance futures WebSocket.
//!
//! One task per subscribed symbol, each owning its own connection to the
//! `<symbol>@markPrice@1s` stream and reconnecting with a doubling delay.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use super::exchange::{PriceStream, PriceTick};
use super::types::MarkPriceEvent;

pub const FUTURES_WS_URL: &str = "wss://fstream.binance.com/ws";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Streaming price source backed by per-symbol WebSocket tasks.
pub struct BinancePriceStream {
    base_url: String,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BinancePriceStream {
    pub fn new() -> Self {
        Self::with_base_url(FUTURES_WS_URL.to_string())
    }

    /// Create with custom stream URL (testnet).
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn stream_url(&self, symbol: &str) -> String {
        format!("{}/{}@markPrice@1s", self.base_url, symbol.to_lowercase())
    }
}

impl Default for BinancePriceStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BinancePriceStream {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.get_mut().drain() {
            handle.abort();
        }
    }
}

#[async_trait]
impl PriceStream for BinancePriceStream {
    async fn subscribe(&self, symbol: &str, sink: mpsc::Sender<PriceTick>) -> Result<()> {
        let url = self.stream_url(symbol);
        url::Url::parse(&url).with_context(|| format!("Invalid stream URL {}", url))?;

        let symbol_owned = symbol.to_string();
        let handle = tokio::spawn(async move { run_feed(symbol_owned, url, sink).await });

        if let Some(previous) = self.tasks.lock().await.insert(symbol.to_string(), handle) {
            previous.abort();
        }

        info!(symbol = %symbol, "Subscribed to mark price stream");
        Ok(())
    }

    async fn unsubscribe(&self, symbol: &str) {
        if let Some(handle) = self.tasks.lock().await.remove(symbol) {
            handle.abort();
            info!(symbol = %symbol, "Unsubscribed from mark price stream");
        }
    }
}

/// Reconnect loop for one symbol. Ends when the subscriber drops its receiver.
async fn run_feed(symbol: String, url: String, sink: mpsc::Sender<PriceTick>) {
    let mut delay = INITIAL_RECONNECT_DELAY;

    loop {
        match run_connection(&url, &sink).await {
            Ok(()) => {
                debug!(symbol = %symbol, "Price subscriber gone, stopping feed");
                return;
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, delay = ?delay, "Price stream dropped, reconnecting");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);
            }
        }

        if sink.is_closed() {
            return;
        }
    }
}

/// Forward ticks from one connection. `Ok` means the receiver closed.
async fn run_connection(url: &str, sink: &mpsc::Sender<PriceTick>) -> Result<()> {
    let (ws, _) = timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .context("Connection timeout")?
        .context("WebSocket connection failed")?;

    let (mut write, mut read) = ws.split();

    while let Some(msg) = read.next().await {
        match msg.context("WebSocket error")? {
            Message::Text(text) => {
                let event: MarkPriceEvent = match serde_json::from_str(&text) {
                    Ok(e) => e,
                    Err(e) => {
                        debug!(error = %e, "Skipping unparseable stream message");
                        continue;
                    }
                };

                let tick = PriceTick {
                    symbol: event.symbol,
                    price: event.mark_price,
                    timestamp: event.event_time,
                };

                // Full channel means the worker is behind; the next tick supersedes this one.
                if let Err(mpsc::error::TrySendError::Closed(_)) = sink.try_send(tick) {
                    return Ok(());
                }
            }
            Message::Ping(payload) => {
                write.send(Message::Pong(payload)).await.context("Failed to send pong")?;
            }
            Message::Close(frame) => {
                anyhow::bail!("Server closed stream: {:?}", frame);
            }
            _ => {}
        }
    }

    anyhow::bail!("Stream ended unexpectedly")
}
