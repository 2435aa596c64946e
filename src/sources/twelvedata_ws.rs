//! TwelveData WebSocket client feeding the quote cache.
//!
//! One connection carries every subscribed symbol. On reconnect the full set
//! remembered by the cache is subscribed again.

use crate::services::QuoteCache;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

pub const TWELVE_DATA_WS_URL: &str = "wss://ws.twelvedata.com/v1/quotes/price";

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Outgoing control message.
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ControlMessage {
    Subscribe { params: SubscribeParams },
    Heartbeat,
}

#[derive(Debug, Serialize)]
struct SubscribeParams {
    symbols: String,
}

/// Incoming event. Only `price` events carry data we use.
#[derive(Debug, Deserialize)]
struct PriceEvent {
    event: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    price: Option<Value>,
    /// Unix seconds
    #[serde(default)]
    timestamp: Option<i64>,
}

fn subscribe_json(symbol: &str) -> Option<String> {
    serde_json::to_string(&ControlMessage::Subscribe {
        params: SubscribeParams {
            symbols: symbol.to_string(),
        },
    })
    .ok()
}

/// Parse a price event into `(symbol, price, timestamp_ms)`.
fn parse_price_event(text: &str) -> Option<(String, Decimal, i64)> {
    let event: PriceEvent = serde_json::from_str(text).ok()?;
    if event.event != "price" {
        return None;
    }
    let price = match event.price? {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok()?,
        Value::String(s) => Decimal::from_str(&s).ok()?,
        _ => return None,
    };
    let timestamp = event
        .timestamp
        .map(|s| s * 1000)
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    Some((event.symbol?, price, timestamp))
}

/// TwelveData streaming client.
pub struct TwelveDataWs {
    api_key: String,
    url: String,
    cache: Arc<QuoteCache>,
}

impl TwelveDataWs {
    pub fn new(api_key: String, url: String, cache: Arc<QuoteCache>) -> Self {
        Self { api_key, url, cache }
    }

    /// Stream forever, reconnecting after every disconnect.
    pub async fn run(&self, mut subscriptions: mpsc::UnboundedReceiver<String>) -> anyhow::Result<()> {
        loop {
            match self.run_connection(&mut subscriptions).await {
                Ok(_) => warn!("TwelveData WebSocket disconnected, reconnecting..."),
                Err(e) => error!("TwelveData WebSocket error: {}, reconnecting...", e),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn run_connection(&self, subscriptions: &mut mpsc::UnboundedReceiver<String>) -> anyhow::Result<()> {
        let url = format!("{}?apikey={}", self.url, self.api_key);
        info!("Connecting to TwelveData WebSocket");

        let (ws_stream, _) = connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();
        info!("Connected to TwelveData WebSocket");

        let symbols = self.cache.subscribed_symbols();
        for symbol in &symbols {
            if let Some(json) = subscribe_json(symbol) {
                write.send(Message::Text(json)).await?;
            }
        }
        if !symbols.is_empty() {
            info!("Resubscribed to {} symbols", symbols.len());
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_message(&text),
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("TwelveData WebSocket closed");
                            break;
                        }
                        Some(Err(e)) => {
                            error!("TwelveData WebSocket read error: {}", e);
                            break;
                        }
                        None => break,
                        _ => {}
                    }
                }
                Some(symbol) = subscriptions.recv() => {
                    if let Some(json) = subscribe_json(&symbol) {
                        write.send(Message::Text(json)).await?;
                        debug!("Subscribed to {}", symbol);
                    }
                }
                _ = heartbeat.tick() => {
                    if let Ok(json) = serde_json::to_string(&ControlMessage::Heartbeat) {
                        write.send(Message::Text(json)).await?;
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_message(&self, text: &str) {
        if let Some((symbol, price, timestamp)) = parse_price_event(text) {
            debug!("TwelveData price: {} = {}", symbol, price);
            self.cache.update(&symbol, price, timestamp);
        }
    }
}
