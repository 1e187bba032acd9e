use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::http::HttpClient;
use super::{FeedEvent, FeedSubscription, PriceSource};
use crate::config::FeedSettings;
use crate::error::FeedError;
use crate::models::{Candle, Timeframe};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MAX_KLINE_LIMIT: usize = 1000;

/// Binance spot klines over REST (history) and WebSocket (live)
#[derive(Clone)]
pub struct BinanceClient {
    http: HttpClient,
    rest_url: String,
    ws_url: String,
    read_timeout: Duration,
}

/// `k` object of a kline stream message
#[derive(Debug, Deserialize)]
struct WsKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "x")]
    is_final: bool,
}

#[derive(Debug, Deserialize)]
struct WsKlineMessage {
    #[serde(rename = "k")]
    kline: WsKline,
}

impl BinanceClient {
    pub fn new(settings: &FeedSettings) -> Result<Self, FeedError> {
        let read_timeout = Duration::from_secs(settings.read_timeout_secs.max(1));
        Ok(Self {
            http: HttpClient::new("Binance", read_timeout, settings.requests_per_minute)?,
            rest_url: settings.rest_url.trim_end_matches('/').to_string(),
            ws_url: settings.ws_url.trim_end_matches('/').to_string(),
            read_timeout,
        })
    }

    fn stream_url(&self, symbol: &str, timeframe: Timeframe) -> String {
        format!(
            "{}/{}@kline_{}",
            self.ws_url,
            symbol.to_lowercase(),
            timeframe.as_str()
        )
    }
}

#[async_trait]
impl PriceSource for BinanceClient {
    async fn fetch_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.rest_url,
            symbol.to_uppercase(),
            timeframe.as_str(),
            limit.clamp(1, MAX_KLINE_LIMIT)
        );

        let rows: Vec<Vec<Value>> = self.http.get(&url).await?.json().await?;
        let candles = parse_klines(&rows)?;

        tracing::info!(
            "Fetched {} {} candles for {}",
            candles.len(),
            timeframe,
            symbol
        );
        Ok(candles)
    }

    async fn subscribe(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        events: mpsc::Sender<FeedEvent>,
    ) -> Result<FeedSubscription, FeedError> {
        let url = self.stream_url(symbol, timeframe);
        let read_timeout = self.read_timeout;
        let task_symbol = symbol.to_string();

        let handle = tokio::spawn(async move {
            stream_klines(url, task_symbol, timeframe, read_timeout, events).await;
        });

        Ok(FeedSubscription::new(symbol, timeframe, handle))
    }
}

/// Reconnecting read loop; returns once the event receiver is gone
async fn stream_klines(
    url: String,
    symbol: String,
    timeframe: Timeframe,
    read_timeout: Duration,
    events: mpsc::Sender<FeedEvent>,
) {
    let mut reconnect_attempts = 0u32;

    loop {
        match read_stream(&url, &symbol, timeframe, read_timeout, &events).await {
            Ok(()) => {
                tracing::info!("Kline stream for {} ended", symbol);
                reconnect_attempts = 0;
            }
            Err(e) => {
                reconnect_attempts += 1;
                tracing::warn!(
                    "Kline stream for {} failed (attempt {}): {}",
                    symbol,
                    reconnect_attempts,
                    e
                );
            }
        }

        let status = FeedEvent::status(&symbol, timeframe, false, "disconnected");
        if events.send(status).await.is_err() {
            return;
        }

        tracing::warn!("Reconnecting to {} in {:?}...", url, RECONNECT_DELAY);
        tokio::time::sleep(RECONNECT_DELAY).await;
        if events.is_closed() {
            return;
        }
    }
}

async fn read_stream(
    url: &str,
    symbol: &str,
    timeframe: Timeframe,
    read_timeout: Duration,
    events: &mpsc::Sender<FeedEvent>,
) -> Result<(), FeedError> {
    let (ws_stream, _) = timeout(read_timeout, connect_async(url))
        .await
        .map_err(|_| FeedError::Timeout(read_timeout))?
        .map_err(|e| FeedError::Unavailable(format!("Failed to connect: {}", e)))?;

    tracing::info!("Connected to {}", url);
    let (mut write, mut read) = ws_stream.split();

    let connected = FeedEvent::status(symbol, timeframe, true, "connected");
    if events.send(connected).await.is_err() {
        return Ok(());
    }

    loop {
        let msg = timeout(read_timeout, read.next())
            .await
            .map_err(|_| FeedError::Timeout(read_timeout))?;

        match msg {
            Some(Ok(Message::Text(text))) => match parse_kline_message(&text) {
                Ok((candle, is_final)) => {
                    let event = FeedEvent::candle(symbol, timeframe, candle, is_final);
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => tracing::debug!("Skipping message: {}", e),
            },
            Some(Ok(Message::Ping(ping))) => {
                write
                    .send(Message::Pong(ping))
                    .await
                    .map_err(|e| FeedError::Protocol(e.to_string()))?;
            }
            Some(Ok(Message::Close(_))) => {
                tracing::info!("Kline stream closed by server");
                return Ok(());
            }
            Some(Err(e)) => return Err(FeedError::Protocol(e.to_string())),
            None => return Ok(()),
            _ => continue,
        }
    }
}

/// Decode a kline stream message into the candle and its closed flag
pub fn parse_kline_message(text: &str) -> Result<(Candle, bool), FeedError> {
    let msg: WsKlineMessage = serde_json::from_str(text)
        .map_err(|e| FeedError::Protocol(format!("not a kline message: {}", e)))?;
    let k = msg.kline;

    let candle = Candle {
        time: k.open_time / 1000,
        open: parse_price(&k.open)?,
        high: parse_price(&k.high)?,
        low: parse_price(&k.low)?,
        close: parse_price(&k.close)?,
    };
    check_candle(candle)?;
    Ok((candle, k.is_final))
}

/// Decode REST kline rows `[openTime, "o", "h", "l", "c", ...]`
pub fn parse_klines(rows: &[Vec<Value>]) -> Result<Vec<Candle>, FeedError> {
    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() < 5 {
            return Err(FeedError::Protocol(format!(
                "kline row has {} fields",
                row.len()
            )));
        }
        let open_time = row[0]
            .as_i64()
            .ok_or_else(|| FeedError::Protocol("kline open time is not an integer".to_string()))?;

        let candle = Candle {
            time: open_time / 1000,
            open: value_price(&row[1])?,
            high: value_price(&row[2])?,
            low: value_price(&row[3])?,
            close: value_price(&row[4])?,
        };
        check_candle(candle)?;
        candles.push(candle);
    }
    candles.sort_by_key(|c| c.time);
    Ok(candles)
}

fn value_price(value: &Value) -> Result<f64, FeedError> {
    match value {
        Value::String(s) => parse_price(s),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| FeedError::Protocol(format!("bad price {}", n))),
        other => Err(FeedError::Protocol(format!("bad price {}", other))),
    }
}

fn parse_price(raw: &str) -> Result<f64, FeedError> {
    raw.parse::<f64>()
        .map_err(|_| FeedError::Protocol(format!("bad price '{}'", raw)))
}

fn check_candle(candle: Candle) -> Result<(), FeedError> {
    if candle.is_consistent() {
        Ok(())
    } else {
        Err(FeedError::Protocol(format!(
            "inconsistent candle at {}",
            candle.time
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn settings(rest_url: &str) -> FeedSettings {
        FeedSettings {
            rest_url: rest_url.to_string(),
            read_timeout_secs: 5,
            ..FeedSettings::default()
        }
    }

    #[test]
    fn test_parse_kline_message() {
        let text = r#"{
            "e": "kline", "E": 1700000001000, "s": "BTCUSDT",
            "k": {
                "t": 1700000040000, "T": 1700000099999, "s": "BTCUSDT", "i": "1m",
                "o": "37000.10", "c": "37010.00", "h": "37020.50", "l": "36990.00",
                "v": "12.5", "n": 100, "x": false
            }
        }"#;

        let (candle, is_final) = parse_kline_message(text).unwrap();
        assert!(!is_final);
        assert_eq!(candle.time, 1_700_000_040);
        assert_eq!(candle.open, 37000.10);
        assert_eq!(candle.high, 37020.50);
        assert_eq!(candle.low, 36990.00);
        assert_eq!(candle.close, 37010.00);
    }

    #[test]
    fn test_parse_kline_message_rejects_garbage() {
        assert!(matches!(
            parse_kline_message(r#"{"result": null, "id": 1}"#),
            Err(FeedError::Protocol(_))
        ));

        // high below open
        let bad = r#"{"k": {"t": 0, "o": "10", "h": "9", "l": "8", "c": "9", "x": true}}"#;
        assert!(parse_kline_message(bad).is_err());
    }

    #[test]
    fn test_stream_url() {
        let client = BinanceClient::new(&FeedSettings::default()).unwrap();
        assert_eq!(
            client.stream_url("BTCUSDT", Timeframe::M15),
            "wss://stream.binance.com:9443/ws/btcusdt@kline_15m"
        );
    }

    #[tokio::test]
    async fn test_fetch_historical_candles() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                Matcher::UrlEncoded("interval".into(), "1h".into()),
                Matcher::UrlEncoded("limit".into(), "2".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[
                    [1700003600000, "101.0", "103.0", "100.5", "102.0", "5.0", 1700007199999],
                    [1700000000000, "100.0", "101.5", "99.0", "101.0", "4.0", 1700003599999]
                ]"#,
            )
            .create_async()
            .await;

        let client = BinanceClient::new(&settings(&server.url())).unwrap();
        let candles = client
            .fetch_historical_candles("btcusdt", Timeframe::H1, 2)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(candles.len(), 2);
        // Sorted oldest first
        assert_eq!(candles[0].time, 1_700_000_000);
        assert_eq!(candles[0].close, 101.0);
        assert_eq!(candles[1].time, 1_700_003_600);
        assert_eq!(candles[1].high, 103.0);
    }

    #[tokio::test]
    async fn test_fetch_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-1121,"msg":"Invalid symbol."}"#)
            .expect(1)
            .create_async()
            .await;

        let client = BinanceClient::new(&settings(&server.url())).unwrap();
        let result = client
            .fetch_historical_candles("NOPE", Timeframe::M1, 10)
            .await;

        mock.assert_async().await;
        match result {
            Err(FeedError::Http { status, message }) => {
                assert_eq!(status, 400);
                assert!(message.contains("Invalid symbol"));
            }
            other => panic!("expected HTTP error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_malformed_rows() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"[[1700000000000, "abc", "1", "1", "1"]]"#)
            .create_async()
            .await;

        let client = BinanceClient::new(&settings(&server.url())).unwrap();
        assert!(matches!(
            client.fetch_historical_candles("BTCUSDT", Timeframe::M1, 1).await,
            Err(FeedError::Protocol(_))
        ));
    }
}
