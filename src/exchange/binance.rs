// =============================================================================
// Binance Adapter — HMAC-SHA256 signed REST + market/user WebSocket streams
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift; a request rejected for clock skew triggers one server
// time resync and a single retry.
//
// Spot and futures share this implementation; the market type selects the
// endpoint family (api.binance.com vs fapi.binance.com) and the user-data
// event shape.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::json;
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::exchange::ratelimit::RateLimitBudget;
use crate::exchange::stream::Backoff;
use crate::exchange::{
    map_order_status, ExchangeAdapter, ExchangeError, ExchangePosition, ExchangeResult,
    ExecutionReport, OrderRequest, OrderResult, StreamHandle,
};
use crate::types::{
    Balance, Candle, MarketType, OrderSide, OrderType, Orderbook, PositionSide, Ticker,
};

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Per-minute request-weight ceiling we cap ourselves at.
const WEIGHT_LIMIT_1M: u32 = 1000;
/// Maximum orders per 10-second window.
const ORDER_LIMIT_10S: u32 = 10;
/// Maximum orders per day.
const ORDER_LIMIT_1D: u32 = 200_000;
/// Binance error code for a timestamp outside the recv window.
const CODE_CLOCK_SKEW: i64 = -1021;

// Endpoint families.
const SPOT_REST: &str = "https://api.binance.com";
const SPOT_WS: &str = "wss://stream.binance.com:9443";
const FUTURES_REST: &str = "https://fapi.binance.com";
const FUTURES_WS: &str = "wss://fstream.binance.com";
const TESTNET_SPOT_REST: &str = "https://testnet.binance.vision";
const TESTNET_FUTURES_REST: &str = "https://testnet.binancefuture.com";

/// Binance exchange adapter (one instance per credential + market type).
pub struct BinanceAdapter {
    api_key: String,
    secret: String,
    market_type: MarketType,
    base_url: String,
    ws_url: String,
    client: reqwest::Client,
    budget: RateLimitBudget,
    /// Server-minus-local clock offset in milliseconds.
    time_offset_ms: AtomicI64,
    connected: AtomicBool,
    max_retries: u32,
}

impl BinanceAdapter {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        market_type: MarketType,
        testnet: bool,
        request_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(request_timeout)
            .build()
            .expect("failed to build reqwest client");

        let (base_url, ws_url) = match (market_type, testnet) {
            (MarketType::Spot, false) => (SPOT_REST, SPOT_WS),
            (MarketType::Spot, true) => (TESTNET_SPOT_REST, SPOT_WS),
            (MarketType::Futures, false) => (FUTURES_REST, FUTURES_WS),
            (MarketType::Futures, true) => (TESTNET_FUTURES_REST, FUTURES_WS),
        };

        debug!(market_type = %market_type, base_url, "BinanceAdapter initialised");

        Self {
            api_key,
            secret: secret.into(),
            market_type,
            base_url: base_url.to_string(),
            ws_url: ws_url.to_string(),
            client,
            budget: RateLimitBudget::new(WEIGHT_LIMIT_1M, ORDER_LIMIT_10S, ORDER_LIMIT_1D),
            time_offset_ms: AtomicI64::new(0),
            connected: AtomicBool::new(false),
            max_retries,
        }
    }

    /// Rate-limit budget snapshot, exposed for the engine dashboard.
    pub fn budget(&self) -> &RateLimitBudget {
        &self.budget
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn local_timestamp_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Timestamp adjusted by the last known server offset.
    fn timestamp_ms(&self) -> i64 {
        Self::local_timestamp_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// Full query string for a signed request (timestamp, recvWindow,
    /// signature appended).
    fn signed_query(&self, params: &str) -> String {
        let ts = self.timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Fetch server time and store the offset against the local clock.
    async fn resync_time(&self) -> ExchangeResult<()> {
        let endpoint = match self.market_type {
            MarketType::Spot => "/api/v3/time",
            MarketType::Futures => "/fapi/v1/time",
        };
        let url = format!("{}{}", self.base_url, endpoint);
        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?
            .json()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?;

        let server_time = body["serverTime"].as_i64().unwrap_or(0);
        let offset = server_time - Self::local_timestamp_ms();
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        info!(offset_ms = offset, "server time resynced");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Execute a REST request with budget pre-flight, connection retries, and
    /// one clock-skew resync retry.
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &str,
        signed: bool,
        weight: u32,
    ) -> ExchangeResult<serde_json::Value> {
        if let Err(retry_after_ms) = self.budget.try_acquire(weight) {
            return Err(ExchangeError::RateLimited { retry_after_ms });
        }

        let mut backoff = Backoff::for_request();
        let mut skew_retried = false;
        let mut attempt = 0u32;

        loop {
            let query = if signed {
                self.signed_query(params)
            } else {
                params.to_string()
            };
            let url = if query.is_empty() {
                format!("{}{}", self.base_url, endpoint)
            } else {
                format!("{}{}?{}", self.base_url, endpoint, query)
            };

            let result = self.client.request(method.clone(), &url).send().await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    // Timeouts and transport failures surface as connection
                    // errors and are retried with jittered backoff.
                    if attempt < self.max_retries {
                        attempt += 1;
                        let delay = backoff.next_delay();
                        warn!(
                            endpoint,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "request failed — retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(ExchangeError::Connection(e.to_string()));
                }
            };

            let status = resp.status();
            let retry_after_ms = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            if let Some(weight_hdr) = resp
                .headers()
                .get("X-MBX-USED-WEIGHT-1M")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u32>().ok())
            {
                self.budget.record_used_weight(weight_hdr);
            }
            let header_count = |name: &str| {
                resp.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u32>().ok())
            };
            let order_count_10s = header_count("X-MBX-ORDER-COUNT-10S");
            let order_count_1d = header_count("X-MBX-ORDER-COUNT-1D");
            if order_count_10s.is_some() || order_count_1d.is_some() {
                self.budget
                    .record_order_counts(order_count_10s, order_count_1d);
            }

            let body: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| ExchangeError::Connection(e.to_string()))?;

            if status.is_success() {
                return Ok(body);
            }

            let code = body["code"].as_i64().unwrap_or(0);
            let msg = body["msg"].as_str().unwrap_or("").to_string();

            // Clock skew: resync once and replay the request.
            if code == CODE_CLOCK_SKEW && signed && !skew_retried {
                skew_retried = true;
                warn!(endpoint, "clock skew rejection — resyncing server time");
                self.resync_time().await?;
                continue;
            }

            return Err(Self::map_error(status.as_u16(), code, msg, retry_after_ms));
        }
    }

    /// Map an HTTP status + Binance error code into the fixed taxonomy.
    fn map_error(
        status: u16,
        code: i64,
        msg: String,
        retry_after_ms: Option<u64>,
    ) -> ExchangeError {
        match (status, code) {
            (429, _) | (418, _) => ExchangeError::RateLimited {
                retry_after_ms: retry_after_ms.unwrap_or(60_000),
            },
            (_, -1003) => ExchangeError::RateLimited {
                retry_after_ms: retry_after_ms.unwrap_or(60_000),
            },
            (401, _) | (_, -2014) | (_, -2015) | (_, -1022) => ExchangeError::Auth(msg),
            (_, -2010) | (_, -2011) | (_, -2013) | (_, -2018) | (_, -2019) => {
                ExchangeError::OrderRejected {
                    reason: msg,
                    order_id: None,
                }
            }
            (_, -1013) | (_, -1100..=-1000) => ExchangeError::InvalidParameter(msg),
            _ => ExchangeError::Unknown(format!("HTTP {status} code {code}: {msg}")),
        }
    }

    // -------------------------------------------------------------------------
    // Endpoint helpers
    // -------------------------------------------------------------------------

    fn order_endpoint(&self) -> &'static str {
        match self.market_type {
            MarketType::Spot => "/api/v3/order",
            MarketType::Futures => "/fapi/v1/order",
        }
    }

    fn order_type_param(order_type: OrderType) -> &'static str {
        match order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::StopLimit => "STOP",
            OrderType::TrailingStop => "TRAILING_STOP_MARKET",
        }
    }

    fn parse_f64(value: &serde_json::Value) -> f64 {
        if let Some(s) = value.as_str() {
            s.parse().unwrap_or(0.0)
        } else {
            value.as_f64().unwrap_or(0.0)
        }
    }

    fn parse_side(raw: &str) -> OrderSide {
        if raw.eq_ignore_ascii_case("sell") {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }

    fn parse_order_result(&self, symbol: &str, data: &serde_json::Value) -> OrderResult {
        let filled = Self::parse_f64(&data["executedQty"]);
        let avg = {
            let direct = Self::parse_f64(&data["avgPrice"]);
            if direct > 0.0 {
                Some(direct)
            } else {
                // Spot reports cumulative quote volume instead of an average.
                let quote = Self::parse_f64(&data["cummulativeQuoteQty"]);
                if quote > 0.0 && filled > 0.0 {
                    Some(quote / filled)
                } else {
                    None
                }
            }
        };

        let price = Self::parse_f64(&data["price"]);

        OrderResult {
            exchange_order_id: data["orderId"]
                .as_u64()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            client_order_id: data["clientOrderId"].as_str().unwrap_or("").to_string(),
            symbol: symbol.to_string(),
            side: Self::parse_side(data["side"].as_str().unwrap_or("BUY")),
            status: map_order_status(data["status"].as_str().unwrap_or("")),
            price: if price > 0.0 { Some(price) } else { None },
            quantity: Self::parse_f64(&data["origQty"]),
            filled_quantity: filled,
            average_price: avg,
            fee: 0.0,
            fee_asset: String::new(),
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// ExchangeAdapter implementation
// =============================================================================

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn market_type(&self) -> MarketType {
        self.market_type
    }

    async fn connect(&self) -> ExchangeResult<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.resync_time().await?;
        info!(market_type = %self.market_type, "binance adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        info!("binance adapter disconnected");
        Ok(())
    }

    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        let endpoint = match self.market_type {
            MarketType::Spot => "/api/v3/ticker/24hr",
            MarketType::Futures => "/fapi/v1/ticker/24hr",
        };
        let data = self
            .request(Method::GET, endpoint, &format!("symbol={symbol}"), false, 2)
            .await?;

        let price = Self::parse_f64(&data["lastPrice"]);
        let bid = Self::parse_f64(&data["bidPrice"]);
        let ask = Self::parse_f64(&data["askPrice"]);
        Ok(Ticker {
            symbol: symbol.to_string(),
            price,
            bid: if bid > 0.0 { bid } else { price },
            ask: if ask > 0.0 { ask } else { price },
            volume_24h: Self::parse_f64(&data["volume"]),
            change_24h: Self::parse_f64(&data["priceChangePercent"]),
            timestamp: Utc::now(),
        })
    }

    async fn get_orderbook(&self, symbol: &str, depth: u32) -> ExchangeResult<Orderbook> {
        let endpoint = match self.market_type {
            MarketType::Spot => "/api/v3/depth",
            MarketType::Futures => "/fapi/v1/depth",
        };
        let data = self
            .request(
                Method::GET,
                endpoint,
                &format!("symbol={symbol}&limit={depth}"),
                false,
                5,
            )
            .await?;

        let parse_side = |key: &str| -> Vec<[f64; 2]> {
            data[key]
                .as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|level| {
                            let arr = level.as_array()?;
                            Some([Self::parse_f64(arr.first()?), Self::parse_f64(arr.get(1)?)])
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(Orderbook {
            symbol: symbol.to_string(),
            bids: parse_side("bids"),
            asks: parse_side("asks"),
        })
    }

    async fn get_balances(&self) -> ExchangeResult<Vec<Balance>> {
        let (endpoint, list_key) = match self.market_type {
            MarketType::Spot => ("/api/v3/account", "balances"),
            MarketType::Futures => ("/fapi/v2/account", "assets"),
        };
        let data = self.request(Method::GET, endpoint, "", true, 10).await?;

        let mut balances = Vec::new();
        for entry in data[list_key].as_array().unwrap_or(&Vec::new()) {
            let asset = entry["asset"].as_str().unwrap_or("").to_string();
            let free = if self.market_type == MarketType::Futures {
                Self::parse_f64(&entry["availableBalance"])
            } else {
                Self::parse_f64(&entry["free"])
            };
            let total = if self.market_type == MarketType::Futures {
                Self::parse_f64(&entry["walletBalance"])
            } else {
                free + Self::parse_f64(&entry["locked"])
            };
            if total > 0.0 {
                balances.push(Balance {
                    asset,
                    free,
                    locked: total - free,
                    total,
                });
            }
        }
        debug!(count = balances.len(), "balances retrieved");
        Ok(balances)
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        if self.market_type != MarketType::Futures {
            return Ok(Vec::new());
        }
        let data = self
            .request(Method::GET, "/fapi/v2/positionRisk", "", true, 5)
            .await?;

        let mut positions = Vec::new();
        for pos in data.as_array().unwrap_or(&Vec::new()) {
            let qty = Self::parse_f64(&pos["positionAmt"]);
            if qty == 0.0 {
                continue;
            }
            let liq = Self::parse_f64(&pos["liquidationPrice"]);
            positions.push(ExchangePosition {
                symbol: pos["symbol"].as_str().unwrap_or("").to_string(),
                side: if qty > 0.0 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                quantity: qty.abs(),
                entry_price: Self::parse_f64(&pos["entryPrice"]),
                mark_price: Self::parse_f64(&pos["markPrice"]),
                liquidation_price: if liq > 0.0 { Some(liq) } else { None },
                unrealized_pnl: Self::parse_f64(&pos["unRealizedProfit"]),
                leverage: Self::parse_f64(&pos["leverage"]) as u32,
                margin_type: pos["marginType"].as_str().unwrap_or("cross").to_string(),
            });
        }
        Ok(positions)
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderResult> {
        // Order-rate quota is distinct from request weight; refuse before
        // touching the wire.
        if let Err(retry_after_ms) = self.budget.try_place_order() {
            return Err(ExchangeError::RateLimited { retry_after_ms });
        }

        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            request.symbol,
            request.side.to_string().to_uppercase(),
            Self::order_type_param(request.order_type),
            request.quantity,
        );

        if let Some(price) = request.price {
            if matches!(request.order_type, OrderType::Limit | OrderType::StopLimit) {
                params.push_str(&format!(
                    "&price={price}&timeInForce={}",
                    request.time_in_force
                ));
            }
        }
        if let Some(stop) = request.stop_price {
            params.push_str(&format!("&stopPrice={stop}"));
        }
        if request.reduce_only && self.market_type == MarketType::Futures {
            params.push_str("&reduceOnly=true");
        }
        if let Some(coid) = &request.client_order_id {
            params.push_str(&format!("&newClientOrderId={coid}"));
        }

        debug!(
            symbol = %request.symbol,
            side = %request.side,
            order_type = %request.order_type,
            quantity = request.quantity,
            "placing order"
        );

        // Counted locally up front; response headers overwrite with the
        // exchange's authoritative counts.
        self.budget.record_order_sent();
        let data = self
            .request(Method::POST, self.order_endpoint(), &params, true, 1)
            .await
            .map_err(|e| match e {
                // Attach the client id the caller assigned before submission.
                ExchangeError::OrderRejected { reason, .. } => ExchangeError::OrderRejected {
                    reason,
                    order_id: request.client_order_id.clone(),
                },
                other => other,
            })?;

        Ok(self.parse_order_result(&request.symbol, &data))
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<bool> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        self.request(Method::DELETE, self.order_endpoint(), &params, true, 1)
            .await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(true)
    }

    async fn get_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderResult> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let data = self
            .request(Method::GET, self.order_endpoint(), &params, true, 2)
            .await?;
        Ok(self.parse_order_result(symbol, &data))
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderResult>> {
        let endpoint = match self.market_type {
            MarketType::Spot => "/api/v3/openOrders",
            MarketType::Futures => "/fapi/v1/openOrders",
        };
        let params = symbol.map(|s| format!("symbol={s}")).unwrap_or_default();
        let data = self.request(Method::GET, endpoint, &params, true, 3).await?;

        Ok(data
            .as_array()
            .unwrap_or(&Vec::new())
            .iter()
            .map(|o| self.parse_order_result(o["symbol"].as_str().unwrap_or(""), o))
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        if self.market_type != MarketType::Futures {
            return Ok(());
        }
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.request(Method::POST, "/fapi/v1/leverage", &params, true, 1)
            .await?;
        info!(symbol, leverage, "leverage set");
        Ok(())
    }

    async fn tick_size(&self, symbol: &str) -> ExchangeResult<f64> {
        let endpoint = match self.market_type {
            MarketType::Spot => "/api/v3/exchangeInfo",
            MarketType::Futures => "/fapi/v1/exchangeInfo",
        };
        let data = self
            .request(Method::GET, endpoint, &format!("symbol={symbol}"), false, 10)
            .await?;

        let tick = data["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|info| info["filters"].as_array().cloned())
            .and_then(|filters| {
                filters
                    .iter()
                    .find(|f| f["filterType"].as_str() == Some("PRICE_FILTER"))
                    .map(|f| Self::parse_f64(&f["tickSize"]))
            })
            .unwrap_or(0.0);

        if tick > 0.0 {
            Ok(tick)
        } else {
            Err(ExchangeError::InvalidParameter(format!(
                "no price filter for symbol {symbol}"
            )))
        }
    }

    fn spawn_market_streams(self: Arc<Self>, symbol: &str, bus: Arc<EventBus>) -> StreamHandle {
        let adapter = self.clone();
        let symbol = symbol.to_string();
        let task = tokio::spawn(async move {
            adapter.run_market_stream(symbol, bus).await;
        });
        StreamHandle::new(vec![task])
    }

    fn spawn_user_stream(
        self: Arc<Self>,
        tx: mpsc::UnboundedSender<ExecutionReport>,
    ) -> StreamHandle {
        let adapter = self.clone();
        let task = tokio::spawn(async move {
            adapter.run_user_stream(tx).await;
        });
        StreamHandle::new(vec![task])
    }
}

// =============================================================================
// Streaming internals
// =============================================================================

impl BinanceAdapter {
    fn lower(symbol: &str) -> String {
        symbol.to_lowercase()
    }

    /// Market-data loop: combined ticker/trade/depth/kline stream with
    /// reconnect backoff. After every reconnect a `market.reset` event tells
    /// strategies to reinitialize; tick-stream gaps are never reconstructed.
    async fn run_market_stream(&self, symbol: String, bus: Arc<EventBus>) {
        let lower = Self::lower(&symbol);
        let streams = format!(
            "{lower}@ticker/{lower}@aggTrade/{lower}@depth20@100ms/{lower}@kline_1m"
        );
        let url = format!("{}/stream?streams={}", self.ws_url, streams);

        let mut backoff = Backoff::for_stream();
        let mut had_session = false;

        loop {
            match connect_async(&url).await {
                Ok((ws, _resp)) => {
                    info!(symbol = %symbol, "market stream connected");
                    backoff.reset();
                    if had_session {
                        bus.emit(
                            "market.reset",
                            json!({ "symbol": symbol, "exchange": self.name() }),
                            None,
                        );
                    }
                    had_session = true;

                    let (_write, mut read) = ws.split();
                    while let Some(message) = read.next().await {
                        match message {
                            Ok(Message::Text(text)) => {
                                self.handle_market_message(&symbol, &text, &bus);
                            }
                            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                            Ok(Message::Close(_)) | Ok(_) => {}
                            Err(e) => {
                                error!(symbol = %symbol, error = %e, "market stream read error");
                                break;
                            }
                        }
                    }
                    warn!(symbol = %symbol, "market stream ended — reconnecting");
                }
                Err(e) => {
                    error!(symbol = %symbol, error = %e, "market stream connect failed");
                }
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    fn handle_market_message(&self, symbol: &str, text: &str, bus: &EventBus) {
        let root: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to parse market message");
                return;
            }
        };

        let stream = root["stream"].as_str().unwrap_or("");
        let data = &root["data"];

        if stream.ends_with("@ticker") {
            let price = Self::parse_f64(&data["c"]);
            let bid = Self::parse_f64(&data["b"]);
            let ask = Self::parse_f64(&data["a"]);
            bus.emit(
                "market.tick",
                json!({
                    "symbol": symbol,
                    "exchange": self.name(),
                    "price": price,
                    "bid": if bid > 0.0 { bid } else { price },
                    "ask": if ask > 0.0 { ask } else { price },
                    "volume_24h": Self::parse_f64(&data["v"]),
                    "change_24h": Self::parse_f64(&data["P"]),
                    "timestamp": Utc::now(),
                }),
                None,
            );
        } else if stream.ends_with("@aggTrade") {
            bus.emit(
                "market.trade",
                json!({
                    "symbol": symbol,
                    "exchange": self.name(),
                    "price": Self::parse_f64(&data["p"]),
                    "quantity": Self::parse_f64(&data["q"]),
                    "is_buyer_maker": data["m"].as_bool().unwrap_or(false),
                    "timestamp": Utc::now(),
                }),
                None,
            );
        } else if stream.contains("@depth") {
            let parse_levels = |value: &serde_json::Value| -> Vec<[f64; 2]> {
                value
                    .as_array()
                    .map(|levels| {
                        levels
                            .iter()
                            .filter_map(|level| {
                                let arr = level.as_array()?;
                                Some([
                                    Self::parse_f64(arr.first()?),
                                    Self::parse_f64(arr.get(1)?),
                                ])
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            };
            // Spot uses bids/asks, futures depth uses b/a.
            let bids = if data["bids"].is_array() {
                parse_levels(&data["bids"])
            } else {
                parse_levels(&data["b"])
            };
            let asks = if data["asks"].is_array() {
                parse_levels(&data["asks"])
            } else {
                parse_levels(&data["a"])
            };
            bus.emit(
                "market.orderbook",
                json!({
                    "symbol": symbol,
                    "exchange": self.name(),
                    "bids": bids,
                    "asks": asks,
                }),
                None,
            );
        } else if stream.contains("@kline") {
            let k = &data["k"];
            // Only closed candles reach strategies.
            if k["x"].as_bool() != Some(true) {
                return;
            }
            let candle = Candle {
                open_time: k["t"].as_i64().unwrap_or(0),
                open: Self::parse_f64(&k["o"]),
                high: Self::parse_f64(&k["h"]),
                low: Self::parse_f64(&k["l"]),
                close: Self::parse_f64(&k["c"]),
                volume: Self::parse_f64(&k["v"]),
                close_time: k["T"].as_i64().unwrap_or(0),
                is_closed: true,
            };
            bus.emit(
                "market.kline",
                json!({
                    "symbol": symbol,
                    "exchange": self.name(),
                    "candle": candle,
                }),
                None,
            );
        }
    }

    // -------------------------------------------------------------------------
    // User-data stream
    // -------------------------------------------------------------------------

    async fn create_listen_key(&self) -> ExchangeResult<String> {
        let endpoint = match self.market_type {
            MarketType::Spot => "/api/v3/userDataStream",
            MarketType::Futures => "/fapi/v1/listenKey",
        };
        let data = self.request(Method::POST, endpoint, "", false, 1).await?;
        data["listenKey"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ExchangeError::Unknown("listenKey missing from response".into()))
    }

    async fn keepalive_listen_key(&self, key: &str) -> ExchangeResult<()> {
        let (endpoint, params) = match self.market_type {
            MarketType::Spot => ("/api/v3/userDataStream", format!("listenKey={key}")),
            MarketType::Futures => ("/fapi/v1/listenKey", String::new()),
        };
        self.request(Method::PUT, endpoint, &params, false, 1)
            .await?;
        Ok(())
    }

    /// User-data loop: listen-key lifecycle + execution report delivery.
    async fn run_user_stream(&self, tx: mpsc::UnboundedSender<ExecutionReport>) {
        let mut backoff = Backoff::for_stream();

        loop {
            let listen_key = match self.create_listen_key().await {
                Ok(key) => key,
                Err(e) => {
                    error!(error = %e, "failed to create listen key");
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                }
            };

            let url = format!("{}/ws/{}", self.ws_url, listen_key);
            match connect_async(&url).await {
                Ok((ws, _resp)) => {
                    info!("user-data stream connected");
                    backoff.reset();
                    let (_write, mut read) = ws.split();
                    let mut keepalive =
                        tokio::time::interval(Duration::from_secs(30 * 60));
                    keepalive.tick().await; // immediate first tick

                    loop {
                        tokio::select! {
                            _ = keepalive.tick() => {
                                if let Err(e) = self.keepalive_listen_key(&listen_key).await {
                                    warn!(error = %e, "listen key keepalive failed");
                                }
                            }
                            message = read.next() => {
                                match message {
                                    Some(Ok(Message::Text(text))) => {
                                        if let Some(report) = self.parse_execution_report(&text) {
                                            if tx.send(report).is_err() {
                                                // Receiver gone; stream is done.
                                                return;
                                            }
                                        }
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        error!(error = %e, "user-data stream read error");
                                        break;
                                    }
                                    None => {
                                        warn!("user-data stream ended");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "user-data stream connect failed");
                }
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// Parse an execution report out of a user-data message. Spot delivers
    /// `executionReport`; futures wraps the order in `ORDER_TRADE_UPDATE.o`.
    fn parse_execution_report(&self, text: &str) -> Option<ExecutionReport> {
        let root: serde_json::Value = serde_json::from_str(text).ok()?;
        let event_type = root["e"].as_str().unwrap_or("");

        let order = match event_type {
            "executionReport" => &root,
            "ORDER_TRADE_UPDATE" => &root["o"],
            _ => return None,
        };

        let avg = Self::parse_f64(&order["ap"]);
        Some(ExecutionReport {
            exchange: self.name().to_string(),
            symbol: order["s"].as_str().unwrap_or("").to_string(),
            exchange_order_id: order["i"]
                .as_u64()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            client_order_id: order["c"].as_str().unwrap_or("").to_string(),
            side: Self::parse_side(order["S"].as_str().unwrap_or("BUY")),
            status: map_order_status(order["X"].as_str().unwrap_or("")),
            last_fill_quantity: Self::parse_f64(&order["l"]),
            last_fill_price: Self::parse_f64(&order["L"]),
            cumulative_filled: Self::parse_f64(&order["z"]),
            average_price: if avg > 0.0 { Some(avg) } else { None },
            fee: Self::parse_f64(&order["n"]),
            fee_asset: order["N"].as_str().unwrap_or("").to_string(),
            is_maker: order["m"].as_bool().unwrap_or(false),
            executed_at: Utc::now(),
        })
    }
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("market_type", &self.market_type)
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderStatus;

    fn adapter() -> BinanceAdapter {
        BinanceAdapter::new(
            "key",
            "secret",
            MarketType::Spot,
            false,
            Duration::from_secs(30),
            3,
        )
    }

    #[test]
    fn signature_matches_known_vector() {
        // Reference vector from the Binance signed-endpoint documentation.
        let adapter = BinanceAdapter::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
            MarketType::Spot,
            false,
            Duration::from_secs(30),
            3,
        );
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            adapter.sign(query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn signed_query_appends_timestamp_window_signature() {
        let adapter = adapter();
        let qs = adapter.signed_query("symbol=BTCUSDT");
        assert!(qs.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(qs.contains("&recvWindow=5000&"));
        assert!(qs.contains("&signature="));
    }

    #[test]
    fn error_mapping_taxonomy() {
        let e = BinanceAdapter::map_error(429, 0, "too many".into(), Some(3000));
        assert!(matches!(e, ExchangeError::RateLimited { retry_after_ms: 3000 }));

        let e = BinanceAdapter::map_error(400, -2010, "insufficient balance".into(), None);
        assert!(matches!(e, ExchangeError::OrderRejected { .. }));

        let e = BinanceAdapter::map_error(401, 0, "unauthorized".into(), None);
        assert!(matches!(e, ExchangeError::Auth(_)));

        let e = BinanceAdapter::map_error(400, -1013, "filter failure".into(), None);
        assert!(matches!(e, ExchangeError::InvalidParameter(_)));

        let e = BinanceAdapter::map_error(500, -9999, "boom".into(), None);
        assert!(matches!(e, ExchangeError::Unknown(_)));
    }

    #[test]
    fn parse_order_result_spot_average_price_from_quote_volume() {
        let adapter = adapter();
        let data = serde_json::json!({
            "orderId": 42u64,
            "clientOrderId": "bot:1",
            "side": "BUY",
            "status": "PARTIALLY_FILLED",
            "price": "100.0",
            "origQty": "2.0",
            "executedQty": "1.0",
            "cummulativeQuoteQty": "99.5",
        });
        let result = adapter.parse_order_result("BTCUSDT", &data);
        assert_eq!(result.exchange_order_id, "42");
        assert_eq!(result.client_order_id, "bot:1");
        assert_eq!(result.status, OrderStatus::Partial);
        assert!((result.average_price.unwrap() - 99.5).abs() < 1e-9);
        assert!((result.filled_quantity - 1.0).abs() < 1e-12);
    }

    #[test]
    fn parse_spot_execution_report() {
        let adapter = adapter();
        let text = r#"{
            "e": "executionReport",
            "s": "ETHUSDT",
            "S": "SELL",
            "i": 7,
            "c": "bot:3",
            "X": "FILLED",
            "l": "0.5",
            "L": "2000.0",
            "z": "0.5",
            "n": "0.1",
            "N": "USDT",
            "m": true
        }"#;
        let report = adapter.parse_execution_report(text).unwrap();
        assert_eq!(report.symbol, "ETHUSDT");
        assert_eq!(report.side, OrderSide::Sell);
        assert_eq!(report.status, OrderStatus::Filled);
        assert!((report.last_fill_quantity - 0.5).abs() < 1e-12);
        assert!((report.last_fill_price - 2000.0).abs() < 1e-12);
        assert!(report.is_maker);
        assert_eq!(report.fee_asset, "USDT");
    }

    #[test]
    fn parse_futures_execution_report() {
        let adapter = BinanceAdapter::new(
            "key",
            "secret",
            MarketType::Futures,
            false,
            Duration::from_secs(30),
            3,
        );
        let text = r#"{
            "e": "ORDER_TRADE_UPDATE",
            "o": {
                "s": "BTCUSDT",
                "S": "BUY",
                "i": 9,
                "c": "bot:4",
                "X": "PARTIALLY_FILLED",
                "l": "0.01",
                "L": "50000",
                "z": "0.01",
                "ap": "50000",
                "n": "0.02",
                "N": "USDT",
                "m": false
            }
        }"#;
        let report = adapter.parse_execution_report(text).unwrap();
        assert_eq!(report.status, OrderStatus::Partial);
        assert_eq!(report.client_order_id, "bot:4");
        assert!((report.average_price.unwrap() - 50000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn order_quota_refusal_precedes_any_request() {
        use crate::types::TimeInForce;

        let adapter = adapter();
        // 10 s window exhausted per the exchange's own counter header.
        adapter.budget().record_order_counts(Some(10), None);

        let request = OrderRequest {
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: 1.0,
            price: Some(100.0),
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            client_order_id: Some("bot:1".into()),
        };
        // Refused locally — no HTTP request is attempted.
        let err = adapter.place_order(&request).await.unwrap_err();
        assert!(matches!(err, ExchangeError::RateLimited { .. }));
    }

    #[test]
    fn non_execution_events_are_ignored() {
        let adapter = adapter();
        assert!(adapter
            .parse_execution_report(r#"{"e": "outboundAccountPosition"}"#)
            .is_none());
        assert!(adapter.parse_execution_report("not json").is_none());
    }
}
