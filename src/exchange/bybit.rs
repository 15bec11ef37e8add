// =============================================================================
// Bybit Adapter — V5 unified API with header-based HMAC signing
// =============================================================================
//
// Signing differs from the query-string scheme: the signature covers the
// pre-image `timestamp || api_key || recv_window || params` and travels in
// the X-BAPI-SIGN header alongside X-BAPI-API-KEY / X-BAPI-TIMESTAMP /
// X-BAPI-RECV-WINDOW. Spot maps to category=spot, futures to
// category=linear.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
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

const RECV_WINDOW: &str = "5000";
const WEIGHT_LIMIT_1M: u32 = 600;
/// Maximum orders per 10-second window (10/s create-order cap).
const ORDER_LIMIT_10S: u32 = 100;
/// Maximum orders per day.
const ORDER_LIMIT_1D: u32 = 200_000;
/// Bybit retCode for a timestamp outside the recv window.
const CODE_CLOCK_SKEW: i64 = 10002;

const REST_URL: &str = "https://api.bybit.com";
const TESTNET_REST_URL: &str = "https://api-testnet.bybit.com";
const PUBLIC_WS_URL: &str = "wss://stream.bybit.com/v5/public";
const PRIVATE_WS_URL: &str = "wss://stream.bybit.com/v5/private";

/// Bybit exchange adapter (one instance per credential + market type).
pub struct BybitAdapter {
    api_key: String,
    secret: String,
    market_type: MarketType,
    base_url: String,
    client: reqwest::Client,
    budget: RateLimitBudget,
    time_offset_ms: AtomicI64,
    connected: AtomicBool,
    max_retries: u32,
}

impl BybitAdapter {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        market_type: MarketType,
        testnet: bool,
        request_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("failed to build reqwest client");

        let base_url = if testnet { TESTNET_REST_URL } else { REST_URL };
        debug!(market_type = %market_type, base_url, "BybitAdapter initialised");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            market_type,
            base_url: base_url.to_string(),
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

    /// V5 category for this market type.
    fn category(&self) -> &'static str {
        match self.market_type {
            MarketType::Spot => "spot",
            MarketType::Futures => "linear",
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    fn hmac_hex(secret: &str, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn local_timestamp_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    fn timestamp_ms(&self) -> i64 {
        Self::local_timestamp_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// Signature over `timestamp || api_key || recv_window || params`.
    fn sign(&self, timestamp: i64, params: &str) -> String {
        let pre_image = format!("{timestamp}{}{RECV_WINDOW}{params}", self.api_key);
        Self::hmac_hex(&self.secret, &pre_image)
    }

    async fn resync_time(&self) -> ExchangeResult<()> {
        let url = format!("{}/v5/market/time", self.base_url);
        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?
            .json()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?;

        let server_time = body["result"]["timeSecond"]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or(0);
        if server_time > 0 {
            let offset = server_time - Self::local_timestamp_ms();
            self.time_offset_ms.store(offset, Ordering::Relaxed);
            info!(offset_ms = offset, "server time resynced");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Execute a V5 request. Query parameters must already be sorted by key
    /// (the signature covers them verbatim).
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
            let url = if params.is_empty() || method == Method::POST {
                format!("{}{}", self.base_url, endpoint)
            } else {
                format!("{}{}?{}", self.base_url, endpoint, params)
            };

            let mut builder = self.client.request(method.clone(), &url);

            if signed {
                let ts = self.timestamp_ms();
                // POST requests sign the JSON body; GETs sign the query.
                let payload = params.to_string();
                let signature = self.sign(ts, &payload);
                builder = builder
                    .header("X-BAPI-API-KEY", &self.api_key)
                    .header("X-BAPI-SIGN", signature)
                    .header("X-BAPI-TIMESTAMP", ts.to_string())
                    .header("X-BAPI-RECV-WINDOW", RECV_WINDOW);
            }
            if method == Method::POST && !params.is_empty() {
                builder = builder
                    .header("Content-Type", "application/json")
                    .body(params.to_string());
            }

            let resp = match builder.send().await {
                Ok(resp) => resp,
                Err(e) => {
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

            let http_status = resp.status().as_u16();
            let body: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| ExchangeError::Connection(e.to_string()))?;

            let ret_code = body["retCode"].as_i64().unwrap_or(-1);
            if ret_code == 0 {
                return Ok(body["result"].clone());
            }

            if ret_code == CODE_CLOCK_SKEW && signed && !skew_retried {
                skew_retried = true;
                warn!(endpoint, "clock skew rejection — resyncing server time");
                self.resync_time().await?;
                continue;
            }

            let msg = body["retMsg"].as_str().unwrap_or("").to_string();
            return Err(Self::map_error(http_status, ret_code, msg));
        }
    }

    /// Map an HTTP status + Bybit retCode into the fixed taxonomy.
    fn map_error(status: u16, ret_code: i64, msg: String) -> ExchangeError {
        match (status, ret_code) {
            (429, _) | (_, 10006) | (_, 10018) => ExchangeError::RateLimited {
                retry_after_ms: 60_000,
            },
            (401, _) | (_, 10003) | (_, 10004) | (_, 33004) => ExchangeError::Auth(msg),
            (_, 10001) | (_, 10005) => ExchangeError::InvalidParameter(msg),
            (_, code) if (110000..120000).contains(&code) => ExchangeError::OrderRejected {
                reason: msg,
                order_id: None,
            },
            _ => ExchangeError::Unknown(format!("HTTP {status} retCode {ret_code}: {msg}")),
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

    fn parse_order_entry(entry: &serde_json::Value) -> OrderResult {
        let price = Self::parse_f64(&entry["price"]);
        let avg = Self::parse_f64(&entry["avgPrice"]);
        OrderResult {
            exchange_order_id: entry["orderId"].as_str().unwrap_or("").to_string(),
            client_order_id: entry["orderLinkId"].as_str().unwrap_or("").to_string(),
            symbol: entry["symbol"].as_str().unwrap_or("").to_string(),
            side: Self::parse_side(entry["side"].as_str().unwrap_or("Buy")),
            status: map_order_status(entry["orderStatus"].as_str().unwrap_or("")),
            price: if price > 0.0 { Some(price) } else { None },
            quantity: Self::parse_f64(&entry["qty"]),
            filled_quantity: Self::parse_f64(&entry["cumExecQty"]),
            average_price: if avg > 0.0 { Some(avg) } else { None },
            fee: Self::parse_f64(&entry["cumExecFee"]),
            fee_asset: String::new(),
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// ExchangeAdapter implementation
// =============================================================================

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn name(&self) -> &'static str {
        "bybit"
    }

    fn market_type(&self) -> MarketType {
        self.market_type
    }

    async fn connect(&self) -> ExchangeResult<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.resync_time().await?;
        info!(market_type = %self.market_type, "bybit adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> ExchangeResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        info!("bybit adapter disconnected");
        Ok(())
    }

    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        let params = format!("category={}&symbol={symbol}", self.category());
        let result = self
            .request(Method::GET, "/v5/market/tickers", &params, false, 1)
            .await?;

        let entry = result["list"]
            .as_array()
            .and_then(|arr| arr.first())
            .cloned()
            .unwrap_or_default();

        Ok(Ticker {
            symbol: symbol.to_string(),
            price: Self::parse_f64(&entry["lastPrice"]),
            bid: Self::parse_f64(&entry["bid1Price"]),
            ask: Self::parse_f64(&entry["ask1Price"]),
            volume_24h: Self::parse_f64(&entry["volume24h"]),
            change_24h: Self::parse_f64(&entry["price24hPcnt"]) * 100.0,
            timestamp: Utc::now(),
        })
    }

    async fn get_orderbook(&self, symbol: &str, depth: u32) -> ExchangeResult<Orderbook> {
        let params = format!(
            "category={}&limit={depth}&symbol={symbol}",
            self.category()
        );
        let result = self
            .request(Method::GET, "/v5/market/orderbook", &params, false, 1)
            .await?;

        let parse_side = |key: &str| -> Vec<[f64; 2]> {
            result[key]
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
            bids: parse_side("b"),
            asks: parse_side("a"),
        })
    }

    async fn get_balances(&self) -> ExchangeResult<Vec<Balance>> {
        let account_type = match self.market_type {
            MarketType::Spot => "SPOT",
            MarketType::Futures => "UNIFIED",
        };
        let params = format!("accountType={account_type}");
        let result = self
            .request(Method::GET, "/v5/account/wallet-balance", &params, true, 10)
            .await?;

        let mut balances = Vec::new();
        for account in result["list"].as_array().unwrap_or(&Vec::new()) {
            for coin in account["coin"].as_array().unwrap_or(&Vec::new()) {
                let total = Self::parse_f64(&coin["walletBalance"]);
                let free = {
                    let avail = Self::parse_f64(&coin["availableToWithdraw"]);
                    if avail > 0.0 {
                        avail
                    } else {
                        total
                    }
                };
                if total > 0.0 {
                    balances.push(Balance {
                        asset: coin["coin"].as_str().unwrap_or("").to_string(),
                        free,
                        locked: (total - free).max(0.0),
                        total,
                    });
                }
            }
        }
        Ok(balances)
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        if self.market_type != MarketType::Futures {
            return Ok(Vec::new());
        }
        let params = format!("category={}&settleCoin=USDT", self.category());
        let result = self
            .request(Method::GET, "/v5/position/list", &params, true, 5)
            .await?;

        let mut positions = Vec::new();
        for pos in result["list"].as_array().unwrap_or(&Vec::new()) {
            let size = Self::parse_f64(&pos["size"]);
            if size == 0.0 {
                continue;
            }
            let liq = Self::parse_f64(&pos["liqPrice"]);
            positions.push(ExchangePosition {
                symbol: pos["symbol"].as_str().unwrap_or("").to_string(),
                side: if pos["side"].as_str() == Some("Sell") {
                    PositionSide::Short
                } else {
                    PositionSide::Long
                },
                quantity: size.abs(),
                entry_price: Self::parse_f64(&pos["avgPrice"]),
                mark_price: Self::parse_f64(&pos["markPrice"]),
                liquidation_price: if liq > 0.0 { Some(liq) } else { None },
                unrealized_pnl: Self::parse_f64(&pos["unrealisedPnl"]),
                leverage: Self::parse_f64(&pos["leverage"]) as u32,
                margin_type: pos["tradeMode"]
                    .as_i64()
                    .map(|mode| if mode == 1 { "isolated" } else { "cross" })
                    .unwrap_or("cross")
                    .to_string(),
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

        let order_type = match request.order_type {
            OrderType::Market => "Market",
            _ => "Limit",
        };
        let side = match request.side {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        };

        let mut body = json!({
            "category": self.category(),
            "symbol": request.symbol,
            "side": side,
            "orderType": order_type,
            "qty": request.quantity.to_string(),
        });
        if let Some(price) = request.price {
            if request.order_type != OrderType::Market {
                body["price"] = json!(price.to_string());
                body["timeInForce"] = json!(request.time_in_force.to_string());
            }
        }
        if let Some(stop) = request.stop_price {
            body["triggerPrice"] = json!(stop.to_string());
        }
        if request.reduce_only && self.market_type == MarketType::Futures {
            body["reduceOnly"] = json!(true);
        }
        if let Some(coid) = &request.client_order_id {
            body["orderLinkId"] = json!(coid);
        }

        debug!(
            symbol = %request.symbol,
            side = %request.side,
            order_type = %request.order_type,
            quantity = request.quantity,
            "placing order"
        );

        // No order-count headers on V5; the local tally is the budget.
        self.budget.record_order_sent();
        let result = self
            .request(
                Method::POST,
                "/v5/order/create",
                &body.to_string(),
                true,
                1,
            )
            .await
            .map_err(|e| match e {
                ExchangeError::OrderRejected { reason, .. } => ExchangeError::OrderRejected {
                    reason,
                    order_id: request.client_order_id.clone(),
                },
                other => other,
            })?;

        Ok(OrderResult {
            exchange_order_id: result["orderId"].as_str().unwrap_or("").to_string(),
            client_order_id: result["orderLinkId"]
                .as_str()
                .unwrap_or_else(|| request.client_order_id.as_deref().unwrap_or(""))
                .to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            status: crate::types::OrderStatus::Open,
            price: request.price,
            quantity: request.quantity,
            filled_quantity: 0.0,
            average_price: None,
            fee: 0.0,
            fee_asset: String::new(),
            timestamp: Utc::now(),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<bool> {
        let body = json!({
            "category": self.category(),
            "symbol": symbol,
            "orderId": order_id,
        });
        self.request(
            Method::POST,
            "/v5/order/cancel",
            &body.to_string(),
            true,
            1,
        )
        .await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(true)
    }

    async fn get_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderResult> {
        let params = format!(
            "category={}&orderId={order_id}&symbol={symbol}",
            self.category()
        );
        let result = self
            .request(Method::GET, "/v5/order/realtime", &params, true, 2)
            .await?;

        result["list"]
            .as_array()
            .and_then(|arr| arr.first())
            .map(Self::parse_order_entry)
            .ok_or_else(|| ExchangeError::Unknown(format!("order {order_id} not found")))
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderResult>> {
        let params = match symbol {
            Some(s) => format!("category={}&symbol={s}", self.category()),
            None => format!("category={}&settleCoin=USDT", self.category()),
        };
        let result = self
            .request(Method::GET, "/v5/order/realtime", &params, true, 3)
            .await?;

        Ok(result["list"]
            .as_array()
            .unwrap_or(&Vec::new())
            .iter()
            .map(Self::parse_order_entry)
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        if self.market_type != MarketType::Futures {
            return Ok(());
        }
        let body = json!({
            "category": self.category(),
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        self.request(
            Method::POST,
            "/v5/position/set-leverage",
            &body.to_string(),
            true,
            1,
        )
        .await?;
        info!(symbol, leverage, "leverage set");
        Ok(())
    }

    async fn tick_size(&self, symbol: &str) -> ExchangeResult<f64> {
        let params = format!("category={}&symbol={symbol}", self.category());
        let result = self
            .request(Method::GET, "/v5/market/instruments-info", &params, false, 1)
            .await?;

        let tick = result["list"]
            .as_array()
            .and_then(|arr| arr.first())
            .map(|info| Self::parse_f64(&info["priceFilter"]["tickSize"]))
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

impl BybitAdapter {
    async fn run_market_stream(&self, symbol: String, bus: Arc<EventBus>) {
        let url = format!("{}/{}", PUBLIC_WS_URL, self.category());
        let subscribe = json!({
            "op": "subscribe",
            "args": [
                format!("tickers.{symbol}"),
                format!("publicTrade.{symbol}"),
                format!("orderbook.50.{symbol}"),
                format!("kline.1.{symbol}"),
            ],
        });

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

                    let (mut write, mut read) = ws.split();
                    if let Err(e) = write.send(Message::Text(subscribe.to_string())).await {
                        error!(error = %e, "failed to send subscribe op");
                        tokio::time::sleep(backoff.next_delay()).await;
                        continue;
                    }

                    while let Some(message) = read.next().await {
                        match message {
                            Ok(Message::Text(text)) => {
                                self.handle_market_message(&symbol, &text, &bus);
                            }
                            Ok(Message::Ping(payload)) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Ok(_) => {}
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

        let topic = root["topic"].as_str().unwrap_or("");
        let data = &root["data"];

        if topic.starts_with("tickers.") {
            let price = Self::parse_f64(&data["lastPrice"]);
            if price <= 0.0 {
                // Delta frames may omit the last price.
                return;
            }
            let bid = Self::parse_f64(&data["bid1Price"]);
            let ask = Self::parse_f64(&data["ask1Price"]);
            bus.emit(
                "market.tick",
                json!({
                    "symbol": symbol,
                    "exchange": self.name(),
                    "price": price,
                    "bid": if bid > 0.0 { bid } else { price },
                    "ask": if ask > 0.0 { ask } else { price },
                    "volume_24h": Self::parse_f64(&data["volume24h"]),
                    "change_24h": Self::parse_f64(&data["price24hPcnt"]) * 100.0,
                    "timestamp": Utc::now(),
                }),
                None,
            );
        } else if topic.starts_with("publicTrade.") {
            for trade in data.as_array().unwrap_or(&Vec::new()) {
                bus.emit(
                    "market.trade",
                    json!({
                        "symbol": symbol,
                        "exchange": self.name(),
                        "price": Self::parse_f64(&trade["p"]),
                        "quantity": Self::parse_f64(&trade["v"]),
                        "is_buyer_maker": trade["S"].as_str() == Some("Sell"),
                        "timestamp": Utc::now(),
                    }),
                    None,
                );
            }
        } else if topic.starts_with("orderbook.") {
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
            bus.emit(
                "market.orderbook",
                json!({
                    "symbol": symbol,
                    "exchange": self.name(),
                    "bids": parse_levels(&data["b"]),
                    "asks": parse_levels(&data["a"]),
                }),
                None,
            );
        } else if topic.starts_with("kline.") {
            for k in data.as_array().unwrap_or(&Vec::new()) {
                if k["confirm"].as_bool() != Some(true) {
                    continue;
                }
                let candle = Candle {
                    open_time: k["start"].as_i64().unwrap_or(0),
                    open: Self::parse_f64(&k["open"]),
                    high: Self::parse_f64(&k["high"]),
                    low: Self::parse_f64(&k["low"]),
                    close: Self::parse_f64(&k["close"]),
                    volume: Self::parse_f64(&k["volume"]),
                    close_time: k["end"].as_i64().unwrap_or(0),
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
    }

    // -------------------------------------------------------------------------
    // Private (user-data) stream
    // -------------------------------------------------------------------------

    async fn run_user_stream(&self, tx: mpsc::UnboundedSender<ExecutionReport>) {
        let mut backoff = Backoff::for_stream();

        loop {
            match connect_async(PRIVATE_WS_URL).await {
                Ok((ws, _resp)) => {
                    info!("private stream connected");
                    backoff.reset();
                    let (mut write, mut read) = ws.split();

                    // Authenticate: signature over "GET/realtime{expires}".
                    let expires = Self::local_timestamp_ms() + 10_000;
                    let signature =
                        Self::hmac_hex(&self.secret, &format!("GET/realtime{expires}"));
                    let auth = json!({
                        "op": "auth",
                        "args": [self.api_key, expires, signature],
                    });
                    let subscribe = json!({
                        "op": "subscribe",
                        "args": ["execution", "order"],
                    });

                    let handshake_ok = write.send(Message::Text(auth.to_string())).await.is_ok()
                        && write
                            .send(Message::Text(subscribe.to_string()))
                            .await
                            .is_ok();
                    if !handshake_ok {
                        error!("private stream handshake failed");
                        tokio::time::sleep(backoff.next_delay()).await;
                        continue;
                    }

                    while let Some(message) = read.next().await {
                        match message {
                            Ok(Message::Text(text)) => {
                                for report in self.parse_execution_reports(&text) {
                                    if tx.send(report).is_err() {
                                        return;
                                    }
                                }
                            }
                            Ok(Message::Ping(payload)) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(error = %e, "private stream read error");
                                break;
                            }
                        }
                    }
                    warn!("private stream ended — reconnecting");
                }
                Err(e) => {
                    error!(error = %e, "private stream connect failed");
                }
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// Parse execution messages from the private stream. One frame may carry
    /// several fills.
    fn parse_execution_reports(&self, text: &str) -> Vec<ExecutionReport> {
        let root: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };
        if root["topic"].as_str() != Some("execution") {
            return Vec::new();
        }

        root["data"]
            .as_array()
            .unwrap_or(&Vec::new())
            .iter()
            .map(|exec| {
                let avg = Self::parse_f64(&exec["execPrice"]);
                ExecutionReport {
                    exchange: self.name().to_string(),
                    symbol: exec["symbol"].as_str().unwrap_or("").to_string(),
                    exchange_order_id: exec["orderId"].as_str().unwrap_or("").to_string(),
                    client_order_id: exec["orderLinkId"].as_str().unwrap_or("").to_string(),
                    side: Self::parse_side(exec["side"].as_str().unwrap_or("Buy")),
                    status: if Self::parse_f64(&exec["leavesQty"]) > 0.0 {
                        crate::types::OrderStatus::Partial
                    } else {
                        crate::types::OrderStatus::Filled
                    },
                    last_fill_quantity: Self::parse_f64(&exec["execQty"]),
                    last_fill_price: Self::parse_f64(&exec["execPrice"]),
                    cumulative_filled: Self::parse_f64(&exec["cumExecQty"]),
                    average_price: if avg > 0.0 { Some(avg) } else { None },
                    fee: Self::parse_f64(&exec["execFee"]),
                    fee_asset: String::new(),
                    is_maker: exec["isMaker"].as_bool().unwrap_or(false),
                    executed_at: Utc::now(),
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for BybitAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitAdapter")
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

    fn adapter() -> BybitAdapter {
        BybitAdapter::new(
            "api-key",
            "api-secret",
            MarketType::Futures,
            false,
            Duration::from_secs(30),
            3,
        )
    }

    #[test]
    fn signature_covers_timestamp_key_window_params() {
        let adapter = adapter();
        let sig = adapter.sign(1_700_000_000_000, "category=linear&symbol=BTCUSDT");
        let expected = BybitAdapter::hmac_hex(
            "api-secret",
            "1700000000000api-key5000category=linear&symbol=BTCUSDT",
        );
        assert_eq!(sig, expected);
    }

    #[test]
    fn category_follows_market_type() {
        assert_eq!(adapter().category(), "linear");
        let spot = BybitAdapter::new(
            "k",
            "s",
            MarketType::Spot,
            false,
            Duration::from_secs(30),
            3,
        );
        assert_eq!(spot.category(), "spot");
    }

    #[test]
    fn error_mapping_taxonomy() {
        let e = BybitAdapter::map_error(200, 10006, "too many visits".into());
        assert!(matches!(e, ExchangeError::RateLimited { .. }));

        let e = BybitAdapter::map_error(200, 10003, "invalid api key".into());
        assert!(matches!(e, ExchangeError::Auth(_)));

        let e = BybitAdapter::map_error(200, 10001, "params error".into());
        assert!(matches!(e, ExchangeError::InvalidParameter(_)));

        let e = BybitAdapter::map_error(200, 110007, "insufficient balance".into());
        assert!(matches!(e, ExchangeError::OrderRejected { .. }));

        let e = BybitAdapter::map_error(500, 99999, "boom".into());
        assert!(matches!(e, ExchangeError::Unknown(_)));
    }

    #[test]
    fn parse_order_entry_maps_v5_fields() {
        let entry = serde_json::json!({
            "orderId": "abc-123",
            "orderLinkId": "bot:9",
            "symbol": "BTCUSDT",
            "side": "Sell",
            "orderStatus": "PartiallyFilled",
            "price": "50000",
            "qty": "0.2",
            "cumExecQty": "0.1",
            "avgPrice": "50010",
            "cumExecFee": "0.5",
        });
        let result = BybitAdapter::parse_order_entry(&entry);
        assert_eq!(result.exchange_order_id, "abc-123");
        assert_eq!(result.client_order_id, "bot:9");
        assert_eq!(result.side, OrderSide::Sell);
        assert_eq!(result.status, OrderStatus::Partial);
        assert!((result.average_price.unwrap() - 50010.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn order_quota_refusal_precedes_any_request() {
        use crate::types::TimeInForce;

        let adapter = adapter();
        adapter.budget().record_order_counts(Some(100), None);

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
    fn execution_frames_parse_to_reports() {
        let adapter = adapter();
        let text = r#"{
            "topic": "execution",
            "data": [{
                "symbol": "ETHUSDT",
                "orderId": "oid-1",
                "orderLinkId": "bot:2",
                "side": "Buy",
                "execQty": "0.5",
                "execPrice": "2000",
                "cumExecQty": "0.5",
                "leavesQty": "0",
                "execFee": "0.2",
                "isMaker": false
            }]
        }"#;
        let reports = adapter.parse_execution_reports(text);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, OrderStatus::Filled);
        assert_eq!(reports[0].client_order_id, "bot:2");

        // Non-execution topics yield nothing.
        assert!(adapter
            .parse_execution_reports(r#"{"topic": "order", "data": []}"#)
            .is_empty());
    }
}
