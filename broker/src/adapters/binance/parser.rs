//! REST and stream payloads of the futures API.
//!
//! Bodies are decoded into typed structs with serde. Decimal fields arrive
//! quoted and go through `codec::de_number`. Timestamps are epoch
//! milliseconds and become naive UTC datetimes, matching the bar store.

use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDateTime};
use market::{BarRow, Bars, Distributor};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use tradelink::{
    AccountSnapshot, MoneyPosition, OrderStatus, PriceBounds, SecPosition, Security, Side,
    Timeframe, decimals_of_step,
};

use crate::codec::{de_number, de_opt_number};
use crate::error::BrokerError;
use crate::identity::OrderUpdate;
use crate::ingest::MessageHandler;
use crate::recalc::RecalcScheduler;
use crate::session::{merge_history_batch, on_live_update};
use crate::state::TradingState;

/// Board recorded on every futures security.
pub const BOARD: &str = "USDM";
pub const DEFAULT_MAX_CLOCK_SKEW_MS: i64 = 10_000;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTime {
    pub server_time: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiRestrictions {
    pub ip_restrict: bool,
    pub enable_reading: bool,
    pub enable_futures: bool,
    pub enable_withdrawals: bool,
    pub enable_internal_transfer: bool,
    pub permits_universal_transfer: bool,
    pub enable_margin: bool,
    pub enable_spot_and_margin_trading: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub quote_asset: String,
    #[serde(default)]
    pub price_precision: Option<u32>,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    Price {
        #[serde(deserialize_with = "de_number")]
        min_price: f64,
        #[serde(deserialize_with = "de_number")]
        max_price: f64,
        #[serde(deserialize_with = "de_number")]
        tick_size: f64,
    },
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        #[serde(deserialize_with = "de_number")]
        min_qty: f64,
        #[serde(deserialize_with = "de_number")]
        max_qty: f64,
        #[serde(deserialize_with = "de_number")]
        step_size: f64,
    },
    #[serde(rename = "MARKET_LOT_SIZE", rename_all = "camelCase")]
    MarketLotSize {
        #[serde(deserialize_with = "de_number")]
        min_qty: f64,
        #[serde(deserialize_with = "de_number")]
        max_qty: f64,
        #[serde(deserialize_with = "de_number")]
        step_size: f64,
    },
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional {
        #[serde(alias = "minNotional", deserialize_with = "de_number")]
        notional: f64,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(deserialize_with = "de_number")]
    pub total_initial_margin: f64,
    #[serde(deserialize_with = "de_number")]
    pub total_maint_margin: f64,
    #[serde(deserialize_with = "de_number")]
    pub total_wallet_balance: f64,
    #[serde(deserialize_with = "de_number")]
    pub total_unrealized_profit: f64,
    #[serde(default)]
    pub assets: Vec<AssetBalance>,
    #[serde(default)]
    pub positions: Vec<PositionInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub asset: String,
    #[serde(deserialize_with = "de_number")]
    pub wallet_balance: f64,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub margin_balance: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub unrealized_profit: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionInfo {
    pub symbol: String,
    #[serde(deserialize_with = "de_number")]
    pub position_amt: f64,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub entry_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub unrealized_profit: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "e")]
    pub event: String,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: StreamKline,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamKline {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o", deserialize_with = "de_number")]
    pub open: f64,
    #[serde(rename = "h", deserialize_with = "de_number")]
    pub high: f64,
    #[serde(rename = "l", deserialize_with = "de_number")]
    pub low: f64,
    #[serde(rename = "c", deserialize_with = "de_number")]
    pub close: f64,
    #[serde(rename = "v", deserialize_with = "de_number")]
    pub volume: f64,
    #[serde(rename = "x", default)]
    pub closed: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: u64,
    pub symbol: String,
    pub status: String,
    pub client_order_id: String,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub orig_qty: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_number")]
    pub executed_qty: Option<f64>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub update_time: Option<i64>,
}

/// REST bodies and stream frames queued for the ingestion thread.
#[derive(Debug, Clone, PartialEq)]
pub enum RestMessage {
    ExchangeInfo(String),
    Account(String),
    Klines {
        symbol: String,
        timeframe: Timeframe,
        body: String,
    },
    Stream(String),
    Order(String),
    /// A locally submitted order the venue never accepted.
    OrderFailed {
        transaction_id: u64,
        reason: String,
    },
}

pub fn check_clock_skew(server_time_ms: i64, local_time_ms: i64, limit_ms: i64) -> Result<(), BrokerError> {
    let skew_ms = local_time_ms - server_time_ms;
    if skew_ms.abs() > limit_ms {
        return Err(BrokerError::ClockSkew { skew_ms, limit_ms });
    }
    Ok(())
}

/// Reading and futures access are required; risky extras only warn.
pub fn check_permissions(restrictions: &ApiRestrictions) -> Result<(), BrokerError> {
    let mut missing = Vec::new();
    if !restrictions.enable_reading {
        missing.push("enableReading".to_string());
    }
    if !restrictions.enable_futures {
        missing.push("enableFutures".to_string());
    }
    if !missing.is_empty() {
        return Err(BrokerError::PermissionDenied(missing));
    }
    let risky = [
        ("enableWithdrawals", restrictions.enable_withdrawals),
        ("enableInternalTransfer", restrictions.enable_internal_transfer),
        ("permitsUniversalTransfer", restrictions.permits_universal_transfer),
        ("enableMargin", restrictions.enable_margin),
    ];
    for (flag, enabled) in risky {
        if enabled {
            warn!(permission = flag, "api key carries a permission this connector never uses");
        }
    }
    if !restrictions.ip_restrict {
        warn!("api key is not restricted to trusted addresses");
    }
    Ok(())
}

pub fn security_from_symbol(info: &SymbolInfo) -> Security {
    let mut security = Security::new(info.symbol.clone(), BOARD);
    security.shortname = info.symbol.clone();
    security.currency = info.quote_asset.clone();
    security.active = info.status == "TRADING";
    let mut lot_step = None;
    let mut market_step = None;
    let mut tick_seen = false;
    for filter in &info.filters {
        match *filter {
            SymbolFilter::Price {
                min_price,
                max_price,
                tick_size,
            } => {
                if tick_size > 0.0 {
                    tick_seen = true;
                    security.min_step = tick_size;
                    security.decimals = decimals_of_step(tick_size);
                }
                security.price_bounds = Some(PriceBounds { min_price, max_price });
            }
            SymbolFilter::LotSize { step_size, .. } => lot_step = Some(step_size),
            SymbolFilter::MarketLotSize { step_size, .. } => market_step = Some(step_size),
            SymbolFilter::MinNotional { notional } => security.min_notional = Some(notional),
            SymbolFilter::Other => {}
        }
    }
    if let Some(precision) = info.price_precision.filter(|_| !tick_seen) {
        security.decimals = precision;
    }
    security.lot_size = match (lot_step, market_step) {
        (Some(lot), Some(market)) if (lot - market).abs() > f64::EPSILON => {
            let coarser = lot.max(market);
            warn!(
                symbol = %info.symbol,
                lot_step = lot,
                market_step = market,
                "lot size steps disagree, using the coarser one"
            );
            coarser
        }
        (Some(step), _) | (None, Some(step)) => step,
        (None, None) => security.lot_size,
    };
    security
}

pub fn account_snapshot(info: &AccountInfo) -> AccountSnapshot {
    AccountSnapshot {
        total_initial_margin: info.total_initial_margin,
        total_maint_margin: info.total_maint_margin,
        total_wallet_balance: info.total_wallet_balance,
        total_unrealized_profit: info.total_unrealized_profit,
    }
}

pub fn datetime_from_millis(ms: i64) -> Result<NaiveDateTime, BrokerError> {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| BrokerError::Malformed(format!("timestamp {ms} out of range")))
}

/// Rows are `[openTime, open, high, low, close, volume, closeTime, ...]`.
pub fn decode_klines(body: &str, timeframe: Timeframe) -> Result<Bars, BrokerError> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(body)?;
    let mut bars = Bars::with_capacity(timeframe, rows.len());
    for row in rows {
        let number = |index: usize| -> Result<f64, BrokerError> {
            match row.get(index) {
                Some(Value::String(text)) => text
                    .parse()
                    .map_err(|_| BrokerError::Malformed(format!("kline field {index} is {text:?}"))),
                Some(Value::Number(n)) => n
                    .as_f64()
                    .ok_or_else(|| BrokerError::Malformed(format!("kline field {index} is {n}"))),
                _ => Err(BrokerError::Malformed(format!("kline without field {index}"))),
            }
        };
        let open_time = row
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| BrokerError::Malformed("kline without open time".to_string()))?;
        bars.push(BarRow::new(
            datetime_from_millis(open_time)?,
            number(1)?,
            number(2)?,
            number(3)?,
            number(4)?,
            number(5)?,
        ))?;
    }
    Ok(bars)
}

/// Stream intervals use `m`, `h`, `d` like [`Timeframe`]; weekly and
/// monthly intervals have no counterpart.
pub fn timeframe_from_interval(interval: &str) -> Option<Timeframe> {
    if interval.ends_with(['w', 'M']) {
        return None;
    }
    Timeframe::parse(interval).ok()
}

pub fn interval_for(timeframe: Timeframe) -> String {
    timeframe.to_string()
}

pub fn map_status(status: &str) -> Option<OrderStatus> {
    match status {
        "NEW" | "PARTIALLY_FILLED" => Some(OrderStatus::Active),
        "FILLED" => Some(OrderStatus::Matched),
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => Some(OrderStatus::Cancelled),
        "REJECTED" => Some(OrderStatus::Disabled),
        _ => None,
    }
}

pub fn decode_order_response(body: &str) -> Result<OrderResponse, BrokerError> {
    Ok(serde_json::from_str(body)?)
}

/// Client order ids are the locally issued transaction ids.
pub fn order_update(response: &OrderResponse) -> Result<OrderUpdate, BrokerError> {
    let transaction_id = response.client_order_id.parse().map_err(|_| {
        BrokerError::Malformed(format!(
            "client order id {:?} is not a transaction id",
            response.client_order_id
        ))
    })?;
    let executed = response.executed_qty.unwrap_or(0.0);
    let status = map_status(&response.status);
    if status.is_none() {
        warn!(status = %response.status, "unknown order status, keeping previous");
    }
    Ok(OrderUpdate {
        order_no: Some(response.order_id).filter(|id| *id != 0),
        seccode: Some(response.symbol.clone()),
        board: Some(BOARD.to_string()),
        side: response.side.as_deref().and_then(|s| Side::parse(s).ok()),
        status,
        accepted_at: response.update_time.map(datetime_from_millis).transpose()?,
        price: response.price.filter(|p| *p > 0.0),
        quantity: response.orig_qty,
        balance: response.orig_qty.map(|q| (q - executed).max(0.0)),
        ..OrderUpdate::new(transaction_id)
    })
}

/// Applies REST bodies and stream frames on the ingestion thread.
pub struct BinanceHandler {
    recalc: Arc<RecalcScheduler>,
    distributor: Arc<Distributor>,
}

impl BinanceHandler {
    pub fn new(recalc: Arc<RecalcScheduler>, distributor: Arc<Distributor>) -> Self {
        Self { recalc, distributor }
    }

    fn apply_stream(&self, state: &mut TradingState, text: &str) -> Result<(), BrokerError> {
        let value: Value = serde_json::from_str(text)?;
        let payload = value.get("data").unwrap_or(&value);
        match payload.get("e").and_then(Value::as_str) {
            Some("kline") => {}
            other => {
                debug!(event = ?other, "stream event ignored");
                return Ok(());
            }
        }
        let event = KlineEvent::deserialize(payload)?;
        let Some(timeframe) = timeframe_from_interval(&event.kline.interval) else {
            debug!(interval = %event.kline.interval, "kline interval not supported");
            return Ok(());
        };
        let k = &event.kline;
        let row = BarRow::new(datetime_from_millis(k.open_time)?, k.open, k.high, k.low, k.close, k.volume);
        let update = state.series_mut(&event.symbol).upsert_last(timeframe, row)?;
        on_live_update(&update, &event.symbol, timeframe, &self.distributor, &self.recalc);
        Ok(())
    }
}

impl MessageHandler for BinanceHandler {
    type Message = RestMessage;

    fn handle(&mut self, state: &mut TradingState, message: RestMessage) -> Result<(), BrokerError> {
        match message {
            RestMessage::ExchangeInfo(body) => {
                let info: ExchangeInfo = serde_json::from_str(&body)?;
                for symbol in &info.symbols {
                    let mut security = security_from_symbol(symbol);
                    if let Some(previous) = state.securities.get(&security.seccode) {
                        security.last_trade = previous.last_trade.clone();
                    }
                    state.securities.insert(security.seccode.clone(), security);
                }
                debug!(symbols = info.symbols.len(), "exchange info applied");
            }
            RestMessage::Account(body) => {
                let info: AccountInfo = serde_json::from_str(&body)?;
                state.account = Some(account_snapshot(&info));
                for asset in &info.assets {
                    state.money.insert(
                        asset.asset.clone(),
                        MoneyPosition {
                            shortname: asset.asset.clone(),
                            open_balance: asset.wallet_balance,
                            balance: asset.margin_balance.unwrap_or(asset.wallet_balance),
                            unrealized_pnl: asset.unrealized_profit,
                        },
                    );
                }
                for position in &info.positions {
                    if position.position_amt == 0.0 {
                        state.positions.remove(&position.symbol);
                        continue;
                    }
                    state.positions.insert(
                        position.symbol.clone(),
                        SecPosition {
                            seccode: position.symbol.clone(),
                            balance: position.position_amt,
                            pl: position.unrealized_profit.unwrap_or(0.0),
                            entry_price: position.entry_price,
                            ..SecPosition::default()
                        },
                    );
                }
            }
            RestMessage::Klines { symbol, timeframe, body } => {
                let bars = decode_klines(&body, timeframe)?;
                merge_history_batch(state, &self.distributor, &symbol, bars);
            }
            RestMessage::Stream(text) => self.apply_stream(state, &text)?,
            RestMessage::Order(body) => {
                let response = decode_order_response(&body)?;
                let update = order_update(&response)?;
                state.resolve_order(update, Local::now().naive_local());
            }
            RestMessage::OrderFailed { transaction_id, reason } => {
                let update = OrderUpdate {
                    status: Some(OrderStatus::Disabled),
                    result: Some(reason),
                    ..OrderUpdate::new(transaction_id)
                };
                state.resolve_order(update, Local::now().naive_local());
            }
        }
        Ok(())
    }
}
