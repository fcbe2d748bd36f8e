//! Shared trading state and its read-only view.
//!
//! `TradingState` is only mutated on the ingestion thread, one message per
//! write lock. Everything else reads through `StateView`, which hands out
//! clones and `Arc` series snapshots.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Instant;

use chrono::NaiveDateTime;
use market::{InstrumentSeries, SeriesConfig, SeriesSnapshot};
use tradelink::{
    AccountSnapshot, CandleKind, ClientAccount, ConnectionState, Market, MoneyPosition, Order,
    PortfolioSnapshot, SecPosition, Security, Timeframe, Trade, UnitedLimits,
};

use crate::identity::{OrderLog, OrderRegistry, OrderUpdate, Resolution, TradeRegistry};

pub type SharedState = Arc<RwLock<TradingState>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub connection: ConnectionState,
    pub server_available: bool,
    /// Selects the backup host on the next connect.
    pub backup_server: bool,
    pub reconnect_deadline: Option<Instant>,
    pub last_error: Option<String>,
}

/// Session-level changes applied by the ingestion thread in queue order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Clears per-session reference data before a new connect.
    Reset,
    Transition(ConnectionState),
    /// An order this session just submitted, with its attribution.
    OrderSubmitted(Order),
}

#[derive(Debug, Default)]
pub struct TradingState {
    pub session: SessionStatus,
    pub securities: HashMap<String, Security>,
    pub markets: HashMap<u32, Market>,
    pub candle_kinds: HashMap<u32, CandleKind>,
    pub clients: HashMap<String, ClientAccount>,
    pub orders: OrderRegistry,
    pub order_log: OrderLog,
    pub trades: TradeRegistry,
    pub positions: HashMap<String, SecPosition>,
    pub money: HashMap<String, MoneyPosition>,
    pub limits: HashMap<String, UnitedLimits>,
    pub portfolios: HashMap<String, PortfolioSnapshot>,
    pub account: Option<AccountSnapshot>,
    pub series: HashMap<String, InstrumentSeries>,
    pub series_config: SeriesConfig,
}

impl TradingState {
    pub fn new(series_config: SeriesConfig) -> Self {
        Self {
            series_config,
            ..Self::default()
        }
    }

    pub fn shared(series_config: SeriesConfig) -> SharedState {
        Arc::new(RwLock::new(Self::new(series_config)))
    }

    pub fn apply_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Reset => self.reset_session(),
            SessionEvent::Transition(connection) => {
                // A locally requested transition ends any server-side recovery window.
                self.session.connection = connection;
                self.session.reconnect_deadline = None;
                if connection == ConnectionState::Disconnected {
                    self.session.server_available = false;
                }
            }
            SessionEvent::OrderSubmitted(order) => {
                self.orders.insert_local(order, &mut self.order_log);
            }
        }
    }

    /// Drops reference data the server re-sends on every session.
    pub fn reset_session(&mut self) {
        self.securities.clear();
        self.markets.clear();
        self.candle_kinds.clear();
        self.clients.clear();
    }

    pub fn resolve_order(&mut self, update: OrderUpdate, now: NaiveDateTime) -> Resolution {
        self.orders.resolve(update, &mut self.order_log, now)
    }

    pub fn record_trade(&mut self, trade: Trade) -> bool {
        self.trades.record(trade, &self.orders, &self.order_log)
    }

    pub fn series_mut(&mut self, seccode: &str) -> &mut InstrumentSeries {
        let config = self.series_config;
        self.series
            .entry(seccode.to_string())
            .or_insert_with(|| InstrumentSeries::new(seccode, config))
    }

    pub fn candle_kind_for(&self, timeframe: Timeframe) -> Option<&CandleKind> {
        self.candle_kinds
            .values()
            .filter(|kind| kind.timeframe().is_ok_and(|tf| tf == timeframe))
            .min_by_key(|kind| kind.id)
    }

    /// Retention hook: forgets finished orders and trades older than `cutoff`.
    pub fn prune_before(&mut self, cutoff: NaiveDateTime) -> usize {
        self.orders.prune_before(cutoff) + self.trades.prune_before(cutoff)
    }
}

#[derive(Debug, Clone)]
pub struct StateView {
    inner: SharedState,
}

impl StateView {
    pub fn new(inner: SharedState) -> Self {
        Self { inner }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.read().session.connection
    }

    /// Instant after which a recovering session counts as lost.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.read().session.reconnect_deadline
    }

    pub fn session(&self) -> SessionStatus {
        self.read().session.clone()
    }

    pub fn security(&self, seccode: &str) -> Option<Security> {
        self.read().securities.get(seccode).cloned()
    }

    pub fn securities(&self) -> Vec<Security> {
        self.read().securities.values().cloned().collect()
    }

    pub fn markets(&self) -> Vec<Market> {
        self.read().markets.values().cloned().collect()
    }

    pub fn candle_kinds(&self) -> Vec<CandleKind> {
        let mut kinds: Vec<CandleKind> = self.read().candle_kinds.values().cloned().collect();
        kinds.sort_by_key(|k| k.id);
        kinds
    }

    pub fn candle_kind_for(&self, timeframe: Timeframe) -> Option<CandleKind> {
        self.read().candle_kind_for(timeframe).cloned()
    }

    pub fn clients(&self) -> Vec<ClientAccount> {
        self.read().clients.values().cloned().collect()
    }

    pub fn order_by_transaction(&self, transaction_id: u64) -> Option<Order> {
        self.read().orders.by_transaction(transaction_id).cloned()
    }

    pub fn order_by_number(&self, order_no: u64) -> Option<Order> {
        self.read().orders.by_order_no(order_no).cloned()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.read().orders.iter().cloned().collect()
    }

    pub fn trade(&self, trade_no: u64) -> Option<Trade> {
        self.read().trades.get(trade_no).cloned()
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.read().trades.iter().cloned().collect()
    }

    pub fn position(&self, seccode: &str) -> Option<SecPosition> {
        self.read().positions.get(seccode).cloned()
    }

    pub fn money(&self, shortname: &str) -> Option<MoneyPosition> {
        self.read().money.get(shortname).cloned()
    }

    pub fn limits(&self, union: &str) -> Option<UnitedLimits> {
        self.read().limits.get(union).cloned()
    }

    pub fn portfolio(&self, union: &str) -> Option<PortfolioSnapshot> {
        self.read().portfolios.get(union).cloned()
    }

    pub fn account(&self) -> Option<AccountSnapshot> {
        self.read().account.clone()
    }

    pub fn series(&self, seccode: &str) -> Option<SeriesSnapshot> {
        self.read().series.get(seccode).and_then(|s| s.snapshot())
    }

    fn read(&self) -> RwLockReadGuard<'_, TradingState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}
