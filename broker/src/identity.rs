//! Order and trade identity resolution.
//!
//! A transaction id is issued per command and is transient; the broker order
//! number is the durable key once it is known. Two transaction ids only ever
//! resolve to the same order through a shared order number.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDateTime;
use tracing::{debug, warn};
use tradelink::{Attribution, Order, OrderCondition, OrderStatus, Side, Trade};

/// Fields decoded from one order update. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderUpdate {
    pub transaction_id: u64,
    /// `None` while the broker still reports order number `0`.
    pub order_no: Option<u64>,
    pub seccode: Option<String>,
    pub board: Option<String>,
    pub client: Option<String>,
    pub union: Option<String>,
    pub side: Option<Side>,
    pub status: Option<OrderStatus>,
    pub placed_at: Option<NaiveDateTime>,
    pub accepted_at: Option<NaiveDateTime>,
    pub withdrawn_at: Option<NaiveDateTime>,
    pub price: Option<f64>,
    pub quantity: Option<f64>,
    pub balance: Option<f64>,
    pub condition: Option<OrderCondition>,
    pub result: Option<String>,
}

impl OrderUpdate {
    pub fn new(transaction_id: u64) -> Self {
        Self {
            transaction_id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resolution {
    pub transaction_id: u64,
    pub order_no: Option<u64>,
    pub created: bool,
    pub promoted: bool,
    pub duplicates_removed: usize,
    pub status_changed: bool,
}

/// Attribution of locally issued orders, looked up when the broker pushes an
/// order or trade this session cannot attribute on its own.
#[derive(Debug, Clone, Default)]
pub struct OrderLog {
    by_transaction: HashMap<u64, Attribution>,
    by_order_no: HashMap<u64, Attribution>,
}

impl OrderLog {
    pub fn record(&mut self, transaction_id: u64, attribution: Attribution) {
        if attribution.is_known() {
            self.by_transaction.insert(transaction_id, attribution);
        }
    }

    /// Makes a transaction's attribution reachable by its order number.
    pub fn link(&mut self, transaction_id: u64, order_no: u64) {
        if let Some(attribution) = self.by_transaction.get(&transaction_id) {
            self.by_order_no
                .entry(order_no)
                .or_insert_with(|| attribution.clone());
        }
    }

    pub fn for_transaction(&self, transaction_id: u64) -> Option<&Attribution> {
        self.by_transaction.get(&transaction_id)
    }

    pub fn for_order_no(&self, order_no: u64) -> Option<&Attribution> {
        self.by_order_no.get(&order_no)
    }

    pub fn len(&self) -> usize {
        self.by_transaction.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_transaction.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderRegistry {
    orders: Vec<Order>,
}

impl OrderRegistry {
    /// Rebuilds a registry from retained orders as-is; duplicates are cleaned
    /// up by the next update that references them.
    pub fn restore(orders: Vec<Order>) -> Self {
        Self { orders }
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Order> {
        self.orders.iter()
    }

    pub fn by_transaction(&self, transaction_id: u64) -> Option<&Order> {
        self.orders.iter().find(|o| o.has_transaction_id(transaction_id))
    }

    pub fn by_order_no(&self, order_no: u64) -> Option<&Order> {
        self.orders.iter().find(|o| o.order_no == Some(order_no))
    }

    /// Inserts an order as submitted by this session, unless the broker
    /// already reported it.
    pub fn insert_local(&mut self, order: Order, log: &mut OrderLog) {
        for transaction_id in &order.transaction_ids {
            log.record(*transaction_id, order.attribution.clone());
        }
        let Some(transaction_id) = order.primary_transaction_id() else {
            return;
        };
        match self.orders.iter_mut().find(|o| o.has_transaction_id(transaction_id)) {
            Some(existing) => {
                if !existing.attribution.is_known() {
                    existing.attribution = order.attribution;
                }
                if existing.placed_at.is_none() {
                    existing.placed_at = order.placed_at;
                }
            }
            None => self.orders.push(order),
        }
    }

    /// Applies one order update and returns how its identity was resolved.
    pub fn resolve(&mut self, update: OrderUpdate, log: &mut OrderLog, now: NaiveDateTime) -> Resolution {
        let transaction_id = update.transaction_id;
        let mut resolution = Resolution {
            transaction_id,
            order_no: update.order_no,
            ..Resolution::default()
        };

        resolution.duplicates_removed = self.remove_duplicates(transaction_id);

        let mut index = match self.position_by_transaction(transaction_id) {
            Some(index) => index,
            None => {
                self.orders.push(Order::new(transaction_id));
                resolution.created = true;
                self.orders.len() - 1
            }
        };

        if let Some(order_no) = update.order_no {
            let canonical = self
                .orders
                .iter()
                .enumerate()
                .find(|(i, o)| *i != index && o.order_no == Some(order_no))
                .map(|(i, _)| i);
            match canonical {
                Some(target) => {
                    let transient = self.orders.remove(index);
                    let target = if target > index { target - 1 } else { target };
                    let order = &mut self.orders[target];
                    for id in transient.transaction_ids {
                        order.attach_transaction_id(id);
                    }
                    if !order.attribution.is_known() && transient.attribution.is_known() {
                        order.attribution = transient.attribution;
                    }
                    debug!(transaction_id, order_no, "transaction id promoted onto existing order");
                    resolution.promoted = true;
                    index = target;
                }
                None => self.orders[index].order_no = Some(order_no),
            }
            log.link(transaction_id, order_no);
        }

        let order = &mut self.orders[index];
        if let Some(seccode) = update.seccode {
            order.seccode = seccode;
        }
        if let Some(board) = update.board {
            order.board = board;
        }
        if update.client.is_some() {
            order.client = update.client;
        }
        if update.union.is_some() {
            order.union = update.union;
        }
        if update.side.is_some() {
            order.side = update.side;
        }
        if update.placed_at.is_some() {
            order.placed_at = update.placed_at;
        }
        if update.accepted_at.is_some() {
            order.accepted_at = update.accepted_at;
        }
        if update.withdrawn_at.is_some() {
            order.withdrawn_at = update.withdrawn_at;
        }
        if let Some(price) = update.price {
            order.price = price;
        }
        if let Some(quantity) = update.quantity {
            order.quantity = quantity;
        }
        if let Some(balance) = update.balance {
            order.balance = balance;
        }
        if update.condition.is_some() {
            order.condition = update.condition;
        }
        if update.result.is_some() {
            order.result = update.result;
        }
        if let Some(status) = update.status {
            resolution.status_changed = order.set_status(status, now);
        }
        if !order.attribution.is_known() {
            let recovered = order
                .transaction_ids
                .iter()
                .find_map(|id| log.for_transaction(*id))
                .or_else(|| order.order_no.and_then(|no| log.for_order_no(no)));
            if let Some(attribution) = recovered {
                order.attribution = attribution.clone();
            }
        }
        resolution.order_no = order.order_no;
        resolution
    }

    /// Drops finished orders whose last status change is older than `cutoff`.
    pub fn prune_before(&mut self, cutoff: NaiveDateTime) -> usize {
        let before = self.orders.len();
        self.orders.retain(|o| {
            o.status.is_live() || o.status_changed_at.is_none_or(|at| at >= cutoff)
        });
        before - self.orders.len()
    }

    fn position_by_transaction(&self, transaction_id: u64) -> Option<usize> {
        self.orders.iter().position(|o| o.has_transaction_id(transaction_id))
    }

    fn remove_duplicates(&mut self, transaction_id: u64) -> usize {
        let holders: Vec<usize> = self
            .orders
            .iter()
            .enumerate()
            .filter(|(_, o)| o.has_transaction_id(transaction_id))
            .map(|(i, _)| i)
            .collect();
        if holders.len() < 2 {
            return 0;
        }
        let keep = holders
            .iter()
            .copied()
            .find(|i| self.orders[*i].order_no.is_some())
            .unwrap_or(holders[0]);
        let mut index = 0;
        self.orders.retain(|_| {
            let retain = index == keep || !holders.contains(&index);
            index += 1;
            retain
        });
        let removed = holders.len() - 1;
        warn!(transaction_id, removed, "duplicate orders share one transaction id");
        removed
    }
}

#[derive(Debug, Clone, Default)]
pub struct TradeRegistry {
    trades: BTreeMap<u64, Trade>,
}

impl TradeRegistry {
    /// Records a trade once per trade number; returns `false` for a replay.
    pub fn record(&mut self, mut trade: Trade, orders: &OrderRegistry, log: &OrderLog) -> bool {
        if self.trades.contains_key(&trade.trade_no) {
            debug!(trade_no = trade.trade_no, "trade already recorded");
            return false;
        }
        if !trade.attribution.is_known() {
            if let Some(order_no) = trade.order_no {
                let recovered = orders
                    .by_order_no(order_no)
                    .map(|o| &o.attribution)
                    .filter(|a| a.is_known())
                    .or_else(|| log.for_order_no(order_no));
                if let Some(attribution) = recovered {
                    trade.attribution = attribution.clone();
                }
            }
        }
        self.trades.insert(trade.trade_no, trade);
        true
    }

    pub fn get(&self, trade_no: u64) -> Option<&Trade> {
        self.trades.get(&trade_no)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trade> {
        self.trades.values()
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn prune_before(&mut self, cutoff: NaiveDateTime) -> usize {
        let before = self.trades.len();
        self.trades.retain(|_, t| t.time.is_none_or(|time| time >= cutoff));
        before - self.trades.len()
    }
}
