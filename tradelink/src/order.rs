use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::constant::{OrderStatus, Side};

/// Who issued an order and why; recovered from the local order log when the
/// broker pushes an order this session did not submit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub sender: Option<String>,
    pub signal: Option<String>,
    pub note: Option<String>,
}

impl Attribution {
    pub fn is_known(&self) -> bool {
        self.sender.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderCondition {
    pub kind: String,
    pub value: Option<f64>,
    pub valid_after: Option<NaiveDateTime>,
    pub valid_before: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Every transaction id that resolves to this order; the first one is the
    /// id it was created with.
    pub transaction_ids: Vec<u64>,
    /// Broker order number, `None` while the broker still reports `0`.
    pub order_no: Option<u64>,
    pub seccode: String,
    pub board: String,
    pub client: Option<String>,
    pub union: Option<String>,
    pub side: Option<Side>,
    pub status: OrderStatus,
    pub status_changed_at: Option<NaiveDateTime>,
    pub placed_at: Option<NaiveDateTime>,
    pub accepted_at: Option<NaiveDateTime>,
    pub withdrawn_at: Option<NaiveDateTime>,
    pub price: f64,
    pub quantity: f64,
    pub balance: f64,
    pub condition: Option<OrderCondition>,
    pub result: Option<String>,
    pub attribution: Attribution,
}

impl Order {
    pub fn new(transaction_id: u64) -> Self {
        Self {
            transaction_ids: vec![transaction_id],
            order_no: None,
            seccode: String::new(),
            board: String::new(),
            client: None,
            union: None,
            side: None,
            status: OrderStatus::Forwarding,
            status_changed_at: None,
            placed_at: None,
            accepted_at: None,
            withdrawn_at: None,
            price: 0.0,
            quantity: 0.0,
            balance: 0.0,
            condition: None,
            result: None,
            attribution: Attribution::default(),
        }
    }

    pub fn primary_transaction_id(&self) -> Option<u64> {
        self.transaction_ids.first().copied()
    }

    pub fn has_transaction_id(&self, transaction_id: u64) -> bool {
        self.transaction_ids.contains(&transaction_id)
    }

    pub fn attach_transaction_id(&mut self, transaction_id: u64) {
        if !self.has_transaction_id(transaction_id) {
            self.transaction_ids.push(transaction_id);
        }
    }

    /// Applies a status and stamps the change time when the status moved.
    pub fn set_status(&mut self, status: OrderStatus, at: NaiveDateTime) -> bool {
        if self.status == status && self.status_changed_at.is_some() {
            return false;
        }
        self.status = status;
        self.status_changed_at = Some(at);
        true
    }

    pub fn filled(&self) -> f64 {
        (self.quantity - self.balance).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_no: u64,
    pub order_no: Option<u64>,
    pub seccode: String,
    pub board: String,
    pub side: Option<Side>,
    pub price: f64,
    pub quantity: f64,
    pub time: Option<NaiveDateTime>,
    pub value: Option<f64>,
    pub commission: Option<f64>,
    pub attribution: Attribution,
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::Order;
    use crate::OrderStatus;

    #[test]
    fn status_change_refreshes_timestamp_only_on_transition() {
        let t0 = NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
            .expect("valid datetime");
        let t1 = t0 + chrono::Duration::seconds(5);

        let mut order = Order::new(7);
        assert!(order.set_status(OrderStatus::Active, t0));
        assert!(!order.set_status(OrderStatus::Active, t1));
        assert_eq!(order.status_changed_at, Some(t0));
        assert!(order.set_status(OrderStatus::Matched, t1));
        assert_eq!(order.status_changed_at, Some(t1));
    }

    #[test]
    fn attaching_same_transaction_id_twice_is_noop() {
        let mut order = Order::new(1);
        order.attach_transaction_id(2);
        order.attach_transaction_id(2);
        assert_eq!(order.transaction_ids, vec![1, 2]);
        assert_eq!(order.primary_transaction_id(), Some(1));
    }
}
