use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::constant::Side;

/// One anonymous market print from the tick stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickPrint {
    pub seccode: String,
    pub datetime: NaiveDateTime,
    pub price: f64,
    pub quantity: f64,
    pub side: Option<Side>,
    pub trade_no: Option<u64>,
    pub open_interest: Option<f64>,
}
