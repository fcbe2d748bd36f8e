//! Static per-session reference data.

use serde::{Deserialize, Serialize};

use crate::constant::{ModelError, Timeframe};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub id: u32,
    pub name: String,
}

/// A candle period offered by the broker, addressed by id in history requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleKind {
    pub id: u32,
    pub period_secs: u32,
    pub name: String,
}

impl CandleKind {
    pub fn timeframe(&self) -> Result<Timeframe, ModelError> {
        Timeframe::from_seconds(self.period_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAccount {
    pub id: String,
    pub market: Option<u32>,
    pub currency: Option<String>,
    pub kind: Option<String>,
    pub union: Option<String>,
    pub forts_account: Option<String>,
}
