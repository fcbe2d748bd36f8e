use serde::{Deserialize, Serialize};

/// Instrument position (`sec_position`, `forts_position`, REST `positions[]`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecPosition {
    pub seccode: String,
    pub market: Option<u32>,
    pub client: Option<String>,
    pub open_balance: f64,
    pub balance: f64,
    pub pl: f64,
    pub amount: Option<f64>,
    pub equity: Option<f64>,
    pub entry_price: Option<f64>,
}

/// Cash balance in one currency or asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MoneyPosition {
    pub shortname: String,
    pub open_balance: f64,
    pub balance: f64,
    pub unrealized_pnl: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitedLimits {
    pub union: String,
    pub open_equity: Option<f64>,
    pub equity: f64,
    pub requirements: f64,
    pub free: f64,
    pub vm: f64,
    pub finres: f64,
    pub go: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPosition {
    pub seccode: String,
    pub market: Option<u32>,
    pub open_balance: f64,
    pub balance: f64,
    pub pl: f64,
}

/// Union-level portfolio (`mc_portfolio`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub union: String,
    pub open_equity: f64,
    pub equity: f64,
    pub pl: f64,
    pub init_req: f64,
    pub maint_req: f64,
    pub unrealized_pnl: f64,
    pub positions: Vec<PortfolioPosition>,
}

/// Futures account totals from the REST account snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub total_initial_margin: f64,
    pub total_maint_margin: f64,
    pub total_wallet_balance: f64,
    pub total_unrealized_profit: f64,
}
