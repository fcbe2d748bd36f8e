use serde::{Deserialize, Serialize};

use crate::tick::TickPrint;

/// Board + code pair used to address an instrument in commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityKey {
    pub board: String,
    pub seccode: String,
}

impl SecurityKey {
    pub fn new(board: impl Into<String>, seccode: impl Into<String>) -> Self {
        Self {
            board: board.into(),
            seccode: seccode.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceBounds {
    pub min_price: f64,
    pub max_price: f64,
}

/// Per-instrument risk and margin parameters (`sec_info`, `cln_sec_permissions`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub name: Option<String>,
    pub maturity: Option<String>,
    pub clearing_price: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub buy_deposit: Option<f64>,
    pub sell_deposit: Option<f64>,
    pub point_cost: Option<f64>,
    pub riskrate_long: Option<f64>,
    pub reserate_long: Option<f64>,
    pub riskrate_short: Option<f64>,
    pub reserate_short: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Security {
    pub seccode: String,
    pub secid: Option<u32>,
    pub board: String,
    pub market: Option<u32>,
    pub shortname: String,
    pub currency: String,
    pub active: bool,
    pub decimals: u32,
    pub min_step: f64,
    pub lot_size: f64,
    pub point_cost: f64,
    #[serde(default)]
    pub price_bounds: Option<PriceBounds>,
    #[serde(default)]
    pub min_notional: Option<f64>,
    #[serde(default)]
    pub info: SecurityInfo,
    #[serde(default)]
    pub last_trade: Option<TickPrint>,
}

impl Security {
    pub fn new(seccode: impl Into<String>, board: impl Into<String>) -> Self {
        Self {
            seccode: seccode.into(),
            secid: None,
            board: board.into(),
            market: None,
            shortname: String::new(),
            currency: String::new(),
            active: true,
            decimals: 2,
            min_step: 0.01,
            lot_size: 1.0,
            point_cost: 1.0,
            price_bounds: None,
            min_notional: None,
            info: SecurityInfo::default(),
            last_trade: None,
        }
    }

    pub fn key(&self) -> SecurityKey {
        SecurityKey::new(self.board.clone(), self.seccode.clone())
    }

    pub fn round_price(&self, price: f64) -> f64 {
        let rounded = if self.min_step > 0.0 {
            (price / self.min_step).round() * self.min_step
        } else {
            price
        };
        let scale = 10f64.powi(self.decimals as i32);
        (rounded * scale).round() / scale
    }

    /// Fixed-point text with exactly `decimals` digits and a `.` separator.
    pub fn format_price(&self, price: f64) -> String {
        format!("{:.*}", self.decimals as usize, self.round_price(price))
    }
}

/// Number of fractional digits in a step such as `0.0100` or `1e-5`.
pub fn decimals_of_step(step: f64) -> u32 {
    if step <= 0.0 {
        return 0;
    }
    let mut decimals = 0u32;
    let mut scaled = step;
    while decimals < 12 && (scaled - scaled.round()).abs() > 1e-9 * scaled.max(1.0) {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}

#[cfg(test)]
mod tests {
    use super::{decimals_of_step, Security};

    #[test]
    fn format_price_is_fixed_point_on_step_grid() {
        let mut security = Security::new("ABC", "TQBR");
        security.decimals = 2;
        security.min_step = 0.05;
        assert_eq!(security.format_price(101.234), "101.25");
        assert_eq!(security.format_price(7.0), "7.00");

        security.decimals = 0;
        security.min_step = 1.0;
        assert_eq!(security.format_price(65432.6), "65433");
    }

    #[test]
    fn step_decimals() {
        assert_eq!(decimals_of_step(0.01), 2);
        assert_eq!(decimals_of_step(0.10000000), 1);
        assert_eq!(decimals_of_step(1.0), 0);
        assert_eq!(decimals_of_step(0.00001), 5);
    }
}
