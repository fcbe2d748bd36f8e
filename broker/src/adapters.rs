pub mod binance;
pub mod mock;
pub mod transaq;

pub use binance::{BinanceConfig, BinanceConnector};
pub use mock::MockTransport;
pub use transaq::{TransaqConfig, TransaqConnector};
