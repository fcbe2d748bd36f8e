pub mod constant;
pub mod id_generator;
pub mod logging;
pub mod order;
pub mod position;
pub mod reference;
pub mod security;
pub mod tick;

pub use constant::{ConnectionState, ModelError, OrderStatus, Side, Timeframe};
pub use id_generator::IdGenerator;
pub use logging::init_logging;
pub use order::{Attribution, Order, OrderCondition, Trade};
pub use position::{
    AccountSnapshot, MoneyPosition, PortfolioPosition, PortfolioSnapshot, SecPosition,
    UnitedLimits,
};
pub use reference::{CandleKind, ClientAccount, Market};
pub use security::{decimals_of_step, PriceBounds, Security, SecurityInfo, SecurityKey};
pub use tick::TickPrint;
