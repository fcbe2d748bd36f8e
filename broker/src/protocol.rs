use std::fmt;
use std::time::Instant;

use tradelink::{Attribution, ConnectionState, SecurityKey, Side, Timeframe};
use zeroize::Zeroizing;

use crate::error::BrokerError;
use crate::state::StateView;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Secrets are zeroed when the value is dropped and never printed.
#[derive(Clone)]
pub enum Credentials {
    Login {
        login: String,
        password: Zeroizing<String>,
        server: Option<ServerAddress>,
    },
    ApiKey {
        key: String,
        secret: Zeroizing<String>,
    },
}

impl Credentials {
    pub fn login(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Login {
            login: login.into(),
            password: Zeroizing::new(password.into()),
            server: None,
        }
    }

    pub fn api_key(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::ApiKey {
            key: key.into(),
            secret: Zeroizing::new(secret.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login { login, server, .. } => f
                .debug_struct("Login")
                .field("login", login)
                .field("password", &"***")
                .field("server", server)
                .finish(),
            Self::ApiKey { key, .. } => f
                .debug_struct("ApiKey")
                .field("key", key)
                .field("secret", &"***")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub security: SecurityKey,
    pub side: Side,
    /// Zero for market orders.
    pub price: f64,
    pub quantity: f64,
    pub by_market: bool,
    pub client: Option<String>,
    pub union: Option<String>,
    pub attribution: Attribution,
}

impl OrderRequest {
    pub fn limit(security: SecurityKey, side: Side, price: f64, quantity: f64) -> Result<Self, BrokerError> {
        validate_security(&security)?;
        if !(price.is_finite() && price > 0.0) {
            return Err(BrokerError::InvalidRequest(format!("price must be positive, got {price}")));
        }
        validate_quantity(quantity)?;
        Ok(Self {
            security,
            side,
            price,
            quantity,
            by_market: false,
            client: None,
            union: None,
            attribution: Attribution::default(),
        })
    }

    pub fn market(security: SecurityKey, side: Side, quantity: f64) -> Result<Self, BrokerError> {
        validate_security(&security)?;
        validate_quantity(quantity)?;
        Ok(Self {
            security,
            side,
            price: 0.0,
            quantity,
            by_market: true,
            client: None,
            union: None,
            attribution: Attribution::default(),
        })
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    pub fn with_union(mut self, union: impl Into<String>) -> Self {
        self.union = Some(union.into());
        self
    }

    pub fn with_attribution(mut self, attribution: Attribution) -> Self {
        self.attribution = attribution;
        self
    }
}

/// Moves a working order. `quantity: None` keeps the current quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaceRequest {
    pub security: SecurityKey,
    pub transaction_id: u64,
    pub order_no: Option<u64>,
    pub price: f64,
    pub quantity: Option<f64>,
}

impl ReplaceRequest {
    pub fn new(security: SecurityKey, transaction_id: u64, price: f64) -> Result<Self, BrokerError> {
        validate_security(&security)?;
        if !(price.is_finite() && price > 0.0) {
            return Err(BrokerError::InvalidRequest(format!("price must be positive, got {price}")));
        }
        Ok(Self {
            security,
            transaction_id,
            order_no: None,
            price,
            quantity: None,
        })
    }

    pub fn with_quantity(mut self, quantity: f64) -> Result<Self, BrokerError> {
        validate_quantity(quantity)?;
        self.quantity = Some(quantity);
        Ok(self)
    }

    pub fn with_order_no(mut self, order_no: u64) -> Self {
        self.order_no = Some(order_no);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub security: SecurityKey,
    pub transaction_id: u64,
    pub order_no: Option<u64>,
}

impl CancelRequest {
    pub fn new(security: SecurityKey, transaction_id: u64) -> Result<Self, BrokerError> {
        validate_security(&security)?;
        Ok(Self {
            security,
            transaction_id,
            order_no: None,
        })
    }

    pub fn with_order_no(mut self, order_no: u64) -> Self {
        self.order_no = Some(order_no);
        self
    }
}

/// Acknowledgement that a command was accepted for processing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandReceipt {
    pub transaction_id: Option<u64>,
    pub order_no: Option<u64>,
}

/// Uniform command surface over every venue.
///
/// `Ok` only means the request was accepted. Its effects arrive later
/// through the ingestion thread and become visible in [`Connector::state`].
pub trait Connector: Send {
    fn venue(&self) -> &str;
    fn connect(&mut self, credentials: Credentials) -> Result<(), BrokerError>;
    fn disconnect(&mut self) -> Result<(), BrokerError>;

    fn send_order(&mut self, request: &OrderRequest) -> Result<CommandReceipt, BrokerError>;
    fn replace_order(&mut self, request: &ReplaceRequest) -> Result<CommandReceipt, BrokerError>;
    fn cancel_order(&mut self, request: &CancelRequest) -> Result<CommandReceipt, BrokerError>;

    fn subscribe(&mut self, security: &SecurityKey) -> Result<(), BrokerError>;
    fn unsubscribe(&mut self, security: &SecurityKey) -> Result<(), BrokerError>;

    fn request_historical_bars(
        &mut self,
        security: &SecurityKey,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<(), BrokerError>;
    fn request_security_info(&mut self, security: &SecurityKey) -> Result<(), BrokerError>;
    fn request_portfolio_info(&mut self) -> Result<(), BrokerError>;

    fn state(&self) -> StateView;

    fn connection_state(&self) -> ConnectionState {
        self.state().connection_state()
    }

    /// Set while the server restores a dropped session.
    fn reconnect_deadline(&self) -> Option<Instant> {
        self.state().reconnect_deadline()
    }

    fn heartbeat(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

fn validate_security(security: &SecurityKey) -> Result<(), BrokerError> {
    if security.seccode.trim().is_empty() {
        return Err(BrokerError::InvalidRequest("security code is empty".to_string()));
    }
    Ok(())
}

fn validate_quantity(quantity: f64) -> Result<(), BrokerError> {
    if !(quantity.is_finite() && quantity > 0.0) {
        return Err(BrokerError::InvalidRequest(format!(
            "quantity must be positive, got {quantity}"
        )));
    }
    Ok(())
}
